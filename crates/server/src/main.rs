use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{ws::WebSocket, Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use shared::{
    catalog::{AssignSlotRequest, Bottle, Cocktail, PrepareCocktailRequest, PrepareCocktailResponse, SlotAssignment},
    domain::CocktailId,
    error::ApiErrorBody,
    protocol::{decode_client_message, ClientMessage, Pong, ServerEvent},
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

mod config;
mod machine;

use config::{load_settings, Settings};
use machine::{Machine, MachineError, Pour};

#[derive(Debug, Parser)]
#[command(name = "velvetpour-server", about = "VelvetPour machine controller simulator")]
struct Args {
    /// Address to listen on, overrides server.toml and APP__BIND_ADDR.
    #[arg(long)]
    bind: Option<String>,
    /// Simulated pour time per ingredient in milliseconds.
    #[arg(long)]
    pour_delay_ms: Option<u64>,
}

#[derive(Clone)]
struct AppState {
    machine: Arc<Machine>,
    settings: Arc<Settings>,
}

type ApiError = (StatusCode, Json<ApiErrorBody>);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let args = Args::parse();
    let mut settings = load_settings();
    if let Some(bind) = args.bind {
        settings.server_bind = bind;
    }
    if let Some(delay) = args.pour_delay_ms {
        settings.pour_delay_ms = delay;
    }

    let state = AppState {
        machine: Arc::new(Machine::new(settings.event_buffer)),
        settings: Arc::new(settings),
    };
    let addr: SocketAddr = state.settings.server_bind.parse()?;
    let app = build_router(state);

    info!(%addr, "machine controller listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(welcome))
        .route("/getBottles", get(get_bottles))
        .route("/getBottlesMounted", get(get_bottles_mounted))
        .route("/postBottlesMounted", post(post_bottles_mounted))
        .route("/getDrinkAvaiable", get(get_drinks_available))
        .route("/getDrinkData/:id", get(get_drink_data))
        .route("/prepCocktail/:id", post(prep_cocktail))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

fn api_error(err: MachineError) -> ApiError {
    let status = match err {
        MachineError::Busy(_) => StatusCode::CONFLICT,
        MachineError::CocktailNotFound => StatusCode::NOT_FOUND,
        MachineError::UnknownSlot(_) | MachineError::UnknownBottle(_) => StatusCode::BAD_REQUEST,
        MachineError::NotPourable(_) => StatusCode::UNPROCESSABLE_ENTITY,
    };
    let body = match err {
        MachineError::CocktailNotFound => ApiErrorBody::new(err.to_string()),
        _ => ApiErrorBody::rejected(err.to_string()),
    };
    (status, Json(body))
}

async fn welcome() -> &'static str {
    "Welcome to the VelvetPour API"
}

async fn get_bottles(State(state): State<AppState>) -> Json<Vec<Bottle>> {
    Json(state.machine.bottles())
}

async fn get_bottles_mounted(State(state): State<AppState>) -> Json<Vec<SlotAssignment>> {
    Json(state.machine.slot_assignments())
}

async fn post_bottles_mounted(
    State(state): State<AppState>,
    Json(request): Json<AssignSlotRequest>,
) -> Result<Json<Vec<SlotAssignment>>, ApiError> {
    state.machine.assign(&request).map(Json).map_err(api_error)
}

async fn get_drinks_available(State(state): State<AppState>) -> Json<Vec<Cocktail>> {
    Json(state.machine.available_cocktails())
}

async fn get_drink_data(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Cocktail>, ApiError> {
    state
        .machine
        .cocktail(CocktailId(id))
        .map(Json)
        .ok_or_else(|| api_error(MachineError::CocktailNotFound))
}

/// Accepts the order and pours in the background; the outcome is announced
/// on the event channel.
async fn prep_cocktail(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    request: Option<Json<PrepareCocktailRequest>>,
) -> Result<Json<PrepareCocktailResponse>, ApiError> {
    let cocktail_id = CocktailId(id);
    let pour = state.machine.begin_pour(cocktail_id).map_err(|err| {
        warn!(cocktail_id = %cocktail_id, error = %err, "order refused");
        api_error(err)
    })?;
    if let Some(Json(PrepareCocktailRequest {
        special_instructions: Some(instructions),
    })) = &request
    {
        info!(cocktail_id = %cocktail_id, instructions = %instructions, "special instructions");
    }

    let message = format!("Preparing {}", pour.drink);
    let drink = pour.drink.clone();
    tokio::spawn(run_pour(state, pour));

    Ok(Json(PrepareCocktailResponse {
        status: "accepted".to_string(),
        message: Some(message),
        drink: Some(drink),
    }))
}

async fn run_pour(state: AppState, pour: Pour) {
    tokio::time::sleep(state.settings.pour_delay(pour.ingredients)).await;
    let failure = state
        .settings
        .fail_cocktails
        .contains(&pour.cocktail_id.0)
        .then(|| "dispenser reported a blocked valve".to_string());
    state.machine.finish_pour(&pour, failure);
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

async fn ws_connection(state: AppState, socket: WebSocket) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let mut events_rx = state.machine.subscribe();
    let greeting = state.machine.client_connected();
    let (direct_tx, mut direct_rx) = mpsc::channel::<ServerEvent>(16);

    let send_task = tokio::spawn(async move {
        let mut pending = Some(ServerEvent::StatusUpdate(greeting));
        loop {
            let event = match pending.take() {
                Some(event) => event,
                None => tokio::select! {
                    direct = direct_rx.recv() => match direct {
                        Some(event) => event,
                        None => break,
                    },
                    broadcast = events_rx.recv() => match broadcast {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "event channel client lagging");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                },
            };
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        let Message::Text(text) = msg else {
            continue;
        };
        match decode_client_message(&text) {
            Ok(ClientMessage::PingServer(ping)) => {
                debug!(time = %ping.time, "ping from client");
                let pong = ServerEvent::PongClient(Pong {
                    time: Some(chrono::Utc::now()),
                });
                if direct_tx.send(pong).await.is_err() {
                    break;
                }
            }
            Err(err) => warn!(error = %err, "ignoring client frame"),
        }
    }

    send_task.abort();
    state.machine.client_disconnected();
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
