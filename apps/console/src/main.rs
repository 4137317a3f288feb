use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    load_settings, view::NoticeKind, ClientSettings, MachineNotice, MachineSession, MachineStatus,
    Notice, Order, ViewState,
};
use shared::{
    catalog::AssignSlotRequest,
    domain::{BottleId, CocktailId, SlotId},
    protocol::{EventKind, ServerEvent},
};
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    StreamExt,
};
use tokio::sync::watch;
use tracing::warn;
use tracing_subscriber::EnvFilter;

const GREETING_WAIT: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "velvetpour", about = "Terminal client for a VelvetPour machine")]
struct Args {
    /// Controller base URL, overrides client.toml and APP__SERVER_URL.
    #[arg(long, global = true)]
    server_url: Option<String>,
    /// Event channel URL when it is not `<server-url>/ws`.
    #[arg(long, global = true)]
    transport_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Follow connection and machine status until interrupted.
    Watch {
        /// Send a liveness ping every N seconds.
        #[arg(long)]
        ping_secs: Option<u64>,
    },
    /// List the cocktails that can be poured right now.
    Menu {
        /// Only show cocktails whose name or ingredients match.
        #[arg(long)]
        search: Option<String>,
    },
    /// Order a cocktail and wait for the machine to finish it.
    Order {
        cocktail_id: i64,
        #[arg(long)]
        note: Option<String>,
        /// Give up waiting for the outcome after this many seconds.
        #[arg(long, default_value_t = 120)]
        wait_secs: u64,
    },
    /// Show which bottle is mounted on each slot.
    Slots,
    /// Mount a bottle on a slot, or empty the slot when no bottle is given.
    Assign { slot: i64, bottle_id: Option<i64> },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings().context("failed to load client settings")?;
    apply_overrides(&mut settings, &args);
    let session = MachineSession::new(settings)?;

    match args.command {
        Command::Watch { ping_secs } => watch(&session, ping_secs).await,
        Command::Menu { search } => menu(&session, search.as_deref()).await,
        Command::Order {
            cocktail_id,
            note,
            wait_secs,
        } => order(&session, CocktailId(cocktail_id), note, Duration::from_secs(wait_secs)).await,
        Command::Slots => slots(&session).await,
        Command::Assign { slot, bottle_id } => {
            assign(&session, SlotId(slot), bottle_id.map(BottleId)).await
        }
    }
}

fn apply_overrides(settings: &mut ClientSettings, args: &Args) {
    if let Some(url) = &args.server_url {
        settings.server_url = url.clone();
    }
    if let Some(url) = &args.transport_url {
        settings.transport_url = Some(url.clone());
    }
}

fn print_state(state: &ViewState) {
    let machine = match state.machine.current_operation() {
        Some(operation) => format!("busy ({operation})"),
        None => "available".to_string(),
    };
    println!(
        "[{}] machine {machine}, {} client(s) connected, order: {}",
        state.connection_label(),
        state.machine.connected_clients,
        state.order_availability().label()
    );
}

fn print_notice(notice: &MachineNotice) {
    let notice = Notice::from_machine(notice);
    let marker = match notice.kind {
        NoticeKind::Success => "ok",
        NoticeKind::Failure => "!!",
    };
    println!("{marker} {}", notice.text);
}

async fn watch(session: &MachineSession, ping_secs: Option<u64>) -> Result<()> {
    let _messages = session.on(EventKind::Message, |event| {
        if let ServerEvent::Message(message) = event {
            println!("controller: {}", message.message.as_deref().unwrap_or(""));
        }
        Ok(())
    });
    let _pongs = session.on(EventKind::PongClient, |_| {
        println!("pong");
        Ok(())
    });

    let mut view = session.view();
    let mut notices = BroadcastStream::new(session.notices());
    if let Err(err) = session.start().await {
        warn!(error = %err, "first connection attempt failed; retrying in background");
    }
    print_state(&view.snapshot());

    let mut ping = tokio::time::interval(Duration::from_secs(ping_secs.unwrap_or(30).max(1)));
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);
    loop {
        tokio::select! {
            state = view.changed() => match state {
                Some(state) => print_state(&state),
                None => break,
            },
            notice = notices.next() => match notice {
                Some(Ok(notice)) => print_notice(&notice),
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    warn!(skipped, "missed machine notices");
                }
                None => break,
            },
            _ = ping.tick(), if ping_secs.is_some() => {
                if let Err(err) = session.ping_server() {
                    warn!(error = %err, "ping not sent");
                }
            }
            _ = &mut interrupted => break,
        }
    }

    session.shutdown().await;
    Ok(())
}

async fn menu(session: &MachineSession, search: Option<&str>) -> Result<()> {
    let catalog = session.load_catalog().await?;
    let cocktails = catalog.search(search.unwrap_or_default());
    if cocktails.is_empty() {
        println!("no cocktails available");
    }
    for cocktail in cocktails {
        println!("#{} {}", cocktail.id, cocktail.name);
        for line in catalog.ingredient_lines(cocktail) {
            let name = line
                .name
                .unwrap_or_else(|| format!("bottle {}", line.bottle_id));
            println!("    {:>6.1}  {name}", line.amount);
        }
        if !cocktail.instructions.is_empty() {
            println!("    {}", cocktail.instructions);
        }
    }
    Ok(())
}

async fn order(
    session: &MachineSession,
    cocktail_id: CocktailId,
    note: Option<String>,
    wait: Duration,
) -> Result<()> {
    let mut notices = session.notices();
    let mut statuses = session.tracker().watch();
    session.start().await.context("machine is not reachable")?;

    // The greeting snapshot decides whether the machine can take the order.
    if !await_greeting(&mut statuses, GREETING_WAIT).await? {
        warn!("no status snapshot yet; using the last known machine status");
    }

    let mut order = Order::new(cocktail_id);
    if let Some(note) = note {
        order = order.with_instructions(note);
    }
    let accepted = match session.submit_order(order).await {
        Ok(accepted) => accepted,
        Err(err) => {
            session.shutdown().await;
            return Err(err.into());
        }
    };
    println!(
        "order accepted: {}",
        accepted
            .drink
            .as_deref()
            .or(accepted.message.as_deref())
            .unwrap_or("preparing")
    );

    let outcome = tokio::time::timeout(wait, async {
        loop {
            match notices.recv().await {
                Ok(notice) => return Ok(notice),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(err) => return Err(anyhow!("notice channel closed: {err}")),
            }
        }
    })
    .await;
    session.shutdown().await;

    let notice = outcome.map_err(|_| anyhow!("no outcome within {}s", wait.as_secs()))??;
    print_notice(&notice);
    match notice {
        MachineNotice::Completed { .. } => Ok(()),
        MachineNotice::Failed { .. } => Err(anyhow!("the machine could not prepare the order")),
    }
}

/// Waits for the first status push seen by `statuses`. The receiver must be
/// created before the session starts so an early greeting is not missed.
async fn await_greeting(
    statuses: &mut watch::Receiver<MachineStatus>,
    wait: Duration,
) -> Result<bool> {
    match tokio::time::timeout(wait, statuses.changed()).await {
        Ok(Ok(())) => Ok(true),
        Ok(Err(_)) => Err(anyhow!("status tracker closed")),
        Err(_) => Ok(false),
    }
}

async fn slots(session: &MachineSession) -> Result<()> {
    for slot in session.api().list_slot_assignments().await? {
        print_slot(&slot);
    }
    Ok(())
}

async fn assign(session: &MachineSession, slot: SlotId, bottle_id: Option<BottleId>) -> Result<()> {
    let slots = session
        .api()
        .assign_bottle(&AssignSlotRequest { slot, bottle_id })
        .await?;
    for slot in &slots {
        print_slot(slot);
    }
    Ok(())
}

fn print_slot(slot: &shared::catalog::SlotAssignment) {
    match (&slot.name, slot.bottle_id) {
        (Some(name), _) => println!("slot {}: {name}", slot.slot),
        (None, Some(bottle)) => println!("slot {}: bottle {bottle}", slot.slot),
        (None, None) => println!("slot {}: empty", slot.slot),
    }
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
