//! Order submission gated on the machine status.

use std::sync::Arc;

use shared::{
    catalog::{PrepareCocktailRequest, PrepareCocktailResponse},
    domain::CocktailId,
};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::{api::MachineApi, error::OrderError, status::MachineStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub cocktail_id: CocktailId,
    pub special_instructions: Option<String>,
}

impl Order {
    pub fn new(cocktail_id: CocktailId) -> Self {
        Self {
            cocktail_id,
            special_instructions: None,
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.special_instructions = Some(instructions.into());
        self
    }
}

/// The controller accepted the order. Completion or failure follows as
/// `operation_completed` / `operation_failed` on the event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderAccepted {
    pub cocktail_id: CocktailId,
    pub drink: Option<String>,
    pub message: Option<String>,
}

pub struct OrderCoordinator {
    api: Arc<dyn MachineApi>,
    status: watch::Receiver<MachineStatus>,
    in_flight: watch::Sender<bool>,
}

struct InFlight<'a>(&'a watch::Sender<bool>);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.send_replace(false);
    }
}

impl OrderCoordinator {
    pub fn new(api: Arc<dyn MachineApi>, status: watch::Receiver<MachineStatus>) -> Self {
        Self {
            api,
            status,
            in_flight: watch::Sender::new(false),
        }
    }

    pub fn is_submitting(&self) -> bool {
        *self.in_flight.borrow()
    }

    /// Flips to `true` while a submission is waiting on the controller.
    pub fn watch_submitting(&self) -> watch::Receiver<bool> {
        self.in_flight.subscribe()
    }

    /// Checks the local gate and forwards the order to the controller.
    ///
    /// The machine status is not modified here; the controller is the final
    /// arbiter when two clients race for an idle machine.
    pub async fn submit_order(&self, order: Order) -> Result<OrderAccepted, OrderError> {
        let busy_with = self
            .status
            .borrow()
            .current_operation()
            .map(str::to_string);
        if let Some(operation) = busy_with {
            info!(
                cocktail_id = %order.cocktail_id,
                operation = %operation,
                "order refused: machine busy"
            );
            return Err(OrderError::MachineBusy { operation });
        }

        let claimed = self.in_flight.send_if_modified(|in_flight| {
            if *in_flight {
                return false;
            }
            *in_flight = true;
            true
        });
        if !claimed {
            return Err(OrderError::OrderInFlight);
        }
        let _guard = InFlight(&self.in_flight);

        info!(cocktail_id = %order.cocktail_id, "submitting order");
        let request = PrepareCocktailRequest {
            special_instructions: order.special_instructions,
        };
        match self.api.prepare_cocktail(order.cocktail_id, &request).await {
            Ok(PrepareCocktailResponse { message, drink, .. }) => {
                info!(cocktail_id = %order.cocktail_id, drink = ?drink, "order accepted");
                Ok(OrderAccepted {
                    cocktail_id: order.cocktail_id,
                    drink,
                    message,
                })
            }
            Err(err) => {
                warn!(cocktail_id = %order.cocktail_id, error = %err, "order submission failed");
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/orders_tests.rs"]
mod tests;
