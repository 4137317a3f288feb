//! In-memory machine: catalog, slot assignments, status and event fan-out.

use std::sync::Mutex;

use chrono::Utc;
use shared::{
    catalog::{AssignSlotRequest, Bottle, Cocktail, Ingredient, SlotAssignment},
    domain::{BottleId, CocktailId, MachineStatusKind, SlotId},
    protocol::{
        OperationCompleted, OperationFailed, OperationStarted, ServerEvent, StatusSnapshot,
    },
};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::info;

pub const SLOT_COUNT: i64 = 6;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MachineError {
    #[error("Machine is busy preparing {0}")]
    Busy(String),
    #[error("Item not found")]
    CocktailNotFound,
    #[error("unknown slot {0}")]
    UnknownSlot(SlotId),
    #[error("unknown bottle {0}")]
    UnknownBottle(BottleId),
    #[error("{0} needs bottles that are not mounted")]
    NotPourable(String),
}

/// A pour that has been started and must be finished with
/// [`Machine::finish_pour`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pour {
    pub cocktail_id: CocktailId,
    pub drink: String,
    pub ingredients: usize,
}

struct Inventory {
    bottles: Vec<Bottle>,
    cocktails: Vec<Cocktail>,
    /// Indexed by slot id - 1.
    slots: Vec<Option<BottleId>>,
}

pub struct Machine {
    inventory: Mutex<Inventory>,
    status: Mutex<StatusSnapshot>,
    events: broadcast::Sender<ServerEvent>,
}

impl Machine {
    pub fn new(event_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Self {
            inventory: Mutex::new(seed_inventory()),
            status: Mutex::new(StatusSnapshot::available(0)),
            events,
        }
    }

    fn inventory(&self) -> std::sync::MutexGuard<'_, Inventory> {
        self.inventory
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn status_guard(&self) -> std::sync::MutexGuard<'_, StatusSnapshot> {
        self.status
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    pub fn status(&self) -> StatusSnapshot {
        self.status_guard().clone()
    }

    /// Registers a new event channel client and returns the snapshot it
    /// should be greeted with.
    pub fn client_connected(&self) -> StatusSnapshot {
        let mut status = self.status_guard();
        status.connected_clients += 1;
        info!(connected_clients = status.connected_clients, "client connected");
        status.clone()
    }

    pub fn client_disconnected(&self) {
        let mut status = self.status_guard();
        status.connected_clients = status.connected_clients.saturating_sub(1);
        info!(connected_clients = status.connected_clients, "client disconnected");
    }

    pub fn bottles(&self) -> Vec<Bottle> {
        let inventory = self.inventory();
        let mut bottles: Vec<Bottle> = inventory
            .bottles
            .iter()
            .map(|bottle| Bottle {
                assigned_slot: slot_of(&inventory.slots, bottle.id),
                ..bottle.clone()
            })
            .collect();
        bottles.sort_by(|a, b| a.kind.cmp(&b.kind).then(a.id.cmp(&b.id)));
        bottles
    }

    pub fn slot_assignments(&self) -> Vec<SlotAssignment> {
        let inventory = self.inventory();
        assignments(&inventory)
    }

    /// Cocktails with at least one ingredient on a mounted bottle.
    pub fn available_cocktails(&self) -> Vec<Cocktail> {
        let inventory = self.inventory();
        let mut cocktails: Vec<Cocktail> = inventory
            .cocktails
            .iter()
            .filter(|cocktail| {
                cocktail
                    .ingredients
                    .iter()
                    .any(|ingredient| slot_of(&inventory.slots, ingredient.id).is_some())
            })
            .cloned()
            .collect();
        cocktails.sort_by(|a, b| a.name.cmp(&b.name));
        cocktails
    }

    pub fn cocktail(&self, id: CocktailId) -> Option<Cocktail> {
        self.inventory()
            .cocktails
            .iter()
            .find(|cocktail| cocktail.id == id)
            .cloned()
    }

    pub fn assign(&self, request: &AssignSlotRequest) -> Result<Vec<SlotAssignment>, MachineError> {
        let mut inventory = self.inventory();
        let index = usize::try_from(request.slot.0 - 1)
            .ok()
            .filter(|index| *index < inventory.slots.len())
            .ok_or(MachineError::UnknownSlot(request.slot))?;

        if let Some(bottle_id) = request.bottle_id {
            if !inventory.bottles.iter().any(|bottle| bottle.id == bottle_id) {
                return Err(MachineError::UnknownBottle(bottle_id));
            }
            for slot in inventory.slots.iter_mut() {
                if *slot == Some(bottle_id) {
                    *slot = None;
                }
            }
        }
        inventory.slots[index] = request.bottle_id;
        info!(slot = %request.slot, bottle_id = ?request.bottle_id, "slot assignment changed");
        Ok(assignments(&inventory))
    }

    /// Moves the machine to busy and announces the pour. Only one pour can
    /// run at a time.
    pub fn begin_pour(&self, id: CocktailId) -> Result<Pour, MachineError> {
        let cocktail = self.cocktail(id).ok_or(MachineError::CocktailNotFound)?;
        {
            let inventory = self.inventory();
            let missing = cocktail
                .ingredients
                .iter()
                .any(|ingredient| slot_of(&inventory.slots, ingredient.id).is_none());
            if missing {
                return Err(MachineError::NotPourable(cocktail.name));
            }
        }

        let now = Utc::now();
        {
            let mut status = self.status_guard();
            if let Some(operation) = &status.current_operation {
                return Err(MachineError::Busy(operation.clone()));
            }
            status.status = MachineStatusKind::Busy;
            status.current_operation = Some(cocktail.name.clone());
            status.start_time = Some(now);
        }

        info!(cocktail_id = %id, drink = %cocktail.name, "pour started");
        self.publish(ServerEvent::OperationStarted(OperationStarted {
            operation: cocktail.name.clone(),
            time: Some(now),
            message: Some(format!("Machine is busy preparing: {}", cocktail.name)),
        }));
        Ok(Pour {
            cocktail_id: id,
            drink: cocktail.name,
            ingredients: cocktail.ingredients.len(),
        })
    }

    /// Returns the machine to available and announces the outcome.
    pub fn finish_pour(&self, pour: &Pour, failure: Option<String>) {
        {
            let mut status = self.status_guard();
            status.status = MachineStatusKind::Available;
            status.current_operation = None;
            status.start_time = None;
        }

        let drink = pour.drink.clone();
        match failure {
            None => {
                info!(drink = %drink, "pour completed");
                self.publish(ServerEvent::OperationCompleted(OperationCompleted {
                    message: Some(format!("Machine has finished preparing: {drink}")),
                    operation: Some(drink),
                }));
            }
            Some(error) => {
                info!(drink = %drink, error = %error, "pour failed");
                self.publish(ServerEvent::OperationFailed(OperationFailed {
                    message: Some(format!("Failed to prepare {drink}: {error}")),
                    operation: Some(drink),
                    error: Some(error),
                }));
            }
        }
    }
}

fn slot_of(slots: &[Option<BottleId>], bottle_id: BottleId) -> Option<SlotId> {
    slots
        .iter()
        .position(|slot| *slot == Some(bottle_id))
        .map(|index| SlotId(index as i64 + 1))
}

fn assignments(inventory: &Inventory) -> Vec<SlotAssignment> {
    inventory
        .slots
        .iter()
        .enumerate()
        .map(|(index, bottle_id)| {
            let bottle = bottle_id
                .and_then(|id| inventory.bottles.iter().find(|bottle| bottle.id == id));
            SlotAssignment {
                slot: SlotId(index as i64 + 1),
                bottle_id: *bottle_id,
                name: bottle.map(|bottle| bottle.name.clone()),
                description: bottle.map(|bottle| bottle.kind.clone()),
            }
        })
        .collect()
}

fn seed_inventory() -> Inventory {
    let bottle = |id: i64, name: &str, kind: &str| Bottle {
        id: BottleId(id),
        name: name.to_string(),
        kind: kind.to_string(),
        assigned_slot: None,
    };
    let pour = |id: i64, amount: f64| Ingredient {
        id: BottleId(id),
        amount,
    };

    let mut slots = vec![None; SLOT_COUNT as usize];
    slots[0] = Some(BottleId(1));
    slots[1] = Some(BottleId(4));
    slots[2] = Some(BottleId(5));

    Inventory {
        bottles: vec![
            bottle(1, "Vodka", "Spirit"),
            bottle(2, "Gin", "Spirit"),
            bottle(3, "Rum", "Spirit"),
            bottle(4, "Tequila", "Spirit"),
            bottle(5, "Triple Sec", "Liqueur"),
        ],
        cocktails: vec![
            Cocktail {
                id: CocktailId(1),
                name: "Margarita".to_string(),
                instructions: "Mix tequila, triple sec, and lime juice".to_string(),
                ingredients: vec![pour(4, 60.0), pour(5, 30.0)],
                image: None,
            },
            Cocktail {
                id: CocktailId(2),
                name: "Vodka Martini".to_string(),
                instructions: "Mix vodka with dry vermouth".to_string(),
                ingredients: vec![pour(1, 60.0)],
                image: None,
            },
            Cocktail {
                id: CocktailId(3),
                name: "Cuba Libre".to_string(),
                instructions: "Rum over ice, top with cola".to_string(),
                ingredients: vec![pour(3, 50.0)],
                image: None,
            },
        ],
        slots,
    }
}

#[cfg(test)]
#[path = "tests/machine_tests.rs"]
mod tests;
