//! Catalog and inventory records served by the controller's REST surface.
//!
//! The controller's historical column names (`img_path`, `oz`, `handlerId`,
//! `bottle_id`) are accepted as aliases so older payloads still decode.

use serde::{Deserialize, Serialize};

use crate::domain::{BottleId, CocktailId, SlotId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ingredient {
    #[serde(alias = "bottle_id", alias = "bottleId")]
    pub id: BottleId,
    #[serde(alias = "oz")]
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cocktail {
    pub id: CocktailId,
    pub name: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub ingredients: Vec<Ingredient>,
    #[serde(default, alias = "img_path", skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bottle {
    pub id: BottleId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, rename = "assignedSlot", alias = "handlerId", alias = "assigned_slot")]
    pub assigned_slot: Option<SlotId>,
}

/// One physical dispensing position and the bottle mounted on it, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotAssignment {
    #[serde(alias = "id")]
    pub slot: SlotId,
    #[serde(default, alias = "bottle_id")]
    pub bottle_id: Option<BottleId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, alias = "descr", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignSlotRequest {
    pub slot: SlotId,
    /// `None` unmounts whatever bottle currently occupies the slot.
    #[serde(default)]
    pub bottle_id: Option<BottleId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareCocktailRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub special_instructions: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareCocktailResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drink: Option<String>,
}

impl PrepareCocktailResponse {
    pub fn is_error(&self) -> bool {
        self.status.eq_ignore_ascii_case("error")
    }
}
