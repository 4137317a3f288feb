//! Catalog view assembled from the request layer.

use std::collections::HashMap;

use shared::{
    catalog::{Bottle, Cocktail},
    domain::{BottleId, CocktailId},
};
use tracing::info;

use crate::{api::MachineApi, error::ApiRequestError};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogSnapshot {
    pub cocktails: Vec<Cocktail>,
    pub bottles: Vec<Bottle>,
}

/// An ingredient line with its bottle name resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct IngredientLine {
    pub bottle_id: BottleId,
    pub name: Option<String>,
    pub amount: f64,
}

impl CatalogSnapshot {
    pub fn cocktail(&self, id: CocktailId) -> Option<&Cocktail> {
        self.cocktails.iter().find(|cocktail| cocktail.id == id)
    }

    pub fn bottle(&self, id: BottleId) -> Option<&Bottle> {
        self.bottles.iter().find(|bottle| bottle.id == id)
    }

    pub fn ingredient_lines(&self, cocktail: &Cocktail) -> Vec<IngredientLine> {
        let names: HashMap<BottleId, &str> = self
            .bottles
            .iter()
            .map(|bottle| (bottle.id, bottle.name.as_str()))
            .collect();
        cocktail
            .ingredients
            .iter()
            .map(|ingredient| IngredientLine {
                bottle_id: ingredient.id,
                name: names.get(&ingredient.id).map(|name| name.to_string()),
                amount: ingredient.amount,
            })
            .collect()
    }

    /// Case-insensitive match on cocktail name or ingredient name.
    pub fn search(&self, query: &str) -> Vec<&Cocktail> {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return self.cocktails.iter().collect();
        }
        self.cocktails
            .iter()
            .filter(|cocktail| {
                cocktail.name.to_lowercase().contains(&query)
                    || self.ingredient_lines(cocktail).iter().any(|line| {
                        line.name
                            .as_deref()
                            .is_some_and(|name| name.to_lowercase().contains(&query))
                    })
            })
            .collect()
    }
}

/// Fetches cocktails and bottles concurrently.
pub async fn load_catalog(api: &dyn MachineApi) -> Result<CatalogSnapshot, ApiRequestError> {
    let (cocktails, bottles) = tokio::try_join!(api.list_cocktails(), api.list_bottles())?;
    info!(
        cocktails = cocktails.len(),
        bottles = bottles.len(),
        "catalog loaded"
    );
    Ok(CatalogSnapshot { cocktails, bottles })
}

#[cfg(test)]
#[path = "tests/catalog_tests.rs"]
mod tests;
