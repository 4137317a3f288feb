use super::*;
use async_trait::async_trait;
use shared::{
    catalog::{
        AssignSlotRequest, Ingredient, PrepareCocktailRequest, PrepareCocktailResponse,
        SlotAssignment,
    },
    domain::SlotId,
};

fn bottle(id: i64, name: &str) -> Bottle {
    Bottle {
        id: BottleId(id),
        name: name.to_string(),
        kind: "spirit".to_string(),
        assigned_slot: Some(SlotId(id)),
    }
}

fn cocktail(id: i64, name: &str, bottles: &[i64]) -> Cocktail {
    Cocktail {
        id: CocktailId(id),
        name: name.to_string(),
        instructions: String::new(),
        ingredients: bottles
            .iter()
            .map(|id| Ingredient {
                id: BottleId(*id),
                amount: 1.0,
            })
            .collect(),
        image: None,
    }
}

fn snapshot() -> CatalogSnapshot {
    CatalogSnapshot {
        cocktails: vec![
            cocktail(1, "Margarita", &[4, 5]),
            cocktail(2, "Vodka Martini", &[1, 9]),
        ],
        bottles: vec![
            bottle(1, "Vodka"),
            bottle(4, "Tequila"),
            bottle(5, "Triple Sec"),
        ],
    }
}

struct StaticApi {
    bottles: Result<Vec<Bottle>, ApiRequestError>,
}

#[async_trait]
impl MachineApi for StaticApi {
    async fn list_cocktails(&self) -> Result<Vec<Cocktail>, ApiRequestError> {
        Ok(snapshot().cocktails)
    }

    async fn get_cocktail(&self, id: CocktailId) -> Result<Cocktail, ApiRequestError> {
        snapshot()
            .cocktail(id)
            .cloned()
            .ok_or_else(|| ApiRequestError::Rejected {
                path: format!("/getDrinkData/{id}"),
                status: 404,
                reason: None,
            })
    }

    async fn list_bottles(&self) -> Result<Vec<Bottle>, ApiRequestError> {
        self.bottles.clone()
    }

    async fn list_slot_assignments(&self) -> Result<Vec<SlotAssignment>, ApiRequestError> {
        Ok(Vec::new())
    }

    async fn assign_bottle(
        &self,
        _request: &AssignSlotRequest,
    ) -> Result<Vec<SlotAssignment>, ApiRequestError> {
        Ok(Vec::new())
    }

    async fn prepare_cocktail(
        &self,
        _id: CocktailId,
        _request: &PrepareCocktailRequest,
    ) -> Result<PrepareCocktailResponse, ApiRequestError> {
        unimplemented!("catalog tests never order")
    }
}

#[test]
fn resolves_ingredient_names_from_bottles() {
    let catalog = snapshot();
    let martini = catalog.cocktail(CocktailId(2)).unwrap();

    let lines = catalog.ingredient_lines(martini);

    assert_eq!(lines[0].name.as_deref(), Some("Vodka"));
    assert_eq!(lines[1].bottle_id, BottleId(9));
    assert_eq!(lines[1].name, None);
}

#[test]
fn search_matches_names_and_ingredients() {
    let catalog = snapshot();

    let names = |query: &str| -> Vec<String> {
        catalog
            .search(query)
            .into_iter()
            .map(|cocktail| cocktail.name.clone())
            .collect()
    };

    assert_eq!(names("marg"), ["Margarita"]);
    assert_eq!(names("TEQUILA"), ["Margarita"]);
    assert_eq!(names("vodka"), ["Vodka Martini"]);
    assert_eq!(names("  "), ["Margarita", "Vodka Martini"]);
    assert!(names("rum").is_empty());
}

#[tokio::test]
async fn load_catalog_fetches_both_lists() {
    let api = StaticApi {
        bottles: Ok(snapshot().bottles),
    };

    let catalog = load_catalog(&api).await.expect("catalog");

    assert_eq!(catalog, snapshot());
    assert_eq!(catalog.bottle(BottleId(5)).unwrap().name, "Triple Sec");
}

#[tokio::test]
async fn load_catalog_fails_when_either_list_fails() {
    let api = StaticApi {
        bottles: Err(ApiRequestError::Network {
            path: "/getBottles".to_string(),
            message: "timed out".to_string(),
        }),
    };

    assert!(matches!(
        load_catalog(&api).await,
        Err(ApiRequestError::Network { .. })
    ));
}
