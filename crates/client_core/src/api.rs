//! Request layer for the controller's REST surface.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    catalog::{
        AssignSlotRequest, Bottle, Cocktail, PrepareCocktailRequest, PrepareCocktailResponse,
        SlotAssignment,
    },
    domain::CocktailId,
    error::ApiErrorBody,
};
use tracing::{debug, warn};
use url::Url;

use crate::error::ApiRequestError;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// One-shot request/response capability against the machine controller.
#[async_trait]
pub trait MachineApi: Send + Sync {
    /// Cocktails that can be poured with the currently mounted bottles.
    async fn list_cocktails(&self) -> Result<Vec<Cocktail>, ApiRequestError>;
    async fn get_cocktail(&self, id: CocktailId) -> Result<Cocktail, ApiRequestError>;
    async fn list_bottles(&self) -> Result<Vec<Bottle>, ApiRequestError>;
    async fn list_slot_assignments(&self) -> Result<Vec<SlotAssignment>, ApiRequestError>;
    async fn assign_bottle(
        &self,
        request: &AssignSlotRequest,
    ) -> Result<Vec<SlotAssignment>, ApiRequestError>;
    /// A successful response only means the order was accepted; completion
    /// arrives on the event channel.
    async fn prepare_cocktail(
        &self,
        id: CocktailId,
        request: &PrepareCocktailRequest,
    ) -> Result<PrepareCocktailResponse, ApiRequestError>;
}

pub struct HttpMachineApi {
    http: Client,
    server_url: String,
}

impl HttpMachineApi {
    pub fn new(server_url: &Url, timeout: Duration) -> Result<Self, ApiRequestError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ApiRequestError::Client(err.to_string()))?;
        Ok(Self::with_client(http, server_url))
    }

    pub fn with_client(http: Client, server_url: &Url) -> Self {
        Self {
            http,
            server_url: server_url.as_str().trim_end_matches('/').to_string(),
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiRequestError> {
        let response = self
            .http
            .get(format!("{}{path}", self.server_url))
            .send()
            .await
            .map_err(|err| network(path, &err))?;
        read_json(path, response).await
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, ApiRequestError>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .http
            .post(format!("{}{path}", self.server_url))
            .json(body)
            .send()
            .await
            .map_err(|err| network(path, &err))?;
        read_json(path, response).await
    }
}

fn network(path: &str, err: &reqwest::Error) -> ApiRequestError {
    warn!(path, error = %err, "request to machine controller failed");
    ApiRequestError::Network {
        path: path.to_string(),
        message: err.to_string(),
    }
}

async fn read_json<T: DeserializeOwned>(
    path: &str,
    response: Response,
) -> Result<T, ApiRequestError> {
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|err| network(path, &err))?;

    if !status.is_success() {
        let reason = serde_json::from_slice::<ApiErrorBody>(&body)
            .ok()
            .and_then(|body| body.reason().map(str::to_string))
            .or_else(|| {
                let text = String::from_utf8_lossy(&body).trim().to_string();
                (!text.is_empty()).then_some(text)
            });
        warn!(path, status = status.as_u16(), reason = ?reason, "machine controller rejected request");
        return Err(ApiRequestError::Rejected {
            path: path.to_string(),
            status: status.as_u16(),
            reason,
        });
    }

    debug!(path, status = status.as_u16(), bytes = body.len(), "machine controller responded");
    serde_json::from_slice(&body).map_err(|err| ApiRequestError::Decode {
        path: path.to_string(),
        message: err.to_string(),
    })
}

#[async_trait]
impl MachineApi for HttpMachineApi {
    async fn list_cocktails(&self) -> Result<Vec<Cocktail>, ApiRequestError> {
        self.get_json("/getDrinkAvaiable").await
    }

    async fn get_cocktail(&self, id: CocktailId) -> Result<Cocktail, ApiRequestError> {
        self.get_json(&format!("/getDrinkData/{id}")).await
    }

    async fn list_bottles(&self) -> Result<Vec<Bottle>, ApiRequestError> {
        self.get_json("/getBottles").await
    }

    async fn list_slot_assignments(&self) -> Result<Vec<SlotAssignment>, ApiRequestError> {
        self.get_json("/getBottlesMounted").await
    }

    async fn assign_bottle(
        &self,
        request: &AssignSlotRequest,
    ) -> Result<Vec<SlotAssignment>, ApiRequestError> {
        self.post_json("/postBottlesMounted", request).await
    }

    async fn prepare_cocktail(
        &self,
        id: CocktailId,
        request: &PrepareCocktailRequest,
    ) -> Result<PrepareCocktailResponse, ApiRequestError> {
        let path = format!("/prepCocktail/{id}");
        let response: PrepareCocktailResponse = self.post_json(&path, request).await?;
        if response.is_error() {
            return Err(ApiRequestError::Rejected {
                path,
                status: 200,
                reason: response.message,
            });
        }
        Ok(response)
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
