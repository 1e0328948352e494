//! One-shot probes against the server's REST surface.

use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::transport::{TransportError, api_base_url, api_url};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Address(#[from] TransportError),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Health {
    pub status: String,
}

impl Health {
    pub fn is_ok(&self) -> bool {
        self.status.eq_ignore_ascii_case("ok")
    }
}

#[derive(Deserialize)]
struct Online {
    online: u64,
}

#[derive(Debug, Clone)]
pub struct ServerApi {
    client: Client,
    base: Url,
}

impl ServerApi {
    pub fn new(server: &str) -> Result<Self, ApiError> {
        Ok(Self {
            client: Client::new(),
            base: api_base_url(server)?,
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub async fn health(&self) -> Result<Health, ApiError> {
        let url = api_url(&self.base, &["health"]);
        debug!(target = "stranger::api", url = %url, "probing health");
        Ok(self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    /// Participants currently connected, over both transports.
    pub async fn online(&self) -> Result<u64, ApiError> {
        let url = api_url(&self.base, &["online"]);
        debug!(target = "stranger::api", url = %url, "fetching online count");
        let online: Online = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(online.online)
    }
}
