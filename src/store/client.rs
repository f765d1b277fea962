//! REST client for the accounts/stats service

use reqwest::Client;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

use crate::config::Config;

/// Requests to the accounts service give up after this long
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for the accounts service. Unconfigured clients fail every call
/// with [`StoreError::NotConfigured`].
#[derive(Clone)]
pub struct AccountsClient {
    client: Client,
    base_url: Option<String>,
}

impl AccountsClient {
    pub fn new(config: &Config) -> Self {
        Self::with_base_url(config.accounts_api_url.clone())
    }

    pub fn with_base_url(base_url: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: base_url.map(|url| url.trim_end_matches('/').to_string()),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.base_url.is_some()
    }

    /// Full URL for an API path
    fn api_url(&self, path: &str) -> Result<String, StoreError> {
        let base = self.base_url.as_deref().ok_or(StoreError::NotConfigured)?;
        Ok(format!("{}{}", base, path))
    }

    /// GET with query parameters, decoding a JSON body
    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, StoreError> {
        let url = self.api_url(path)?;

        let response = self
            .client
            .get(&url)
            .query(query)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(StoreError::Request)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Api {
                status: status.as_u16(),
                body,
            });
        }

        response.json().await.map_err(StoreError::Parse)
    }

    /// POST a JSON body, ignoring the response body
    pub async fn post<T: Serialize>(&self, path: &str, data: &T) -> Result<(), StoreError> {
        let url = self.api_url(path)?;

        let response = self
            .client
            .post(&url)
            .json(data)
            .send()
            .await
            .map_err(StoreError::Request)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Api {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }
}

/// Accounts service errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Accounts service URL is not configured")]
    NotConfigured,

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error (status {status}): {body}")]
    Api { status: u16, body: String },

    #[error("Failed to parse response: {0}")]
    Parse(reqwest::Error),

    #[error("Service refused the request: {0}")]
    Refused(String),
}
