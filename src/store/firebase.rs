// =============================================================================
// Firebase Realtime Database REST client
// =============================================================================
//
// Documents live at `<root>/<collection>/<symbol>.json`. `PUT` replaces the
// node wholesale, which is exactly the publish contract; `GET` returns `null`
// for a node that was never written.
//
// The auth token (database secret or ID token) is passed as `?auth=` and is
// never logged. reqwest errors carry the request URL, so it is stripped before
// an error leaves this module.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument};

use super::StoreAdapter;
use crate::error::IngestError;

/// REST adapter for one instrument's nodes in a Firebase Realtime Database.
#[derive(Clone)]
pub struct FirebaseStore {
    base_url: String,
    symbol: String,
    auth_token: Option<String>,
    client: reqwest::Client,
}

impl FirebaseStore {
    /// Build a client whose every request is bounded by `timeout`.
    pub fn new(
        base_url: impl Into<String>,
        symbol: impl Into<String>,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build store HTTP client")?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        debug!(base_url = %base_url, "FirebaseStore initialised");

        Ok(Self {
            base_url,
            symbol: symbol.into(),
            auth_token,
            client,
        })
    }

    /// Node URL for a collection, without credentials.
    pub fn node_url(&self, collection: &str) -> String {
        format!("{}/{}/{}.json", self.base_url, collection, self.symbol)
    }

    fn request(&self, method: reqwest::Method, collection: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, self.node_url(collection));
        match &self.auth_token {
            Some(token) => builder.query(&[("auth", token)]),
            None => builder,
        }
    }

    async fn put(&self, collection: &str, document: &Value) -> Result<()> {
        let resp = self
            .request(reqwest::Method::PUT, collection)
            .json(document)
            .send()
            .await
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("PUT {collection} request failed"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("PUT {collection} returned {status}: {body}");
        }
        Ok(())
    }

    async fn get(&self, collection: &str) -> Result<Option<Value>> {
        let resp = self
            .request(reqwest::Method::GET, collection)
            .send()
            .await
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("GET {collection} request failed"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("GET {collection} returned {status}: {body}");
        }

        let body: Value = resp
            .json()
            .await
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("failed to parse {collection} response"))?;

        Ok(match body {
            Value::Null => None,
            other => Some(other),
        })
    }
}

#[async_trait]
impl StoreAdapter for FirebaseStore {
    #[instrument(skip(self, document), name = "firebase::replace")]
    async fn replace(&self, collection: &str, document: Value) -> Result<(), IngestError> {
        self.put(collection, &document)
            .await
            .map_err(|e| IngestError::StoreWrite {
                collection: collection.to_string(),
                message: format!("{e:#}"),
            })
    }

    #[instrument(skip(self), name = "firebase::read")]
    async fn read(&self, collection: &str) -> Result<Option<Value>, IngestError> {
        self.get(collection)
            .await
            .map_err(|e| IngestError::StoreRead {
                collection: collection.to_string(),
                message: format!("{e:#}"),
            })
    }
}
