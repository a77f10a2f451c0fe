//! Desired state pulled page by page from the control plane's bulk API.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use vigil_control::{
    DesiredStateProvider, DropletSink, MessageBus, ProviderError, ProviderResult,
};
use vigil_types::{DesiredState, DropletId};

use crate::config::{BulkConfig, BulkCredentials};
use crate::error::DaemonResult;

/// One page of `GET /bulk/apps`. Records are decoded one by one so a bad
/// entry only loses that droplet.
#[derive(Debug, Deserialize)]
struct BulkPage {
    #[serde(default)]
    results: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    bulk_token: serde_json::Value,
}

/// HTTP provider for the bulk API.
///
/// Credentials come from the static configuration or, failing that, from a
/// request on the credentials subject. They are cached until the API answers
/// 401.
pub struct BulkDesiredStateProvider {
    client: Client,
    api_url: String,
    config: BulkConfig,
    bus: Arc<dyn MessageBus>,
    credentials_topic: String,
    cached: Mutex<Option<BulkCredentials>>,
}

impl BulkDesiredStateProvider {
    pub fn new(
        api_url: impl Into<String>,
        config: BulkConfig,
        bus: Arc<dyn MessageBus>,
        credentials_topic: impl Into<String>,
    ) -> DaemonResult<Self> {
        let client = Client::builder().timeout(config.request_timeout()).build()?;
        let api_url: String = api_url.into();

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            config,
            bus,
            credentials_topic: credentials_topic.into(),
            cached: Mutex::new(None),
        })
    }

    async fn credentials(&self) -> ProviderResult<BulkCredentials> {
        if let Some(credentials) = self.cached.lock().await.clone() {
            return Ok(credentials);
        }

        let credentials = match &self.config.credentials {
            Some(credentials) => credentials.clone(),
            None => {
                debug!(topic = %self.credentials_topic, "Requesting bulk API credentials");
                let reply = self
                    .bus
                    .request(
                        &self.credentials_topic,
                        b"{}".to_vec(),
                        self.config.credentials_timeout(),
                    )
                    .await?;
                reply.decode::<BulkCredentials>()?
            }
        };

        *self.cached.lock().await = Some(credentials.clone());
        Ok(credentials)
    }

    async fn fetch_page(
        &self,
        credentials: &BulkCredentials,
        token: &serde_json::Value,
    ) -> ProviderResult<BulkPage> {
        let url = format!("{}/bulk/apps", self.api_url);
        let response = self
            .client
            .get(&url)
            .basic_auth(&credentials.user, Some(&credentials.password))
            .query(&[
                ("batch_size", self.config.batch_size.to_string()),
                ("bulk_token", token.to_string()),
            ])
            .send()
            .await
            .map_err(|err| ProviderError::Fetch(err.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            warn!("Bulk API rejected credentials, dropping them");
            *self.cached.lock().await = None;
            return Err(ProviderError::Unauthorized);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Fetch(format!("{status}: {message}")));
        }

        response
            .json()
            .await
            .map_err(|err| ProviderError::Decode(err.to_string()))
    }
}

#[async_trait]
impl DesiredStateProvider for BulkDesiredStateProvider {
    async fn each_droplet(&self, sink: &mut DropletSink<'_>) -> ProviderResult<usize> {
        let credentials = self.credentials().await?;
        let mut token = serde_json::json!({});
        let mut count = 0;

        loop {
            let page = self.fetch_page(&credentials, &token).await?;
            if page.results.is_empty() {
                break;
            }
            debug!(droplets = page.results.len(), "Received bulk page");
            for (id, record) in page.results {
                match serde_json::from_value::<DesiredState>(record) {
                    Ok(desired) => {
                        sink(DropletId::new(id), desired);
                        count += 1;
                    }
                    Err(err) => {
                        warn!(droplet = %id, error = %err, "Skipping malformed bulk record");
                    }
                }
            }
            token = page.bulk_token;
        }

        info!(droplets = count, "Bulk desired state fetched");
        Ok(count)
    }
}
