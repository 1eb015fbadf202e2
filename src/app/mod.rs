use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::model::error::AppError;
use crate::services::delay_engine::DelayEngine;
use crate::services::delay_store::AnyDelayStore;
use crate::services::i_delay_store::DelayStore;
use crate::services::telemetry::{TelemetrySink, TracingSink};

#[derive(Debug)]
pub struct AppEnv<Store: DelayStore = AnyDelayStore, Sink: TelemetrySink = TracingSink> {
    pub engine: DelayEngine<Store>,
    pub sink: Sink,
    pub origin: OriginClient,
}

impl<Store, Sink> AppEnv<Store, Sink>
where
    Store: DelayStore,
    Sink: TelemetrySink,
{
    pub fn new(engine: DelayEngine<Store>, sink: Sink, origin: OriginClient) -> Self {
        Self {
            engine,
            sink,
            origin,
        }
    }
}

impl AppEnv {
    pub async fn from_config(cnf: &Config) -> Result<Self> {
        let store = AnyDelayStore::from_config(cnf)
            .await
            .context("failed to set up delay state store")?;
        tracing::info!("delay state store: {store:?}");
        let engine = DelayEngine::new(store, cnf.buffer_unit_rules());
        let origin = OriginClient::new(
            &cnf.origin_url,
            Duration::from_millis(cnf.origin_timeout_ms),
        )?;
        Ok(Self::new(engine, TracingSink, origin))
    }
}

/// Fetches media objects from the origin the delayed responses are built from.
#[derive(Debug, Clone)]
pub struct OriginClient {
    client: reqwest::Client,
    base_url: String,
}

impl OriginClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::ClientBuilder::new()
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(timeout)
            .build()
            .context("failed to build origin http client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn fetch(&self, path: &str, query: &str) -> Result<reqwest::Response, AppError> {
        let endpoint_url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut url = reqwest::Url::parse(&endpoint_url)?;
        if !query.is_empty() {
            url.set_query(Some(query));
        }
        tracing::debug!("url: {url}");
        Ok(self.client.get(url).send().await?)
    }
}
