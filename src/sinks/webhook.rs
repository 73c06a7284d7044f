//! Single sink posting each sample to an HTTP endpoint

use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{instrument, trace};

use crate::plexer::Observer;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct Payload<'a> {
    tags: &'a [String],
    data: &'a str,
}

pub struct WebhookObserver {
    client: Client,
    url: String,
}

impl WebhookObserver {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Observer for WebhookObserver {
    #[instrument(skip(self, tags, data), fields(url = %self.url))]
    async fn observe(&self, tags: Vec<String>, data: String) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&Payload {
                tags: &tags,
                data: &data,
            })
            .send()
            .await
            .with_context(|| format!("failed to reach {}", self.url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("webhook answered {status}: {body}");
        }

        trace!("delivered sample");
        Ok(())
    }
}
