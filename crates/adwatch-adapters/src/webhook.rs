//! Fire-and-forget notification sink used once the enrichment circuit
//! breaker is open.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct NotificationSink {
    url: String,
    client: reqwest::Client,
}

impl NotificationSink {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("building webhook client")?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    /// Best-effort delivery of one textual payload. Failures are
    /// logged and swallowed; the pipeline never waits on or aborts for
    /// this call.
    pub async fn notify(&self, payload: String) {
        match self
            .client
            .post(&self.url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(payload)
            .send()
            .await
        {
            Ok(resp) => debug!(status = %resp.status(), "webhook delivered"),
            Err(err) => warn!(error = %err, "webhook delivery failed"),
        }
    }
}
