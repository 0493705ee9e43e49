//! Push snapshot diffs to a proxy's config endpoint

use async_trait::async_trait;
use reqwest::Client;
use router_api::PublisherConfig;
use router_core::{PushError, SnapshotDiff, SnapshotSink};
use std::time::Duration;
use tracing::debug;

/// Header carrying the snapshot version a diff moves the receiver to.
pub const VERSION_HEADER: &str = "X-Discovery-Version";

/// HttpPushSink POSTs each [`SnapshotDiff`] as JSON.
///
/// Any 2xx counts as delivered. Other statuses map to
/// [`PushError::Rejected`] and connection problems to
/// [`PushError::Transport`]; the push worker retries both.
pub struct HttpPushSink {
    http: Client,
    url: String,
}

impl HttpPushSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, PushError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PushError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }

    /// Sink for `publisher.push_url`, or `None` when push is disabled.
    pub fn from_config(config: &PublisherConfig) -> Result<Option<Self>, PushError> {
        match &config.push_url {
            Some(url) => Self::new(url.clone(), config.push_timeout()).map(Some),
            None => Ok(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl SnapshotSink for HttpPushSink {
    async fn push(&self, diff: &SnapshotDiff) -> Result<(), PushError> {
        let response = self
            .http
            .post(&self.url)
            .header(VERSION_HEADER, diff.to_version.to_string())
            .json(diff)
            .send()
            .await
            .map_err(|e| PushError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PushError::Rejected(status.as_u16()));
        }

        debug!(url = %self.url, version = diff.to_version, "Snapshot diff accepted");
        Ok(())
    }
}
