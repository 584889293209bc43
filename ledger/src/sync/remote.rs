//! The remote authority a device reconciles against.
//!
//! [`RemoteAuthority`] is the seam: production devices talk HTTP through
//! [`HttpAuthority`], tests and single-process simulations plug in
//! [`crate::authority::Authority`] directly.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::protocol::{SyncRequest, SyncResponse};
use crate::config::SYNC_ENDPOINT;
use crate::transport::TransportError;

#[async_trait]
pub trait RemoteAuthority: Send + Sync {
    /// Submit one batch. `Err` means the authority could not be reached or
    /// did not answer sensibly; a verdict, even a negative one, is `Ok`.
    async fn submit(&self, request: &SyncRequest) -> Result<SyncResponse, TransportError>;
}

// ---------------------------------------------------------------------------
// HttpAuthority
// ---------------------------------------------------------------------------

/// `POST {base_url}/api/sync` over reqwest.
#[derive(Debug, Clone)]
pub struct HttpAuthority {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpAuthority {
    /// `timeout` bounds each request end to end, on top of the
    /// reconciler's own per-attempt timeout.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: format!("{}{}", base_url.trim_end_matches('/'), SYNC_ENDPOINT),
            timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn map_reqwest(e: reqwest::Error, timeout: Duration) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(timeout)
    } else if e.is_decode() {
        TransportError::Codec(e.to_string())
    } else if let Some(status) = e.status() {
        TransportError::Status(status.as_u16())
    } else {
        TransportError::Unreachable(e.to_string())
    }
}

#[async_trait]
impl RemoteAuthority for HttpAuthority {
    async fn submit(&self, request: &SyncRequest) -> Result<SyncResponse, TransportError> {
        debug!(endpoint = %self.endpoint, count = request.transactions.len(), "submitting sync batch");

        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| map_reqwest(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }

        response.json::<SyncResponse>().await.map_err(|e| map_reqwest(e, self.timeout))
    }
}
