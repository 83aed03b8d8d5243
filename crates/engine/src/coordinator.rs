//! HTTP client for the backend coordinator's upload API.
//!
//! One request, one response, no retries here: `initiate` and `complete`
//! failures fail the job, presign failures are absorbed by the
//! prefetcher's own retry loop.

use std::time::Duration;

use reqwest::Client;
use tracing::debug;

use loadstream_protocol::coordinator::{
    AbortRequest, CompleteRequest, CompleteResponse, InitiateRequest, InitiateResponse,
    PartReceipt, PresignResponse, PresignedUrl,
};
use loadstream_protocol::{MAX_PRESIGN_BATCH, OCTET_STREAM};

use crate::EngineError;

/// Deadline for coordinator round-trips (distinct from the per-part PUT
/// deadline, which is configured separately).
const COORDINATOR_TIMEOUT: Duration = Duration::from_secs(30);

/// The identifiers the coordinator needs on every follow-up call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRef {
    pub upload_id: String,
    pub bucket: String,
    pub object_key: String,
}

/// Client for the coordinator REST surface.
#[derive(Clone)]
pub struct CoordinatorClient {
    http: Client,
    base_url: String,
}

impl CoordinatorClient {
    /// Wraps a shared HTTP client. `base_url` is the coordinator root,
    /// with or without a trailing slash.
    pub fn new(http: Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `POST /api/upload/initiate`.
    pub async fn initiate(
        &self,
        file_name: &str,
        file_size: u64,
        fingerprint: &str,
    ) -> Result<InitiateResponse, EngineError> {
        let body = InitiateRequest {
            file_name: file_name.into(),
            file_size,
            file_fingerprint: fingerprint.into(),
            content_type: OCTET_STREAM.into(),
        };
        let resp = self
            .http
            .post(format!("{}/api/upload/initiate", self.base_url))
            .timeout(COORDINATOR_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Coordinator(e.to_string()))?
            .error_for_status()
            .map_err(|e| EngineError::Coordinator(e.to_string()))?;

        let initiated: InitiateResponse = resp
            .json()
            .await
            .map_err(|e| EngineError::Coordinator(e.to_string()))?;
        debug!(upload_id = %initiated.upload_id, "upload initiated");
        Ok(initiated)
    }

    /// `GET /api/upload/presign` for up to [`MAX_PRESIGN_BATCH`] parts.
    pub async fn presign_batch(
        &self,
        job: &JobRef,
        part_numbers: &[u32],
    ) -> Result<Vec<PresignedUrl>, EngineError> {
        debug_assert!(part_numbers.len() <= MAX_PRESIGN_BATCH);
        let csv = part_numbers
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let resp = self
            .http
            .get(format!("{}/api/upload/presign", self.base_url))
            .timeout(COORDINATOR_TIMEOUT)
            .query(&[
                ("upload_id", job.upload_id.as_str()),
                ("bucket", job.bucket.as_str()),
                ("object_key", job.object_key.as_str()),
                ("part_numbers", csv.as_str()),
            ])
            .send()
            .await
            .map_err(|e| EngineError::Coordinator(e.to_string()))?
            .error_for_status()
            .map_err(|e| EngineError::Coordinator(e.to_string()))?;

        let presigned: PresignResponse = resp
            .json()
            .await
            .map_err(|e| EngineError::Coordinator(e.to_string()))?;
        Ok(presigned.urls)
    }

    /// `POST /api/upload/complete` with receipts in ascending part order.
    pub async fn complete(
        &self,
        job: &JobRef,
        parts: Vec<PartReceipt>,
    ) -> Result<CompleteResponse, EngineError> {
        let body = CompleteRequest {
            upload_id: job.upload_id.clone(),
            bucket: job.bucket.clone(),
            object_key: job.object_key.clone(),
            parts,
        };
        let resp = self
            .http
            .post(format!("{}/api/upload/complete", self.base_url))
            .timeout(COORDINATOR_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Coordinator(e.to_string()))?
            .error_for_status()
            .map_err(|e| EngineError::Coordinator(e.to_string()))?;

        let completed: CompleteResponse = resp
            .json()
            .await
            .map_err(|e| EngineError::Coordinator(e.to_string()))?;
        if completed.status != "completed" {
            return Err(EngineError::Coordinator(format!(
                "complete returned status {:?}",
                completed.status
            )));
        }
        Ok(completed)
    }

    /// `POST /api/upload/abort`. 2xx means the storage side cleaned up.
    pub async fn abort(&self, job: &JobRef) -> Result<(), EngineError> {
        let body = AbortRequest {
            upload_id: job.upload_id.clone(),
            bucket: job.bucket.clone(),
            object_key: job.object_key.clone(),
        };
        self.http
            .post(format!("{}/api/upload/abort", self.base_url))
            .timeout(COORDINATOR_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Coordinator(e.to_string()))?
            .error_for_status()
            .map_err(|e| EngineError::Coordinator(e.to_string()))?;
        debug!(upload_id = %job.upload_id, "upload aborted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_normalized() {
        let client = CoordinatorClient::new(Client::new(), "http://localhost:8000/");
        assert_eq!(client.base_url(), "http://localhost:8000");
    }

    #[tokio::test]
    async fn network_error_maps_to_coordinator_error() {
        // Nothing listens on this port.
        let client = CoordinatorClient::new(Client::new(), "http://127.0.0.1:1");
        let err = client.initiate("f.bin", 10, "10:1").await.unwrap_err();
        assert!(matches!(err, EngineError::Coordinator(_)));
    }
}
