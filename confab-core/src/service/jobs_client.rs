//! HTTP client for the external jobs service.
//!
//! The only call the backend makes is `GET {base_url}/jobs/ids`, which
//! returns the conversations a user belongs to and therefore the socket
//! rooms to auto-join. Requests carry the user's bearer token, time out
//! after 5 s, and retry transient status codes with exponential backoff.

use serde::Deserialize;
use std::time::Duration;

use crate::config::JobsServiceConfig;
use crate::models::JobId;
use crate::{Error, Result};

/// Status codes worth retrying, for any method.
const RETRYABLE_STATUS: [u16; 7] = [408, 413, 429, 500, 502, 503, 504];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobsEnvelope {
    data: Vec<String>,
    #[allow(dead_code)]
    message: Option<String>,
    #[allow(dead_code)]
    status_code: Option<u16>,
    #[allow(dead_code)]
    timestamp: Option<String>,
}

#[derive(Clone)]
pub struct JobsClient {
    http: reqwest::Client,
    base_url: String,
    max_retries: u32,
}

impl JobsClient {
    pub fn new(config: &JobsServiceConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| Error::External(format!("Failed to build jobs client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
        })
    }

    /// Fetch the job ids (conversation rooms) for the bearer of `token`.
    pub async fn fetch_job_ids(&self, token: &str) -> Result<Vec<JobId>> {
        let url = format!("{}/jobs/ids", self.base_url);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = self
                .http
                .get(&url)
                .bearer_auth(token)
                .send()
                .await;

            match outcome {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let envelope: JobsEnvelope = response.json().await.map_err(|e| {
                            Error::External(format!("Invalid jobs service response: {e}"))
                        })?;
                        return Ok(envelope
                            .data
                            .into_iter()
                            .map(JobId::from_string)
                            .collect());
                    }

                    if Self::is_retryable(status.as_u16()) && attempt <= self.max_retries {
                        let delay = Self::retry_delay(attempt);
                        tracing::warn!(
                            status = status.as_u16(),
                            attempt = attempt,
                            delay_ms = delay.as_millis() as u64,
                            "Jobs service returned retryable status"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    return Err(Error::External(format!(
                        "Jobs service responded {status} for {url}"
                    )));
                }
                Err(e) => {
                    // Timeouts and connection failures retry like 5xx.
                    if attempt <= self.max_retries {
                        let delay = Self::retry_delay(attempt);
                        tracing::warn!(
                            error = %e,
                            attempt = attempt,
                            delay_ms = delay.as_millis() as u64,
                            "Jobs service request failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(Error::External(format!("Jobs service unreachable: {e}")));
                }
            }
        }
    }

    fn is_retryable(status: u16) -> bool {
        RETRYABLE_STATUS.contains(&status)
    }

    /// Exponential backoff: 100 ms, 200 ms, 400 ms, ... capped at 2 s.
    fn retry_delay(attempt: u32) -> Duration {
        let delay_ms = (100u64 * 2u64.pow(attempt.saturating_sub(1))).min(2000);
        Duration::from_millis(delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_status_set() {
        for status in [408, 413, 429, 500, 502, 503, 504] {
            assert!(JobsClient::is_retryable(status));
        }
        for status in [200, 201, 400, 401, 403, 404] {
            assert!(!JobsClient::is_retryable(status));
        }
    }

    #[test]
    fn test_retry_delay_backoff() {
        assert_eq!(JobsClient::retry_delay(1), Duration::from_millis(100));
        assert_eq!(JobsClient::retry_delay(2), Duration::from_millis(200));
        assert_eq!(JobsClient::retry_delay(3), Duration::from_millis(400));
        assert_eq!(JobsClient::retry_delay(10), Duration::from_millis(2000));
    }

    #[test]
    fn test_envelope_shape() {
        let json = serde_json::json!({
            "data": ["j1", "j2"],
            "message": "ok",
            "statusCode": 200,
            "timestamp": "2026-08-02T00:00:00Z"
        });
        let envelope: JobsEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(envelope.data, vec!["j1", "j2"]);
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = JobsClient::new(&JobsServiceConfig {
            base_url: "http://jobs.internal/".to_string(),
            request_timeout_secs: 5,
            max_retries: 3,
        })
        .unwrap();
        assert_eq!(client.base_url, "http://jobs.internal");
    }
}
