//! One-shot REST fetches with a small fixed retry budget

use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{Result, ScannerError};

pub const DEFAULT_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct RestClient {
    client: reqwest::Client,
    attempts: u32,
    retry_delay: Duration,
}

impl RestClient {
    pub fn new(attempts: u32, retry_delay: Duration, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            attempts: attempts.max(1),
            retry_delay,
        })
    }

    /// GET `url` as JSON, retrying transport and HTTP errors
    pub async fn get_json(&self, url: &str) -> Result<serde_json::Value> {
        let mut last_error = ScannerError::RestApi(format!("no attempt made for {url}"));
        for attempt in 1..=self.attempts {
            match self.try_get(url).await {
                Ok(body) => return Ok(body),
                Err(e) => {
                    warn!(url = %url, attempt, error = %e, "REST request failed");
                    last_error = e;
                }
            }
            if attempt < self.attempts {
                sleep(self.retry_delay).await;
            }
        }
        Err(last_error)
    }

    async fn try_get(&self, url: &str) -> Result<serde_json::Value> {
        debug!(url = %url, "REST request");
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ScannerError::RestApi(format!("{url} returned {status}")));
        }
        Ok(response.json::<serde_json::Value>().await?)
    }
}

impl Default for RestClient {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
            attempts: DEFAULT_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_host_fails_after_retries() {
        let client = RestClient::new(2, Duration::from_millis(1), Duration::from_millis(200)).unwrap();
        let started = std::time::Instant::now();
        let result = client.get_json("http://127.0.0.1:1/unreachable").await;
        assert!(matches!(result, Err(ScannerError::RestApi(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
