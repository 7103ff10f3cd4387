//! HTTP reachability checks for services the upgrade depends on.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use reqwest::StatusCode;
use tracing::{debug, info};

use super::USER_AGENT;
use crate::cluster::AvailabilityChecker;
use crate::error::MuoError;

const ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// What to do after one request.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Attempt {
    Ok,
    Retry(String),
    Stop(String),
}

/// Server errors are retried, client errors are final.
fn classify(url: &str, status: StatusCode) -> Attempt {
    if status.is_server_error() {
        Attempt::Retry(format!("server error for {url}: {status}"))
    } else if status.is_client_error() {
        Attempt::Stop(format!("client error for {url}: {status}"))
    } else {
        Attempt::Ok
    }
}

/// GETs every configured URL, each bounded by the configured timeout.
pub struct HttpAvailabilityChecker {
    urls: Vec<String>,
    client: reqwest::Client,
    retry_delay: Duration,
}

impl HttpAvailabilityChecker {
    pub fn new(urls: Vec<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build availability check HTTP client")?;
        Ok(Self {
            urls,
            client,
            retry_delay: RETRY_DELAY,
        })
    }

    async fn check_url(&self, url: &str) -> Result<(), String> {
        let mut last_error = String::new();
        for attempt in 1..=ATTEMPTS {
            let outcome = match self.client.get(url).send().await {
                Ok(response) => classify(url, response.status()),
                Err(e) => Attempt::Retry(format!("client request error for {url}: {e}")),
            };
            match outcome {
                Attempt::Ok => return Ok(()),
                Attempt::Stop(msg) => return Err(msg),
                Attempt::Retry(msg) => {
                    debug!(url, attempt, error = msg.as_str(), "Availability check attempt failed");
                    last_error = msg;
                }
            }
            if attempt < ATTEMPTS {
                tokio::time::sleep(self.retry_delay).await;
            }
        }
        Err(last_error)
    }
}

#[async_trait]
impl AvailabilityChecker for HttpAvailabilityChecker {
    async fn available(&self) -> Result<()> {
        let results = join_all(self.urls.iter().map(|url| self.check_url(url))).await;
        let failures: Vec<String> = results.into_iter().filter_map(Result::err).collect();
        if failures.is_empty() {
            info!(targets = self.urls.len(), "External dependencies available");
            return Ok(());
        }
        Err(MuoError::AvailabilityCheck(failures.join("; ")).into())
    }
}
