//! C5 — shared HTTP client: every outbound request goes through the rate
//! limiter (C3) and is deduplicated by the coalescer (C4) before reqwest ever
//! sees it. Retry/backoff is the usual RETRY_AFTER-aware doubling-backoff
//! loop, classifying failures into `HttpError` instead of bailing out with
//! `anyhow`.

use crate::coalescer::{CoalesceError, Coalescer};
use crate::error::HttpError;
use crate::rate_limiter::{JobFailure, Priority, RateLimiter};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub struct HttpFetcher {
    client: Client,
    limiter: Arc<RateLimiter>,
    coalescer: Coalescer<serde_json::Value, HttpError>,
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    esi_timeout: Duration,
    zkb_timeout: Duration,
}

impl HttpFetcher {
    pub fn new(
        user_agent: &str,
        limiter: Arc<RateLimiter>,
        max_retries: u32,
        base_delay: Duration,
        max_delay: Duration,
        esi_timeout: Duration,
        zkb_timeout: Duration,
    ) -> Self {
        let client = Client::builder()
            .user_agent(user_agent.to_string())
            .build()
            .expect("reqwest client must build with a static user agent");
        HttpFetcher {
            client,
            limiter,
            coalescer: Coalescer::new(),
            max_retries,
            base_delay,
            max_delay,
            esi_timeout,
            zkb_timeout,
        }
    }

    fn timeout_for(&self, service: &str) -> Duration {
        match service {
            "esi" => self.esi_timeout,
            "zkb" => self.zkb_timeout,
            _ => self.esi_timeout,
        }
    }

    /// GETs `url` as JSON, deduplicated against any identical in-flight
    /// fetch and scheduled through `service`'s rate limiter at `priority`.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        service: &'static str,
        priority: Priority,
        queue_timeout_ms: u64,
        url: &str,
    ) -> Result<T, HttpError> {
        let value = self.get_json_value(service, priority, queue_timeout_ms, url).await?;
        serde_json::from_value(value.clone())
            .map_err(|e| HttpError::BadResponse(url.to_string(), e.to_string()))
    }

    async fn get_json_value(
        &self,
        service: &'static str,
        priority: Priority,
        queue_timeout_ms: u64,
        url: &str,
    ) -> Result<serde_json::Value, HttpError> {
        let coalesce_key = format!("{service}:{url}");
        let result = self
            .coalescer
            .coalesce(&coalesce_key, Duration::from_secs(30), || {
                self.fetch_with_retries(service, priority, queue_timeout_ms, url)
            })
            .await;

        match result {
            Ok(value) => Ok(value),
            Err(CoalesceError::Abandoned) => Err(HttpError::Timeout(url.to_string())),
            Err(CoalesceError::Inner(e)) => Err(e),
        }
    }

    async fn fetch_with_retries(
        &self,
        service: &'static str,
        priority: Priority,
        queue_timeout_ms: u64,
        url: &str,
    ) -> Result<serde_json::Value, HttpError> {
        let mut attempt = 0u32;
        let mut backoff = self.base_delay;
        let timeout = self.timeout_for(service);

        loop {
            attempt += 1;
            let outcome = self.scheduled_request(service, priority, queue_timeout_ms, timeout, url).await;

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.retryable() && attempt <= self.max_retries => {
                    let wait = match &e {
                        HttpError::RateLimited {
                            retry_after_secs: Some(secs),
                            ..
                        } => Duration::from_secs(*secs),
                        _ => backoff,
                    };
                    warn!(
                        "{service}: request to {url} failed ({e}), retrying in {wait:?} \
                         (attempt {attempt}/{})",
                        self.max_retries
                    );
                    tokio::time::sleep(wait).await;
                    backoff = (backoff * 2).min(self.max_delay);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Runs exactly one attempt through the rate limiter's scheduler,
    /// translating the raw reqwest outcome into `HttpError` and reporting
    /// success/failure back to the circuit breaker via `JobFailure`.
    async fn scheduled_request(
        &self,
        service: &'static str,
        priority: Priority,
        queue_timeout_ms: u64,
        timeout: Duration,
        url: &str,
    ) -> Result<serde_json::Value, HttpError> {
        let client = self.client.clone();
        let url_owned = url.to_string();
        let (tx, rx) = tokio::sync::oneshot::channel();

        let limiter_result = self
            .limiter
            .submit(service, priority, queue_timeout_ms, move || {
                let tx = tx;
                async move {
                    let outcome = do_request(&client, &url_owned, timeout).await;
                    let job_failure = match &outcome {
                        Ok(_) => None,
                        Err(HttpError::RateLimited { retry_after_secs, .. }) => {
                            Some(JobFailure::RateLimited {
                                retry_after: Duration::from_secs(retry_after_secs.unwrap_or(1)),
                            })
                        }
                        Err(_) => Some(JobFailure::Failed),
                    };
                    let _ = tx.send(outcome);
                    match job_failure {
                        Some(f) => Err(f),
                        None => Ok(()),
                    }
                }
            })
            .await;

        match limiter_result {
            Ok(()) => rx.await.unwrap_or_else(|_| {
                Err(HttpError::ConnectionFailed(url.to_string()))
            }),
            Err(e) => Err(HttpError::ConnectionFailed(format!("{url} ({e})"))),
        }
    }
}

async fn do_request(client: &Client, url: &str, timeout: Duration) -> Result<serde_json::Value, HttpError> {
    let response = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| classify_transport_error(url, &e))?;

    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Err(HttpError::NotFound(url.to_string()));
    }
    if status == StatusCode::FORBIDDEN {
        return Err(HttpError::Forbidden(url.to_string()));
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        return Err(HttpError::RateLimited {
            url: url.to_string(),
            retry_after_secs,
        });
    }
    if status.is_server_error() {
        return Err(HttpError::ServerError(url.to_string(), status.as_u16()));
    }
    if !status.is_success() {
        return Err(HttpError::BadResponse(url.to_string(), format!("status {status}")));
    }

    response
        .json::<serde_json::Value>()
        .await
        .map_err(|e| HttpError::BadResponse(url.to_string(), e.to_string()))
}

fn classify_transport_error(url: &str, e: &reqwest::Error) -> HttpError {
    if e.is_timeout() {
        HttpError::Timeout(url.to_string())
    } else {
        HttpError::ConnectionFailed(url.to_string())
    }
}
