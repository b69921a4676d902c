//! Rate-limited JSON fetching
//!
//! One request at a time, with bounded retries on HTTP 429 and transient
//! network errors. Every other failure is reported immediately so the caller
//! can mark the unit failed and move on.

use crate::config::{ApiConfig, HttpMethod, RateLimitConfig};
use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Longest response body kept in an [`FailureReason::HttpStatus`]
const MAX_ERROR_BODY_CHARS: usize = 500;

/// A single HTTP request description
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub method: HttpMethod,
    pub url: String,
    /// JSON body for POST; flattened to query parameters for GET
    pub payload: Option<Value>,
    pub headers: Vec<(String, String)>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            payload: None,
            headers: Vec::new(),
        }
    }

    pub fn post(url: impl Into<String>, payload: Value) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            payload: Some(payload),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Why a fetch did not produce a JSON document
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FailureReason {
    #[error("rate limited (HTTP 429)")]
    RateLimited,

    #[error("transient network error: {0}")]
    Transient(String),

    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("response body is not valid JSON: {0}")]
    MalformedBody(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl FailureReason {
    /// Only throttling and network hiccups are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureReason::RateLimited | FailureReason::Transient(_))
    }
}

/// Terminal fetch failure with the number of attempts that were made
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{reason} (after {attempts} attempt(s))")]
pub struct FetchFailure {
    pub reason: FailureReason,
    pub attempts: u32,
}

/// Anything that can turn a [`FetchRequest`] into a JSON document.
///
/// The pagination walker and harvest engine are generic over this so that
/// tests can script responses without a network.
#[allow(async_fn_in_trait)]
pub trait JsonFetch {
    async fn fetch(&self, request: &FetchRequest) -> Result<Value, FetchFailure>;
}

/// reqwest-backed fetcher with retry and backoff
#[derive(Debug, Clone)]
pub struct RateLimitedFetcher {
    client: Client,
    retry: RateLimitConfig,
}

impl RateLimitedFetcher {
    /// Build a fetcher with the API's timeout and user agent
    pub fn new(api: &ApiConfig, retry: &RateLimitConfig) -> Result<Self> {
        Self::build(
            Duration::from_secs(api.request_timeout_secs),
            &api.user_agent,
            retry,
        )
    }

    pub fn build(timeout: Duration, user_agent: &str, retry: &RateLimitConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent.to_string())
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self::with_client(client, retry))
    }

    /// Use an existing client (custom timeout, shared connection pool)
    pub fn with_client(client: Client, retry: &RateLimitConfig) -> Self {
        Self {
            client,
            retry: retry.clone(),
        }
    }

    pub fn retry_config(&self) -> &RateLimitConfig {
        &self.retry
    }

    /// Total attempts allowed per request
    pub fn max_attempts(&self) -> u32 {
        self.retry.max_retries.saturating_add(1)
    }

    async fn attempt(&self, request: &FetchRequest) -> Result<Value, FailureReason> {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        };

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        match (request.method, &request.payload) {
            (HttpMethod::Post, Some(payload)) => builder = builder.json(payload),
            (HttpMethod::Get, Some(Value::Object(map))) => {
                let params: Vec<(String, String)> = map
                    .iter()
                    .map(|(k, v)| (k.clone(), query_param_value(v)))
                    .collect();
                builder = builder.query(&params);
            }
            (HttpMethod::Get, Some(other)) => {
                return Err(FailureReason::InvalidRequest(format!(
                    "GET payload must be an object, got {}",
                    other
                )));
            }
            (_, None) => {}
        }

        let response = builder.send().await.map_err(classify_error)?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(FailureReason::RateLimited);
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FailureReason::HttpStatus {
                status: status.as_u16(),
                body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }

        let text = response.text().await.map_err(classify_error)?;
        serde_json::from_str(&text).map_err(|e| FailureReason::MalformedBody(e.to_string()))
    }
}

impl JsonFetch for RateLimitedFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<Value, FetchFailure> {
        let max_attempts = self.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let reason = match self.attempt(request).await {
                Ok(value) => {
                    debug!("{} attempt {}/{}: ok", request.url, attempt, max_attempts);
                    return Ok(value);
                }
                Err(reason) => reason,
            };

            if !reason.is_retryable() {
                warn!(
                    "{} attempt {}/{}: {} (not retrying)",
                    request.url, attempt, max_attempts, reason
                );
                return Err(FetchFailure {
                    reason,
                    attempts: attempt,
                });
            }

            if attempt >= max_attempts {
                warn!(
                    "{} attempt {}/{}: {} (retries exhausted)",
                    request.url, attempt, max_attempts, reason
                );
                return Err(FetchFailure {
                    reason,
                    attempts: attempt,
                });
            }

            let delay = self.retry.calculate_backoff_delay(attempt);
            warn!(
                "{} attempt {}/{}: {}, retrying in {:?} with {:?} backoff",
                request.url, attempt, max_attempts, reason, delay, self.retry.backoff_strategy
            );
            sleep(delay).await;
        }
    }
}

fn classify_error(err: reqwest::Error) -> FailureReason {
    if err.is_builder() {
        FailureReason::InvalidRequest(err.to_string())
    } else if err.is_timeout() {
        FailureReason::Transient(format!("timeout: {}", err))
    } else if err.is_connect() {
        FailureReason::Transient(format!("connect: {}", err))
    } else {
        FailureReason::Transient(err.to_string())
    }
}

fn query_param_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
