use chrono::{DateTime, Utc};
use miam_types::api::{
    DrawRequest, DrawResponse, ErrorResponse, LoginRequest, LoginResponse, NotifyResponse,
    RegisterRequest, SetDeadlineRequest, StatusResponse, UpdateEmailRequest,
};
use miam_types::{Assignment, Participant, ParticipantId};
use reqwest::{Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::{Error, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// When and how often failed requests are retried.
///
/// Only connection errors, `429` and `5xx` responses are retried. POST requests
/// are retried only with `retry_non_idempotent`.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub retry_non_idempotent: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            retry_non_idempotent: false,
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: usize) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// HTTP client for the drawer service.
pub struct Client {
    pub base_url: Url,
    http: reqwest::Client,
    retry_policy: RetryPolicy,
    token: Option<String>,
}

impl Client {
    pub fn new(base_url: &str) -> Result<Self> {
        let mut base_url = Url::parse(base_url)?;
        match base_url.scheme() {
            "http" | "https" => {}
            other => return Err(Error::InvalidScheme(other.to_string())),
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = reqwest::Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        Ok(Self {
            base_url,
            http,
            retry_policy: RetryPolicy::default(),
            token: None,
        })
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Uses an existing admin session token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub async fn healthz(&self) -> Result<()> {
        self.request_empty::<()>(Method::GET, "healthz", None).await
    }

    pub async fn status(&self) -> Result<StatusResponse> {
        self.request::<(), _>(Method::GET, "status", None).await
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<Participant> {
        self.request(Method::POST, "register", Some(request)).await
    }

    /// Logs in and keeps the session token for admin calls.
    pub async fn login(&mut self, password: &str) -> Result<LoginResponse> {
        let response: LoginResponse = self
            .request(
                Method::POST,
                "admin/login",
                Some(&LoginRequest {
                    password: password.to_string(),
                }),
            )
            .await?;
        self.token = Some(response.token.clone());
        Ok(response)
    }

    pub async fn logout(&mut self) -> Result<()> {
        self.request_empty::<()>(Method::POST, "admin/logout", None)
            .await?;
        self.token = None;
        Ok(())
    }

    pub async fn participants(&self) -> Result<Vec<Participant>> {
        self.request::<(), _>(Method::GET, "admin/participants", None)
            .await
    }

    pub async fn remove_participant(&self, id: ParticipantId) -> Result<Participant> {
        self.request::<(), _>(Method::DELETE, &format!("admin/participants/{id}"), None)
            .await
    }

    pub async fn update_email(&self, id: ParticipantId, email: &str) -> Result<Participant> {
        self.request(
            Method::PUT,
            &format!("admin/participants/{id}/email"),
            Some(&UpdateEmailRequest {
                email: email.to_string(),
            }),
        )
        .await
    }

    pub async fn set_deadline(&self, deadline: DateTime<Utc>) -> Result<()> {
        self.request_empty(
            Method::PUT,
            "admin/deadline",
            Some(&SetDeadlineRequest { deadline }),
        )
        .await
    }

    pub async fn clear_deadline(&self) -> Result<()> {
        self.request_empty::<()>(Method::DELETE, "admin/deadline", None)
            .await
    }

    pub async fn reset(&self) -> Result<()> {
        self.request_empty::<()>(Method::POST, "admin/reset", None)
            .await
    }

    pub async fn draw(&self, redraw: bool) -> Result<DrawResponse> {
        self.request(Method::POST, "admin/draw", Some(&DrawRequest { redraw }))
            .await
    }

    pub async fn assignments(&self) -> Result<Vec<Assignment>> {
        self.request::<(), _>(Method::GET, "admin/assignments", None)
            .await
    }

    pub async fn notify(&self) -> Result<NotifyResponse> {
        self.request::<(), _>(Method::POST, "admin/assignments/notify", None)
            .await
    }

    /// Fetches the metrics snapshot. `token` is the metrics token when the server requires one.
    pub async fn metrics(&self, token: Option<&str>) -> Result<serde_json::Value> {
        let url = self.base_url.join("metrics")?;
        let mut builder = self.http.get(url.clone());
        if let Some(token) = token {
            builder = builder.header("x-metrics-token", token);
        }
        let response = builder.send().await?;
        Self::decode(Method::GET, &url, response).await
    }

    async fn request<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T> {
        let url = self.base_url.join(path)?;
        let response = self.send_with_retry(method.clone(), url.clone(), body).await?;
        Self::decode(method, &url, response).await
    }

    async fn request_empty<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<()> {
        let url = self.base_url.join(path)?;
        let response = self.send_with_retry(method.clone(), url.clone(), body).await?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(Self::failure(method, &url, response).await)
    }

    async fn decode<T: DeserializeOwned>(
        method: Method,
        url: &Url,
        response: reqwest::Response,
    ) -> Result<T> {
        if !response.status().is_success() {
            return Err(Self::failure(method, url, response).await);
        }
        Ok(response.json().await?)
    }

    async fn failure(method: Method, url: &Url, response: reqwest::Response) -> Error {
        let status = response.status();
        let text = match response.text().await {
            Ok(text) => text,
            Err(_) => return Error::Failed(status),
        };
        match serde_json::from_str::<ErrorResponse>(&text) {
            Ok(ErrorResponse { error, message }) => Error::Api {
                status,
                code: error,
                message,
            },
            Err(_) => Error::FailedWithBody {
                status,
                body: format!("{method} {url}: {text}"),
            },
        }
    }

    async fn send_with_retry<B: Serialize>(
        &self,
        method: Method,
        url: Url,
        body: Option<&B>,
    ) -> Result<reqwest::Response> {
        let retryable_method = method != Method::POST || self.retry_policy.retry_non_idempotent;
        let max_attempts = if retryable_method {
            self.retry_policy.max_attempts.max(1)
        } else {
            1
        };

        let mut attempt = 0;
        loop {
            let mut builder = self.http.request(method.clone(), url.clone());
            if let Some(token) = &self.token {
                builder = builder.bearer_auth(token);
            }
            if let Some(body) = body {
                builder = builder.json(body);
            }
            attempt += 1;
            let last_attempt = attempt >= max_attempts;
            match builder.send().await {
                Ok(response) if should_retry(response.status()) && !last_attempt => {
                    debug!(%method, %url, status = %response.status(), attempt, "retrying request");
                }
                Ok(response) => return Ok(response),
                Err(err) if !last_attempt && (err.is_connect() || err.is_timeout()) => {
                    warn!(%method, %url, error = %err, attempt, "request failed; retrying");
                }
                Err(err) => return Err(err.into()),
            }
            tokio::time::sleep(self.retry_policy.backoff(attempt - 1)).await;
        }
    }
}

fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}
