//! HTTP transport underneath the gateway.
//!
//! The gateway owns failover and status mapping; a [`Transport`] only moves
//! one request to one host and reports what came back. Network-level
//! failures surface as [`Error::ConnectionFailed`] or [`Error::Timeout`].

use crate::constants::{API_BASE_PATH, AUTH_HEADER, AUTH_TOKEN_PREFIX};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// HTTP method of an API call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        })
    }
}

/// One API call addressed to one host.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub host: String,
    pub port: u16,
    pub method: Method,
    /// Path below the API base (`/cluster/resources`).
    pub path: String,
    pub token: String,
    pub body: Option<Value>,
    pub timeout: Duration,
}

impl ApiRequest {
    /// Full request URL.
    #[must_use]
    pub fn url(&self) -> String {
        format!(
            "https://{}:{}{}{}",
            self.host, self.port, API_BASE_PATH, self.path
        )
    }

    /// `Authorization` header value.
    #[must_use]
    pub fn auth_value(&self) -> String {
        format!("{AUTH_TOKEN_PREFIX}{}", self.token)
    }

    /// Short description for logs and timeout errors.
    #[must_use]
    pub fn operation(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

/// Raw answer of one host.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl ApiResponse {
    /// 200 response with a JSON body.
    #[must_use]
    pub fn ok(body: &Value) -> Self {
        Self {
            status: 200,
            body: body.to_string().into_bytes(),
        }
    }

    /// Response with an empty body.
    #[must_use]
    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
        }
    }
}

/// Sends one request to one host.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse>;
}

/// reqwest-backed transport.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Builds a client. Proxmox hosts commonly present self-signed
    /// certificates, so verification is opt-in.
    pub fn new(verify_tls: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(!verify_tls)
            .build()
            .map_err(|e| Error::Configuration(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let url = request.url();
        let builder = match request.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
            Method::Put => self.client.put(&url),
            Method::Delete => self.client.delete(&url),
        };
        let mut builder = builder
            .header(AUTH_HEADER, request.auth_value())
            .timeout(request.timeout);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| classify(request, &e))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| classify(request, &e))?
            .to_vec();
        Ok(ApiResponse { status, body })
    }
}

fn classify(request: &ApiRequest, err: &reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout {
            operation: request.operation(),
            duration: request.timeout,
        }
    } else {
        Error::ConnectionFailed {
            host: request.host.clone(),
            reason: err.to_string(),
        }
    }
}
