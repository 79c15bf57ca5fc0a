use std::time::Duration;

use async_trait::async_trait;

use crate::error::{DispatchError, Result};
use crate::remote::{Method, RemoteRequest, RemoteResponse, Transport};

/// Timeout of a single request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// [`Transport`] backed by a pooled reqwest client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        Self::with_timeout(REQUEST_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::Configuration(format!("http client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: RemoteRequest) -> Result<RemoteResponse> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self.client.request(method, &request.url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        builder = match request.json {
            Some(body) => builder.json(&body),
            None if !request.form.is_empty() => builder.form(&request.form),
            None => builder,
        };

        let response = builder.send().await.map_err(|e| {
            tracing::debug!(url = %request.url, error = %e, "Request failed");
            DispatchError::transport(e.status().map(|s| s.as_u16()), e.to_string())
        })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| DispatchError::transport(Some(status), e.to_string()))?;
        Ok(RemoteResponse { status, body })
    }
}
