//! HTTP client for the Tenant Guard decision service.

use anyhow::{Context, Result};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Response envelope shared by success and error bodies.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub error_code: Option<String>,
}

/// Header the server reads operator tokens from.
const OPERATOR_TOKEN_HEADER: &str = "X-Operator-Token";

/// Caller credential attached to decision and filter requests.
#[derive(Debug, Clone, Default)]
pub enum Credential {
    #[default]
    None,
    Bearer(String),
    ApiKey(String),
}

/// HTTP client for the decision service API.
pub struct ApiClient {
    client: Client,
    base_url: String,
    credential: Credential,
}

impl ApiClient {
    pub fn new(base_url: &str, credential: Credential) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credential,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authenticated(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credential {
            Credential::None => request,
            Credential::Bearer(token) => request.bearer_auth(token),
            Credential::ApiKey(key) => request.header("X-API-Key", key),
        }
    }

    /// GET a public endpoint and unwrap the envelope.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;
        unwrap_envelope(resp, &url).await
    }

    /// POST a JSON body with the caller credential attached.
    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = self.url(path);
        let resp = self
            .authenticated(self.client.post(&url))
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?;
        unwrap_envelope(resp, &url).await
    }

    /// PUT a raw document authorized by the operator token.
    pub async fn put_operator<T: DeserializeOwned>(
        &self,
        path: &str,
        body: String,
        content_type: &str,
        operator_token: &str,
    ) -> Result<T> {
        let url = self.url(path);
        let resp = self
            .client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header(OPERATOR_TOKEN_HEADER, operator_token)
            .body(body)
            .send()
            .await
            .with_context(|| format!("PUT {} failed", url))?;
        unwrap_envelope(resp, &url).await
    }

    /// GET an endpoint that is not wrapped in the envelope.
    pub async fn get_raw(&self, path: &str) -> Result<serde_json::Value> {
        let url = self.url(path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("API error ({}): {}", status, body);
        }

        resp.json()
            .await
            .with_context(|| format!("Failed to parse response from {}", url))
    }
}

async fn unwrap_envelope<T: DeserializeOwned>(resp: Response, url: &str) -> Result<T> {
    let status = resp.status();
    let body = resp
        .text()
        .await
        .with_context(|| format!("Failed to read response from {}", url))?;

    let envelope: ApiResponse<T> = match serde_json::from_str(&body) {
        Ok(envelope) => envelope,
        Err(_) if !status.is_success() => anyhow::bail!("API error ({}): {}", status, body),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to parse response from {}", url));
        }
    };

    if envelope.success {
        return envelope
            .data
            .ok_or_else(|| anyhow::anyhow!("API returned success but no data"));
    }

    let message = envelope.error.unwrap_or_else(|| "Unknown error".into());
    match envelope.error_code {
        Some(code) => anyhow::bail!("API error ({}): {}: {}", status, code, message),
        None => anyhow::bail!("API error ({}): {}", status, message),
    }
}
