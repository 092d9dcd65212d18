//! HTTP client for the Confluence server's operator API.

use anyhow::{Context, Result};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Mirrors the server's `ApiResponse` envelope.
#[derive(Debug, serde::Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub error_code: Option<String>,
}

impl<T> ApiResponse<T> {
    fn into_data(self) -> Result<T> {
        if self.success {
            return self
                .data
                .ok_or_else(|| anyhow::anyhow!("API returned success but no data"));
        }
        let message = self.error.unwrap_or_else(|| "Unknown error".into());
        match self.error_code {
            Some(code) => Err(anyhow::anyhow!("API error [{}]: {}", code, message)),
            None => Err(anyhow::anyhow!("API error: {}", message)),
        }
    }
}

/// Body the server sends with a non-success status.
#[derive(Debug, serde::Deserialize)]
struct ErrorBody {
    error: ErrorInfo,
}

#[derive(Debug, serde::Deserialize)]
struct ErrorInfo {
    code: String,
    message: String,
}

pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        self.send(self.client.get(&url), "GET", &url).await
    }

    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = self.url(path);
        self.send(self.client.post(&url).json(body), "POST", &url).await
    }

    pub async fn put<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = self.url(path);
        self.send(self.client.put(&url).json(body), "PUT", &url).await
    }

    /// Unwrapped JSON body. `/health` answers 503 with a body worth
    /// showing, so non-success statuses are not errors here.
    pub async fn get_raw(&self, path: &str) -> Result<serde_json::Value> {
        let url = self.url(path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        resp.json()
            .await
            .with_context(|| format!("Failed to parse response from {}", url))
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder, method: &str, url: &str) -> Result<T> {
        let resp = request
            .send()
            .await
            .with_context(|| format!("{} {} failed", method, url))?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            if let Ok(err) = serde_json::from_str::<ErrorBody>(&body) {
                anyhow::bail!("API error [{}]: {}", err.error.code, err.error.message);
            }
            anyhow::bail!("API error ({}): {}", status, body);
        }

        let api_resp: ApiResponse<T> =
            serde_json::from_str(&body).with_context(|| format!("Failed to parse response from {}", url))?;
        api_resp.into_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_envelope_includes_code() {
        let resp: ApiResponse<()> = serde_json::from_str(
            r#"{"success":false,"error":"circuit open","error_code":"CIRCUIT_OPEN"}"#,
        )
        .unwrap();
        let err = resp.into_data().unwrap_err().to_string();
        assert!(err.contains("CIRCUIT_OPEN"));
        assert!(err.contains("circuit open"));
    }

    #[test]
    fn test_error_body_parses() {
        let body = r#"{"success":false,"error":{"code":"RATE_LIMITED","numeric_code":1101,"message":"slow down","timestamp":"2026-01-01T00:00:00Z"}}"#;
        let err: ErrorBody = serde_json::from_str(body).unwrap();
        assert_eq!(err.error.code, "RATE_LIMITED");
        assert_eq!(err.error.message, "slow down");
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = ApiClient::new("http://localhost:8080/").unwrap();
        assert_eq!(client.url("/health"), "http://localhost:8080/health");
    }
}
