//! HTTP client for communicating with the Cadence API server.

use anyhow::{Context, Result};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Header the server records as a schedule's `created_by`.
const USER_ID_HEADER: &str = "x-user-id";

/// Success envelope returned by `/api/v1` endpoints.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

/// Error envelope produced by the server's error handler.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
}

/// HTTP client for the Cadence API.
pub struct ApiClient {
    client: Client,
    base_url: String,
    user: Option<String>,
}

impl ApiClient {
    /// Create a new API client pointing at the given base URL.
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            user: None,
        })
    }

    /// Send `user` as the caller identity on every request.
    pub fn with_user(mut self, user: Option<String>) -> Self {
        self.user = user;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(self.request(Method::GET, path), "GET", path).await
    }

    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        self.send(self.request(Method::POST, path).json(body), "POST", path)
            .await
    }

    pub async fn put<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        self.send(self.request(Method::PUT, path).json(body), "PUT", path)
            .await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(self.request(Method::DELETE, path), "DELETE", path).await
    }

    /// Perform a raw GET request and return the full JSON value (for health endpoint).
    pub async fn get_raw(&self, path: &str) -> Result<serde_json::Value> {
        let resp = self
            .request(Method::GET, path)
            .send()
            .await
            .with_context(|| format!("GET {}{} failed", self.base_url, path))?;
        let resp = check_status(resp).await?;

        resp.json()
            .await
            .with_context(|| format!("Failed to parse response from {}{}", self.base_url, path))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, format!("{}{}", self.base_url, path));
        match &self.user {
            Some(user) => builder.header(USER_ID_HEADER, user),
            None => builder,
        }
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder, verb: &str, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = builder
            .send()
            .await
            .with_context(|| format!("{} {} failed", verb, url))?;
        let resp = check_status(resp).await?;

        let api_resp: ApiResponse<T> = resp
            .json()
            .await
            .with_context(|| format!("Failed to parse response from {}", url))?;

        if api_resp.success {
            api_resp
                .data
                .ok_or_else(|| anyhow::anyhow!("API returned success but no data"))
        } else {
            Err(anyhow::anyhow!(
                "API error: {}",
                api_resp.error.unwrap_or_else(|| "Unknown error".into())
            ))
        }
    }
}

/// Turn a non-2xx response into an error, preferring the server's own message.
async fn check_status(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorEnvelope>(&body) {
        Ok(envelope) => anyhow::bail!(
            "API error ({}): {} [{}]",
            status,
            envelope.error.message,
            envelope.error.code
        ),
        Err(_) => anyhow::bail!("API error ({}): {}", status, body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_get_unwraps_data() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/schedules"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "data": [1, 2, 3]
            })))
            .mount(&server)
            .await;

        let client = ApiClient::new(&server.uri()).unwrap();
        let data: Vec<u32> = client.get("/api/v1/schedules").await.unwrap();
        assert_eq!(data, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_error_envelope_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/invocations"))
            .respond_with(ResponseTemplate::new(422).set_body_json(serde_json::json!({
                "success": false,
                "error": {
                    "code": "UNKNOWN_JOB",
                    "numeric_code": 1103,
                    "message": "Unknown job 'nope'",
                    "timestamp": "2024-01-01T00:00:00Z"
                }
            })))
            .mount(&server)
            .await;

        let client = ApiClient::new(&server.uri()).unwrap();
        let err = client
            .post::<_, serde_json::Value>("/api/v1/invocations", &serde_json::json!({ "job_name": "nope" }))
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Unknown job 'nope'"));
        assert!(message.contains("UNKNOWN_JOB"));
    }

    #[tokio::test]
    async fn test_user_header_sent() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/v1/schedules/abc"))
            .and(header("x-user-id", "alice"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "data": "ok"
            })))
            .mount(&server)
            .await;

        let client = ApiClient::new(&format!("{}/", server.uri()))
            .unwrap()
            .with_user(Some("alice".into()));
        let data: String = client.delete("/api/v1/schedules/abc").await.unwrap();
        assert_eq!(data, "ok");
    }
}
