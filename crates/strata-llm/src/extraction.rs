//! HTTP client for the knowledge extraction service.
//!
//! The service persists an episode plus whatever entities and relationships
//! it infers into the shared graph database, and answers with a JSON
//! document whose shape varies between versions. This client returns that
//! document untouched; `strata-memory` normalizes it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strata_settings::ExtractionSettings;
use tracing::debug;

use crate::error_parsing::classify_response;
use crate::errors::{ProviderError, Result};
use crate::openai::map_transport;

/// One `add episode` call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRequest {
    /// Short episode name.
    pub name: String,
    /// Text to extract from.
    pub episode_body: String,
    /// Where the text came from.
    pub source_description: String,
    /// Reference time for relative dates in the text.
    pub reference_time: DateTime<Utc>,
    /// Target layer.
    pub group_id: String,
}

/// Client for `POST {base}/episodes`.
pub struct HttpExtractionClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpExtractionClient {
    /// Build a client for `base_url` with a per-request timeout.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Client from the extraction settings section.
    pub fn from_settings(settings: &ExtractionSettings) -> Result<Self> {
        Self::new(
            settings.base_url.clone(),
            Duration::from_millis(settings.timeout_ms),
        )
    }

    /// Submit one episode. No retry here; callers wrap this in the executor.
    ///
    /// A success status whose body is not JSON is reported as
    /// [`ProviderError::Validation`]: the write most likely happened but the
    /// service could not describe it.
    pub async fn add_episode(&self, request: &ExtractionRequest) -> Result<Value> {
        let url = format!("{}/episodes", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(map_transport)?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_response(status, &headers, &body));
        }

        let body = response.text().await.map_err(map_transport)?;
        debug!(
            name = %request.name,
            group_id = %request.group_id,
            bytes = body.len(),
            "extraction response"
        );
        serde_json::from_str(&body).map_err(|e| ProviderError::Validation(e.to_string()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> ExtractionRequest {
        ExtractionRequest {
            name: "notes".into(),
            episode_body: "Lena is a designer.".into(),
            source_description: "notes".into(),
            reference_time: Utc::now(),
            group_id: "knowledge".into(),
        }
    }

    async fn client(server: &MockServer) -> HttpExtractionClient {
        HttpExtractionClient::new(format!("{}/", server.uri()), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn posts_request_and_returns_raw_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/episodes"))
            .and(body_partial_json(json!({"group_id": "knowledge"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"episode": {"uuid": "ep-1"}})),
            )
            .mount(&server)
            .await;

        let value = client(&server).await.add_episode(&request()).await.unwrap();
        assert_eq!(value["episode"]["uuid"], "ep-1");
    }

    #[tokio::test]
    async fn too_many_requests_is_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/episodes"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "1")
                    .set_body_json(json!({"detail": "slow down"})),
            )
            .mount(&server)
            .await;

        let err = client(&server).await.add_episode(&request()).await.unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(err.retry_after_ms(), Some(1000));
        assert!(err.to_string().contains("slow down"));
    }

    #[tokio::test]
    async fn unprocessable_and_garbled_are_validation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/episodes"))
            .respond_with(ResponseTemplate::new(422).set_body_json(json!({"detail": "schema"})))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/episodes"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let c = client(&server).await;
        assert!(c.add_episode(&request()).await.unwrap_err().is_validation());
        assert!(c.add_episode(&request()).await.unwrap_err().is_validation());
    }
}
