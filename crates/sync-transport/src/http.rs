//! HTTP implementation of the send endpoint.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use sync_core::{classify_http_status, EngineError, EngineErrorCategory};

use crate::{SendEndpoint, SendRequest, SendResponse};

/// Error payload shape returned by the send endpoint on non-2xx responses.
#[derive(Debug, Deserialize)]
struct ErrorPayload {
    error: Option<String>,
    message: Option<String>,
}

/// Send endpoint talking to an HTTP API.
///
/// Posts the request (temp ID included, so the server can echo it back on
/// the subscription) and maps non-2xx responses to classified engine
/// errors carrying the payload's error message.
#[derive(Clone, Debug)]
pub struct HttpSendEndpoint {
    client: reqwest::Client,
    endpoint_url: String,
}

impl HttpSendEndpoint {
    pub fn new(endpoint_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint_url: endpoint_url.into(),
        }
    }

    /// Reuse an existing client (connection pooling, custom TLS).
    pub fn with_client(client: reqwest::Client, endpoint_url: impl Into<String>) -> Self {
        Self {
            client,
            endpoint_url: endpoint_url.into(),
        }
    }
}

#[async_trait]
impl SendEndpoint for HttpSendEndpoint {
    async fn send(&self, request: SendRequest) -> Result<SendResponse, EngineError> {
        debug!(temp_id = %request.temp_id, "posting message send");

        let response = self
            .client
            .post(&self.endpoint_url)
            .json(&request)
            .send()
            .await
            .map_err(|err| {
                EngineError::new(
                    EngineErrorCategory::Network,
                    "send_transport_failed",
                    err.to_string(),
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let payload_message = serde_json::from_str::<ErrorPayload>(&body)
                .ok()
                .and_then(|payload| payload.error.or(payload.message));
            let message = payload_message
                .unwrap_or_else(|| format!("send endpoint returned status {status}"));
            return Err(EngineError::new(
                classify_http_status(status.as_u16()),
                "send_failed",
                message,
            ));
        }

        response.json::<SendResponse>().await.map_err(|err| {
            EngineError::new(
                EngineErrorCategory::Serialization,
                "send_response_malformed",
                err.to_string(),
            )
        })
    }
}
