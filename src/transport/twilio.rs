//! Twilio Messages API transport.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::debug;

use crate::config::TwilioConfig;
use crate::error::TransportError;
use crate::phone::PhoneNumber;
use crate::transport::{SendReceipt, Transport};

const TWILIO_API_BASE: &str = "https://api.twilio.com";

/// Sends SMS through `POST /2010-04-01/Accounts/{sid}/Messages.json`.
pub struct TwilioTransport {
    config: TwilioConfig,
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct MessageResource {
    sid: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

impl TwilioTransport {
    pub fn new(config: TwilioConfig) -> Self {
        Self {
            config,
            base_url: TWILIO_API_BASE.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Point at a different API host (local stubs in tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.base_url, self.config.account_sid
        )
    }
}

#[async_trait]
impl Transport for TwilioTransport {
    fn name(&self) -> &str {
        "twilio"
    }

    async fn send(
        &self,
        to: &PhoneNumber,
        body: &str,
        template_id: &str,
    ) -> Result<SendReceipt, TransportError> {
        let to = to.e164();
        let from = self.config.from_number.e164();
        let form = [("To", to.as_str()), ("From", from.as_str()), ("Body", body)];

        let resp = self
            .client
            .post(self.messages_url())
            .basic_auth(
                &self.config.account_sid,
                Some(self.config.auth_token.expose_secret()),
            )
            .form(&form)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let reason = serde_json::from_str::<ApiError>(&text)
                .map(|e| e.message)
                .ok()
                .filter(|m| !m.is_empty())
                .unwrap_or(text);
            return Err(TransportError::Rejected {
                name: "twilio".into(),
                status: status.as_u16(),
                reason,
            });
        }

        let message: MessageResource =
            resp.json()
                .await
                .map_err(|e| TransportError::InvalidResponse {
                    name: "twilio".into(),
                    reason: e.to_string(),
                })?;

        debug!(to = %to, template_id, sid = %message.sid, "Twilio accepted message");
        Ok(SendReceipt {
            transport_ref: message.sid,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::extract::{Form, Path};
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use secrecy::SecretString;

    use super::*;

    async fn fake_messages(
        Path(sid): Path<String>,
        Form(form): Form<HashMap<String, String>>,
    ) -> (StatusCode, Json<serde_json::Value>) {
        if form.get("To").map(String::as_str) == Some("+15550000000") {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "code": 21211, "message": "Invalid 'To' Phone Number" })),
            );
        }
        (
            StatusCode::CREATED,
            Json(serde_json::json!({ "sid": format!("SM-{sid}-{}", form["Body"].len()) })),
        )
    }

    async fn stub_server() -> String {
        let app = Router::new().route(
            "/2010-04-01/Accounts/{sid}/Messages.json",
            post(fake_messages),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        format!("http://{addr}")
    }

    fn transport(base: &str) -> TwilioTransport {
        TwilioTransport::new(TwilioConfig {
            account_sid: "AC1".into(),
            auth_token: SecretString::from("tok".to_string()),
            from_number: PhoneNumber::parse("5559990000").unwrap(),
        })
        .with_base_url(base)
    }

    #[tokio::test]
    async fn accepted_message_returns_sid() {
        let base = stub_server().await;
        let receipt = transport(&base)
            .send(&PhoneNumber::parse("5551234567").unwrap(), "hello", "t1")
            .await
            .unwrap();
        assert_eq!(receipt.transport_ref, "SM-AC1-5");
    }

    #[tokio::test]
    async fn rejected_message_maps_status_and_reason() {
        let base = stub_server().await;
        let err = transport(&base)
            .send(&PhoneNumber::parse("5550000000").unwrap(), "hello", "t1")
            .await
            .unwrap_err();
        match err {
            TransportError::Rejected { status, reason, .. } => {
                assert_eq!(status, 400);
                assert_eq!(reason, "Invalid 'To' Phone Number");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
