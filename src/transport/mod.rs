//! Outbound SMS transport.
//!
//! The engine never retries a send itself; a failed or timed-out call is
//! recorded and the batch moves on.

pub mod memory;
pub mod twilio;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::error::TransportError;
use crate::phone::PhoneNumber;

pub use memory::{MemoryTransport, SentMessage};
pub use twilio::TwilioTransport;

/// What the transport hands back for an accepted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    /// Provider message id (e.g. a Twilio `SM…` sid).
    pub transport_ref: String,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    async fn send(
        &self,
        to: &PhoneNumber,
        body: &str,
        template_id: &str,
    ) -> Result<SendReceipt, TransportError>;
}

/// Run `transport.send` with an upper bound on how long it may take.
pub async fn send_with_timeout(
    transport: &dyn Transport,
    limit: Duration,
    to: &PhoneNumber,
    body: &str,
    template_id: &str,
) -> Result<SendReceipt, TransportError> {
    match tokio::time::timeout(limit, transport.send(to, body, template_id)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(limit)),
    }
}

/// Dry-run transport: logs each message and fabricates a reference.
#[derive(Default)]
pub struct LogTransport {
    counter: AtomicU64,
}

impl LogTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for LogTransport {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(
        &self,
        to: &PhoneNumber,
        body: &str,
        template_id: &str,
    ) -> Result<SendReceipt, TransportError> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        info!(to = %to, template_id, chars = body.chars().count(), "[dry-run] SMS: {body}");
        Ok(SendReceipt {
            transport_ref: format!("dry-run-{n}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowTransport;

    #[async_trait]
    impl Transport for SlowTransport {
        fn name(&self) -> &str {
            "slow"
        }

        async fn send(
            &self,
            _to: &PhoneNumber,
            _body: &str,
            _template_id: &str,
        ) -> Result<SendReceipt, TransportError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(SendReceipt {
                transport_ref: "late".into(),
            })
        }
    }

    fn phone() -> PhoneNumber {
        PhoneNumber::parse("5551234567").unwrap()
    }

    #[tokio::test]
    async fn log_transport_numbers_refs() {
        let transport = LogTransport::new();
        let first = transport.send(&phone(), "hi", "t1").await.unwrap();
        let second = transport.send(&phone(), "hi", "t1").await.unwrap();
        assert_eq!(first.transport_ref, "dry-run-1");
        assert_eq!(second.transport_ref, "dry-run-2");
    }

    #[tokio::test]
    async fn slow_send_times_out() {
        let limit = Duration::from_millis(50);
        let err = send_with_timeout(&SlowTransport, limit, &phone(), "hi", "t1")
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(d) if d == limit));
    }
}
