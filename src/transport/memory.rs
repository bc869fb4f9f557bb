//! In-memory transport that records every message it is handed.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::phone::PhoneNumber;
use crate::transport::{SendReceipt, Transport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub to: PhoneNumber,
    pub body: String,
    pub template_id: String,
}

/// Records sends instead of delivering them. Numbers registered with
/// `fail_for` get a `Rejected` error.
#[derive(Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<SentMessage>>,
    failing: Mutex<HashSet<PhoneNumber>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_for(&self, phone: &PhoneNumber) {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(phone.clone());
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn sent_to(&self, phone: &PhoneNumber) -> Vec<SentMessage> {
        self.sent()
            .into_iter()
            .filter(|m| &m.to == phone)
            .collect()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    async fn send(
        &self,
        to: &PhoneNumber,
        body: &str,
        template_id: &str,
    ) -> Result<SendReceipt, TransportError> {
        let failing = self
            .failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(to);
        if failing {
            return Err(TransportError::Rejected {
                name: "memory".into(),
                status: 400,
                reason: format!("{to} is unreachable"),
            });
        }

        let mut sent = self.sent.lock().unwrap_or_else(|e| e.into_inner());
        sent.push(SentMessage {
            to: to.clone(),
            body: body.to_string(),
            template_id: template_id.to_string(),
        });
        Ok(SendReceipt {
            transport_ref: format!("mem-{}", sent.len()),
        })
    }
}
