//! Dispatcher: one transport attempt per call, never retries.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::campaigns::Attachment;
use crate::error::TransportError;

/// A fully rendered message for one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub campaign_id: Uuid,
    pub lead_id: Uuid,
    /// Value of the `Message-ID` header, without angle brackets.
    pub message_id: String,
    pub to: String,
    pub to_name: Option<String>,
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
    pub headers: BTreeMap<String, String>,
    pub attachments: Vec<Attachment>,
}

/// Proof that the transport accepted a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryReceipt {
    pub provider_message_id: String,
    pub accepted_at: DateTime<Utc>,
}

/// Something that can hand one message to a mail provider.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, TransportError>;
}

/// Wraps a transport, validates the recipient and counts invocations.
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    invocations: AtomicU64,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            invocations: AtomicU64::new(0),
        }
    }

    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    /// Number of `dispatch` calls so far.
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Perform exactly one send attempt.
    pub async fn dispatch(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, TransportError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);

        if message.to.trim().parse::<lettre::Address>().is_err() {
            return Err(TransportError::validation(format!(
                "invalid recipient address: {}",
                message.to
            )));
        }

        match self.transport.send(message).await {
            Ok(receipt) => {
                debug!(
                    campaign_id = %message.campaign_id,
                    recipient = %message.to,
                    provider_message_id = %receipt.provider_message_id,
                    "Message accepted"
                );
                Ok(receipt)
            }
            Err(e) => {
                warn!(
                    campaign_id = %message.campaign_id,
                    recipient = %message.to,
                    class = %e.class,
                    error = %e.message,
                    "Dispatch failed"
                );
                Err(e)
            }
        }
    }
}

// ── Stub transport ──────────────────────────────────────────────────

type Scripted = Result<(), TransportError>;

/// In-process transport with scripted results, for tests and local runs.
///
/// Per-address scripts are consumed first; once a script is exhausted the
/// default result applies.
pub struct StubTransport {
    default: Scripted,
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    delay: Option<Duration>,
    sent: Mutex<Vec<OutboundMessage>>,
    calls: AtomicU64,
}

impl StubTransport {
    /// Accepts everything.
    pub fn accepting() -> Self {
        Self::with_default(Ok(()))
    }

    /// Fails every send with `error`.
    pub fn failing(error: TransportError) -> Self {
        Self::with_default(Err(error))
    }

    fn with_default(default: Scripted) -> Self {
        Self {
            default,
            scripts: Mutex::new(HashMap::new()),
            delay: None,
            sent: Mutex::new(Vec::new()),
            calls: AtomicU64::new(0),
        }
    }

    /// Results for successive sends to `address`.
    pub fn script(self, address: &str, results: Vec<Scripted>) -> Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.insert(address.trim().to_lowercase(), results.into());
        }
        self
    }

    /// Sleep this long inside every send.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Messages accepted so far.
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Number of sends attempted to `address`.
    pub fn calls_to(&self, address: &str) -> usize {
        let address = address.trim().to_lowercase();
        self.sent()
            .iter()
            .filter(|m| m.to.to_lowercase() == address)
            .count()
    }

    fn next_result(&self, address: &str) -> Scripted {
        let key = address.trim().to_lowercase();
        let scripted = self
            .scripts
            .lock()
            .ok()
            .and_then(|mut s| s.get_mut(&key).and_then(|q| q.pop_front()));
        scripted.unwrap_or_else(|| self.default.clone())
    }
}

#[async_trait]
impl Transport for StubTransport {
    fn name(&self) -> &str {
        "stub"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let result = self.next_result(&message.to);
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(message.clone());
        }
        result.map(|()| DeliveryReceipt {
            provider_message_id: message.message_id.clone(),
            accepted_at: Utc::now(),
        })
    }
}

#[cfg(test)]
pub(crate) fn test_message(to: &str) -> OutboundMessage {
    OutboundMessage {
        campaign_id: Uuid::new_v4(),
        lead_id: Uuid::new_v4(),
        message_id: format!("{}@leadai.test", Uuid::new_v4()),
        to: to.to_string(),
        to_name: None,
        subject: "Hello".into(),
        html_body: "<p>Hi</p>".into(),
        text_body: "Hi".into(),
        headers: BTreeMap::new(),
        attachments: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;

    #[tokio::test]
    async fn dispatch_calls_transport_once() {
        let stub = Arc::new(StubTransport::accepting());
        let dispatcher = Dispatcher::new(stub.clone());

        let msg = test_message("a@x.com");
        let receipt = dispatcher.dispatch(&msg).await.unwrap();
        assert_eq!(receipt.provider_message_id, msg.message_id);
        assert_eq!(stub.calls(), 1);
        assert_eq!(dispatcher.invocations(), 1);
    }

    #[tokio::test]
    async fn dispatch_does_not_retry() {
        let stub = Arc::new(StubTransport::failing(TransportError::transient("451")));
        let dispatcher = Dispatcher::new(stub.clone());

        let err = dispatcher.dispatch(&test_message("a@x.com")).await.unwrap_err();
        assert_eq!(err.class, ErrorClass::TransientRejection);
        assert_eq!(stub.calls(), 1);
    }

    #[tokio::test]
    async fn invalid_recipient_is_validation_error() {
        let stub = Arc::new(StubTransport::accepting());
        let dispatcher = Dispatcher::new(stub.clone());

        let err = dispatcher.dispatch(&test_message("not an address")).await.unwrap_err();
        assert_eq!(err.class, ErrorClass::Validation);
        assert_eq!(stub.calls(), 0);
        assert_eq!(dispatcher.invocations(), 1);
    }

    #[tokio::test]
    async fn scripts_apply_per_address_then_default() {
        let stub = StubTransport::accepting().script(
            "A@x.com",
            vec![Err(TransportError::network("reset")), Ok(())],
        );
        let msg = test_message("a@x.com");
        assert!(stub.send(&msg).await.is_err());
        assert!(stub.send(&msg).await.is_ok());
        assert!(stub.send(&msg).await.is_ok());
        assert_eq!(stub.calls_to("a@x.com"), 3);
    }
}
