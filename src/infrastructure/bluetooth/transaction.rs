//! GATT Transactions
//!
//! A transaction is one queued read, write, subscribe or unsubscribe. It
//! carries its own timeout and retry budget and a single-fire completion
//! slot that always receives exactly one result.

use crate::domain::error::OperationError;
use crate::domain::models::{CharacteristicRef, LinkHandle, NotificationEvent};
use crate::infrastructure::bluetooth::transport::{AdapterNotifications, TransportAdapter};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    Read,
    Write { ack_required: bool },
    Subscribe,
    Unsubscribe,
}

impl TransactionKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write { .. } => "write",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

/// Per-class operation deadlines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationTimeouts {
    pub read: Duration,
    pub write: Duration,
    /// Registering a subscription writes the CCCD, which is slower on most stacks
    pub subscribe: Duration,
    /// Extra attempts after a timed-out one
    pub retries: u32,
}

impl Default for OperationTimeouts {
    fn default() -> Self {
        Self {
            read: Duration::from_secs(5),
            write: Duration::from_secs(5),
            subscribe: Duration::from_secs(10),
            retries: 1,
        }
    }
}

impl OperationTimeouts {
    pub fn for_kind(&self, kind: TransactionKind) -> Duration {
        match kind {
            TransactionKind::Read => self.read,
            TransactionKind::Write { .. } => self.write,
            TransactionKind::Subscribe | TransactionKind::Unsubscribe => self.subscribe,
        }
    }
}

/// What to run against the adapter
#[derive(Debug)]
pub struct TransactionRequest {
    pub kind: TransactionKind,
    pub target: CharacteristicRef,
    pub payload: Vec<u8>,
    pub timeout: Duration,
    pub retries: u32,
    /// Stream that joins the subscription once it is registered
    pub subscriber: Option<mpsc::UnboundedSender<NotificationEvent>>,
}

impl TransactionRequest {
    pub fn new(kind: TransactionKind, target: CharacteristicRef, timeouts: &OperationTimeouts) -> Self {
        Self {
            kind,
            target,
            payload: Vec::new(),
            timeout: timeouts.for_kind(kind),
            retries: timeouts.retries,
            subscriber: None,
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_subscriber(mut self, subscriber: mpsc::UnboundedSender<NotificationEvent>) -> Self {
        self.subscriber = Some(subscriber);
        self
    }
}

/// Result handed to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionOutput {
    Value(Vec<u8>),
    Written,
    Subscribed,
    Unsubscribed,
}

pub type TransactionResult = Result<TransactionOutput, OperationError>;

/// Raw adapter result, before the connection has taken what it needs
#[derive(Debug)]
pub enum Outcome {
    Value(Vec<u8>),
    Written,
    Subscribed(AdapterNotifications),
    Unsubscribed,
}

/// Single-fire completion slot
#[derive(Debug)]
pub struct Completion(oneshot::Sender<TransactionResult>);

impl Completion {
    pub fn new() -> (Self, oneshot::Receiver<TransactionResult>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    pub fn complete(self, result: TransactionResult) {
        // The caller may have stopped waiting; the result is still delivered
        // to whoever holds the receiver
        let _ = self.0.send(result);
    }
}

#[derive(Debug)]
pub struct Transaction {
    pub id: u64,
    pub request: TransactionRequest,
    completion: Completion,
}

impl Transaction {
    pub fn new(id: u64, request: TransactionRequest) -> (Self, oneshot::Receiver<TransactionResult>) {
        let (completion, rx) = Completion::new();
        (
            Self {
                id,
                request,
                completion,
            },
            rx,
        )
    }

    pub fn into_parts(self) -> (TransactionRequest, Completion) {
        (self.request, self.completion)
    }

    pub fn fail(self, error: OperationError) {
        self.completion.complete(Err(error));
    }
}

async fn attempt(
    adapter: &dyn TransportAdapter,
    link: LinkHandle,
    request: &TransactionRequest,
) -> Result<Outcome, OperationError> {
    let target = request.target;
    match request.kind {
        TransactionKind::Read => {
            let value = adapter.read_characteristic(link, target).await?;
            trace!("Read {} bytes from {}: {:02X?}", value.len(), target, value);
            Ok(Outcome::Value(value))
        }
        TransactionKind::Write { ack_required } => {
            adapter
                .write_characteristic(link, target, &request.payload, ack_required)
                .await?;
            Ok(Outcome::Written)
        }
        TransactionKind::Subscribe => Ok(Outcome::Subscribed(adapter.subscribe(link, target).await?)),
        TransactionKind::Unsubscribe => {
            adapter.unsubscribe(link, target).await?;
            Ok(Outcome::Unsubscribed)
        }
    }
}

/// Run a request with its timeout, retrying only timed-out attempts
pub async fn execute(
    adapter: &dyn TransportAdapter,
    link: LinkHandle,
    request: &TransactionRequest,
) -> Result<Outcome, OperationError> {
    let attempts = request.retries.saturating_add(1);
    for n in 1..=attempts {
        match tokio::time::timeout(request.timeout, attempt(adapter, link, request)).await {
            Ok(result) => return result,
            Err(_) => warn!(
                "{} on {} timed out after {:?} (attempt {}/{})",
                request.kind.name(),
                request.target,
                request.timeout,
                n,
                attempts
            ),
        }
    }
    Err(OperationError::Timeout { attempts })
}
