//! Message transporter
//!
//! Funnels every outgoing control message into the single outbound queue and
//! correlates asynchronous responses (keyed by message kind and transaction
//! id) with the component that is waiting for them.

use crate::ControlError;
use dashmap::DashMap;
use revtun_proto::{Message, MessageKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

type WaiterKey = (MessageKind, String);

/// Registered waiters: key -> (registration id, response slot)
type WaiterMap = DashMap<WaiterKey, (u64, oneshot::Sender<Message>)>;

pub struct MessageTransporter {
    /// `None` once the outbound queue has been closed
    tx: Mutex<Option<mpsc::Sender<Message>>>,
    waiters: Arc<WaiterMap>,
    next_id: AtomicU64,
}

impl MessageTransporter {
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            waiters: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Enqueue a message on the outbound queue
    pub async fn send(&self, msg: Message) -> Result<(), ControlError> {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(ControlError::SessionClosed)?;

        trace!("Enqueue {}", msg.kind());
        tx.send(msg).await.map_err(|_| ControlError::SessionClosed)
    }

    /// Reserve a correlation slot for the next `kind` message carrying `transaction_id`
    ///
    /// Registering an already pending key replaces the previous waiter, which
    /// then observes cancellation.
    pub fn register(&self, kind: MessageKind, transaction_id: impl Into<String>) -> Waiter {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let key = (kind, transaction_id.into());

        debug!("Registered waiter for {} [{}]", key.0, key.1);
        self.waiters.insert(key.clone(), (id, tx));

        Waiter {
            key,
            id,
            rx,
            waiters: self.waiters.clone(),
        }
    }

    /// Hand `msg` to the waiter registered for (`kind`, `transaction_id`)
    ///
    /// Returns false when nobody is waiting (never registered, already
    /// answered, timed out or dropped).
    pub fn dispatch(&self, msg: Message, kind: MessageKind, transaction_id: &str) -> bool {
        match self.waiters.remove(&(kind, transaction_id.to_string())) {
            Some((_, (_, tx))) => tx.send(msg).is_ok(),
            None => false,
        }
    }

    /// Dispatch using the message's own kind and transaction id
    pub fn dispatch_message(&self, msg: Message) -> bool {
        let kind = msg.kind();
        match msg.transaction_id().map(str::to_string) {
            Some(tid) => self.dispatch(msg, kind, &tid),
            None => false,
        }
    }

    /// Send `request` and wait for the `response_kind` message with the same transaction id
    pub async fn request(
        &self,
        request: Message,
        response_kind: MessageKind,
        timeout: Duration,
    ) -> Result<Message, ControlError> {
        let tid = request
            .transaction_id()
            .ok_or_else(|| {
                ControlError::ProtocolError(format!("{} has no transaction id", request.kind()))
            })?
            .to_string();

        let waiter = self.register(response_kind, tid);
        self.send(request).await?;
        waiter.recv(timeout).await
    }

    /// Close the outbound queue. Queued messages are still delivered to the writer.
    pub fn close(&self) {
        if self
            .tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some()
        {
            debug!("Outbound queue closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }

    /// Number of registered, unanswered waiters
    pub fn pending(&self) -> usize {
        self.waiters.len()
    }
}

/// Single-use receiver for one correlated response
///
/// Dropping it releases the slot, so abandoned waits never accumulate.
pub struct Waiter {
    key: WaiterKey,
    id: u64,
    rx: oneshot::Receiver<Message>,
    waiters: Arc<WaiterMap>,
}

impl Waiter {
    pub async fn recv(mut self, timeout: Duration) -> Result<Message, ControlError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(msg)) => Ok(msg),
            Ok(Err(_)) => Err(ControlError::SessionClosed),
            Err(_) => Err(ControlError::Timeout(format!(
                "waiting for {} [{}]",
                self.key.0, self.key.1
            ))),
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        let id = self.id;
        self.waiters
            .remove_if(&self.key, |_, (registered, _)| *registered == id);
    }
}
