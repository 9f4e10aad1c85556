use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;

use bproxy_protocol::RelayEvent;

/// One message on a per-request queue. `stream_close` frames from the relay
/// are normalised to `StreamEnd` before they reach a consumer.
#[derive(Debug, Clone)]
pub enum QueueItem {
    Headers {
        status: u16,
        headers: BTreeMap<String, String>,
    },
    Chunk(String),
    Error {
        status: u16,
        message: String,
    },
    StreamEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DequeueError {
    #[error("request queue closed")]
    Closed,
    #[error("timed out waiting for relay event")]
    Timeout,
}

/// Consumer half of a per-request queue. FIFO, single consumer; fails
/// deterministically once the producer side is removed from the multiplexer.
pub struct RequestQueue {
    rx: mpsc::UnboundedReceiver<QueueItem>,
}

impl RequestQueue {
    pub async fn recv(&mut self, timeout: Duration) -> Result<QueueItem, DequeueError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(item)) => Ok(item),
            Ok(None) => Err(DequeueError::Closed),
            Err(_) => Err(DequeueError::Timeout),
        }
    }
}

/// Routes relay events to per-request queues keyed by request id.
///
/// Producers never block: queues are unbounded in memory, and their lifetime
/// is bounded by the owning request's timeout.
#[derive(Default)]
pub struct RequestMultiplexer {
    queues: Mutex<HashMap<String, mpsc::UnboundedSender<QueueItem>>>,
}

impl RequestMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request ids are freshly minted per relay round trip, so a collision is
    /// a programmer error; the stale queue is closed and replaced.
    pub fn create_queue(&self, request_id: &str) -> RequestQueue {
        let (tx, rx) = mpsc::unbounded_channel();
        let previous = self.lock().insert(request_id.to_string(), tx);
        if previous.is_some() {
            tracing::warn!(request_id, "duplicate request id, replacing live queue");
        }
        RequestQueue { rx }
    }

    /// Idempotent; dropping the producer fails any pending `recv`.
    pub fn remove_queue(&self, request_id: &str) {
        self.lock().remove(request_id);
    }

    pub fn deliver(&self, event: RelayEvent) {
        let request_id = event.request_id().to_string();
        let item = match event {
            RelayEvent::ResponseHeaders {
                status, headers, ..
            } => QueueItem::Headers { status, headers },
            RelayEvent::Chunk { data, .. } => QueueItem::Chunk(data),
            RelayEvent::Error {
                status, message, ..
            } => QueueItem::Error { status, message },
            RelayEvent::StreamClose { .. } => QueueItem::StreamEnd,
        };

        let sender = self.lock().get(&request_id).cloned();
        match sender {
            // A send error means the consumer is gone; the queue will be
            // removed by the request's finaliser.
            Some(tx) => {
                let _ = tx.send(item);
            }
            None => {
                tracing::trace!(%request_id, "dropping event for unknown request id");
            }
        }
    }

    /// Close every live queue. Used when the relay link is lost for good.
    pub fn close_all(&self) {
        self.lock().clear();
    }

    pub fn live_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<QueueItem>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
