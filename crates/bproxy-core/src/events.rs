use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::broadcast;

pub const LOG_RING_CAPACITY: usize = 100;

/// Closed set of operational signals. Rendered once into the status ring
/// buffer and mirrored to `tracing`; components never log free-form strings
/// for state changes.
#[derive(Debug, Clone)]
pub enum ProxyEvent {
    RequestAccepted {
        request_id: String,
        path: String,
        streaming: bool,
    },
    RequestCompleted {
        request_id: String,
        status: u16,
        finish_reason: Option<String>,
    },
    RequestFailed {
        request_id: String,
        status: u16,
        message: String,
    },
    RelayAttached,
    RelayLost,
    RotationPending {
        reason: String,
    },
    RotationStarted {
        from: u32,
        to: u32,
    },
    RotationCompleted {
        index: u32,
    },
    RotationRolledBack {
        index: u32,
        message: String,
    },
    RotationFailed {
        message: String,
    },
    Notice(String),
}

impl ProxyEvent {
    fn render(&self) -> String {
        match self {
            Self::RequestAccepted {
                request_id,
                path,
                streaming,
            } => format!(
                "accepted {request_id} {path} ({})",
                if *streaming { "stream" } else { "buffered" }
            ),
            Self::RequestCompleted {
                request_id,
                status,
                finish_reason,
            } => match finish_reason {
                Some(reason) => format!("completed {request_id} status={status} finish={reason}"),
                None => format!("completed {request_id} status={status}"),
            },
            Self::RequestFailed {
                request_id,
                status,
                message,
            } => format!("failed {request_id} status={status}: {message}"),
            Self::RelayAttached => "relay attached".to_string(),
            Self::RelayLost => "relay lost".to_string(),
            Self::RotationPending { reason } => format!("rotation pending: {reason}"),
            Self::RotationStarted { from, to } => format!("rotation started {from} -> {to}"),
            Self::RotationCompleted { index } => format!("rotation completed, now on {index}"),
            Self::RotationRolledBack { index, message } => {
                format!("rotation rolled back to {index}: {message}")
            }
            Self::RotationFailed { message } => format!("rotation failed: {message}"),
            Self::Notice(message) => message.clone(),
        }
    }
}

struct Inner {
    tx: broadcast::Sender<ProxyEvent>,
    ring: Mutex<VecDeque<String>>,
}

/// Fan-out hub for operational events, with a fixed-size ring of rendered
/// lines backing the admin status endpoint.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<Inner>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                tx,
                ring: Mutex::new(VecDeque::with_capacity(LOG_RING_CAPACITY)),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.inner.tx.subscribe()
    }

    pub fn emit(&self, event: ProxyEvent) {
        let line = event.render();
        tracing::info!(target: "bproxy", "{line}");

        let stamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        let mut ring = self
            .inner
            .ring
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if ring.len() == LOG_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(format!("[{stamp}] {line}"));
        drop(ring);

        let _ = self.inner.tx.send(event);
    }

    /// Most recent log lines, oldest first.
    pub fn recent(&self) -> Vec<String> {
        self.inner
            .ring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_caps_at_capacity() {
        let hub = EventHub::new();
        for i in 0..(LOG_RING_CAPACITY + 20) {
            hub.emit(ProxyEvent::Notice(format!("line {i}")));
        }
        let recent = hub.recent();
        assert_eq!(recent.len(), LOG_RING_CAPACITY);
        assert!(recent[0].contains("line 20"));
        assert!(recent.last().unwrap().contains("line 119"));
    }

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let hub = EventHub::new();
        let mut rx = hub.subscribe();
        hub.emit(ProxyEvent::RelayAttached);
        assert!(matches!(rx.recv().await.unwrap(), ProxyEvent::RelayAttached));
    }
}
