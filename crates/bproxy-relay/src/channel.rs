use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use bproxy_protocol::{RelayEvent, RelayRequestFrame, cancel_frame};

use crate::mux::RequestMultiplexer;

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Typed lifecycle signals replacing the ad-hoc string events of the relay's
/// origin: one per relay attach, one per definitive loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelSignal {
    ConnectionAdded,
    ConnectionLost,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("no relay connection")]
    NotConnected,
    #[error("relay connection closed while sending")]
    SendFailed,
    #[error("frame serialisation failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

struct Connection {
    id: u64,
    outbound: mpsc::UnboundedSender<String>,
}

struct ChannelState {
    /// Oldest first; the head is the primary and receives all outbound sends.
    connections: Vec<Connection>,
    next_id: u64,
    grace_timer: Option<tokio::task::JoinHandle<()>>,
}

/// The single bidirectional link to the in-page relay.
///
/// All simultaneous connections are tracked, but only the oldest (the
/// "primary") carries outbound frames. When the last connection drops, a
/// grace window keeps per-request queues alive; a reconnect inside the
/// window cancels the teardown.
pub struct RelayChannel {
    mux: Arc<RequestMultiplexer>,
    state: Mutex<ChannelState>,
    signals: broadcast::Sender<ChannelSignal>,
    grace: Duration,
}

impl RelayChannel {
    pub fn new(mux: Arc<RequestMultiplexer>, grace: Duration) -> Arc<Self> {
        let (signals, _) = broadcast::channel(16);
        Arc::new(Self {
            mux,
            state: Mutex::new(ChannelState {
                connections: Vec::new(),
                next_id: 0,
                grace_timer: None,
            }),
            signals,
            grace,
        })
    }

    pub fn multiplexer(&self) -> &Arc<RequestMultiplexer> {
        &self.mux
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelSignal> {
        self.signals.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        !self.lock().connections.is_empty()
    }

    /// Attach a new relay connection. Cancels a pending grace teardown.
    pub fn register(&self, outbound: mpsc::UnboundedSender<String>) -> u64 {
        let id = {
            let mut state = self.lock();
            if let Some(timer) = state.grace_timer.take() {
                timer.abort();
            }
            let id = state.next_id;
            state.next_id += 1;
            state.connections.push(Connection { id, outbound });
            id
        };
        let _ = self.signals.send(ChannelSignal::ConnectionAdded);
        tracing::info!(connection_id = id, "relay connection attached");
        id
    }

    pub fn unregister(self: &Arc<Self>, id: u64) {
        let mut state = self.lock();
        state.connections.retain(|conn| conn.id != id);
        tracing::info!(connection_id = id, "relay connection detached");
        if state.connections.is_empty() && state.grace_timer.is_none() {
            let channel = Arc::clone(self);
            state.grace_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(channel.grace).await;
                channel.on_grace_expired();
            }));
        }
    }

    fn on_grace_expired(&self) {
        {
            let mut state = self.lock();
            state.grace_timer = None;
            if !state.connections.is_empty() {
                return;
            }
        }
        let live = self.mux.live_count();
        if live > 0 {
            tracing::warn!(live, "relay grace period expired, failing in-flight requests");
        }
        self.mux.close_all();
        let _ = self.signals.send(ChannelSignal::ConnectionLost);
    }

    pub fn send_request(&self, frame: &RelayRequestFrame) -> Result<(), RelayError> {
        let text = serde_json::to_string(frame)?;
        self.send_text(text)
    }

    pub fn send_cancel(&self, request_id: &str) -> Result<(), RelayError> {
        self.send_text(cancel_frame(request_id))
    }

    fn send_text(&self, text: String) -> Result<(), RelayError> {
        let state = self.lock();
        let primary = state.connections.first().ok_or(RelayError::NotConnected)?;
        primary
            .outbound
            .send(text)
            .map_err(|_| RelayError::SendFailed)
    }

    /// Ingress for raw text frames from a relay socket. Unparsable frames
    /// (including anything missing a `request_id`) are dropped silently.
    pub fn handle_text(&self, text: &str) {
        match serde_json::from_str::<RelayEvent>(text) {
            Ok(event) => self.mux.deliver(event),
            Err(error) => {
                tracing::trace!(%error, "dropping unparsable relay frame");
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
