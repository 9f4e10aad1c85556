use std::sync::Arc;

use bproxy_common::ProxyConfig;
use bproxy_relay::{ChannelSignal, RelayChannel};

use crate::browser::BrowserSession;
use crate::credential::CredentialStore;
use crate::engine::ProxyEngine;
use crate::events::{EventHub, ProxyEvent};
use crate::flags::FlagStore;
use crate::rotation::{RotationConfig, RotationController};

/// Composition root: every component is built here and handed its
/// dependencies explicitly; routers receive this as shared state.
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    pub engine: ProxyEngine,
    pub channel: Arc<RelayChannel>,
    pub rotation: Arc<RotationController>,
    pub flags: Arc<FlagStore>,
    pub store: Arc<CredentialStore>,
    pub events: EventHub,
}

impl AppState {
    /// The channel is built by the caller so launcher implementations can
    /// hold it before the rest of the system exists.
    pub fn new(
        config: ProxyConfig,
        store: Arc<CredentialStore>,
        browser: Arc<dyn BrowserSession>,
        channel: Arc<RelayChannel>,
    ) -> Arc<Self> {
        let events = EventHub::new();
        let flags = Arc::new(FlagStore::new(config.streaming_mode));

        let rotation = RotationController::new(
            RotationConfig {
                switch_on_uses: config.switch_on_uses,
                failure_threshold: config.failure_threshold,
                immediate_switch_status_codes: config.immediate_switch_status_codes.clone(),
            },
            Arc::clone(&store),
            browser,
            events.clone(),
            config.initial_auth_index,
        );

        let engine = ProxyEngine::new(
            Arc::clone(&channel),
            Arc::clone(&rotation),
            Arc::clone(&flags),
            events.clone(),
            config.max_retries,
            config.retry_delay(),
        );

        let state = Arc::new(Self {
            config: Arc::new(config),
            engine,
            channel,
            rotation,
            flags,
            store,
            events,
        });
        state.bridge_channel_signals();
        state
    }

    /// Mirror typed channel signals into the operational log.
    fn bridge_channel_signals(self: &Arc<Self>) {
        let mut signals = self.channel.subscribe();
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                match signals.recv().await {
                    Ok(ChannelSignal::ConnectionAdded) => events.emit(ProxyEvent::RelayAttached),
                    Ok(ChannelSignal::ConnectionLost) => events.emit(ProxyEvent::RelayLost),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Status document served by the admin surface.
    pub fn status(&self) -> serde_json::Value {
        let rotation = self.rotation.snapshot();
        let flags = self.flags.snapshot();
        let accounts: Vec<serde_json::Value> = self
            .store
            .roster()
            .into_iter()
            .map(|(index, name)| {
                serde_json::json!({
                    "index": index,
                    "accountName": name,
                    "active": index == rotation.current_index,
                })
            })
            .collect();

        serde_json::json!({
            "streamingMode": flags.streaming_mode,
            "flags": {
                "openaiReasoning": flags.openai_reasoning,
                "nativeReasoning": flags.native_reasoning,
                "redirect25To30": flags.redirect_25_to_30,
                "resumeLimit": flags.resume_limit,
                "enableResume": flags.enable_resume,
            },
            "browserConnected": self.channel.is_connected(),
            "currentAuthIndex": rotation.current_index,
            "usageCount": format!("{}/{}", rotation.usage_count, self.config.switch_on_uses),
            "failureCount": format!("{}/{}", rotation.failure_count, self.config.failure_threshold),
            "pendingSwitch": rotation.pending_switch,
            "systemBusy": rotation.system_busy,
            "unavailable": rotation.unavailable,
            "activeRequests": rotation.active_requests,
            "accountDetails": accounts,
            "logs": self.events.recent(),
        })
    }
}
