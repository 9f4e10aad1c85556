use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use bproxy_core::browser::{BrowserError, BrowserSession};
use bproxy_core::CredentialStore;
use bproxy_relay::{ChannelSignal, RelayChannel};

/// Production browser orchestration: materialise the selected credential
/// bundle, (re)spawn the Camoufox launcher pointed at the relay WebSocket
/// and wait until the page script connects.
///
/// Without a configured executable the proxy still works against an
/// externally managed browser, but cannot switch accounts on its own.
pub struct CamoufoxLauncher {
    executable: Option<PathBuf>,
    store: Arc<CredentialStore>,
    channel: Arc<RelayChannel>,
    relay_url: String,
    ready_timeout: Duration,
    scratch_dir: PathBuf,
    child: Mutex<Option<Child>>,
}

impl CamoufoxLauncher {
    pub fn new(
        executable: Option<PathBuf>,
        store: Arc<CredentialStore>,
        channel: Arc<RelayChannel>,
        relay_url: String,
        ready_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let scratch_dir = std::env::temp_dir().join("bproxy");
        std::fs::create_dir_all(&scratch_dir)?;
        Ok(Self {
            executable,
            store,
            channel,
            relay_url,
            ready_timeout,
            scratch_dir,
            child: Mutex::new(None),
        })
    }

    async fn wait_for_relay(&self) -> Result<(), BrowserError> {
        let mut signals = self.channel.subscribe();
        let deadline = Instant::now() + self.ready_timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(BrowserError::ReadyTimeout(self.ready_timeout))?;
            match tokio::time::timeout(remaining, signals.recv()).await {
                Ok(Ok(ChannelSignal::ConnectionAdded)) => return Ok(()),
                Ok(Ok(ChannelSignal::ConnectionLost)) => continue,
                Ok(Err(_)) => return Err(BrowserError::Process("channel closed".to_string())),
                Err(_) => return Err(BrowserError::ReadyTimeout(self.ready_timeout)),
            }
        }
    }
}

#[async_trait::async_trait]
impl BrowserSession for CamoufoxLauncher {
    async fn switch_to(&self, index: u32) -> Result<(), BrowserError> {
        let Some(executable) = &self.executable else {
            // External browser: already attached is fine, anything else is
            // beyond our control.
            if self.channel.is_connected() {
                return Ok(());
            }
            return Err(BrowserError::NotConfigured);
        };

        let bundle = self
            .store
            .load(index)
            .map_err(|error| BrowserError::Bundle(index, error.to_string()))?;
        let bundle_path = self.scratch_dir.join(format!("auth-{index}.json"));
        let serialised = serde_json::to_vec(&bundle)
            .map_err(|error| BrowserError::Bundle(index, error.to_string()))?;
        tokio::fs::write(&bundle_path, serialised)
            .await
            .map_err(|error| BrowserError::Bundle(index, error.to_string()))?;

        // One page context at a time: tear down the previous process before
        // spawning the next.
        {
            let mut slot = self.child.lock().await;
            if let Some(mut previous) = slot.take() {
                let _ = previous.kill().await;
            }

            let child = Command::new(executable)
                .arg("--storage-state")
                .arg(&bundle_path)
                .arg("--relay-url")
                .arg(&self.relay_url)
                .kill_on_drop(true)
                .spawn()
                .map_err(|error| BrowserError::Process(error.to_string()))?;
            *slot = Some(child);
        }

        tracing::info!(index, "browser session starting, waiting for relay");
        self.wait_for_relay().await
    }
}
