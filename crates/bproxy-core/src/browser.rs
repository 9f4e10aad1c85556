use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum BrowserError {
    #[error("browser launcher not configured")]
    NotConfigured,
    #[error("credential bundle {0} unavailable: {1}")]
    Bundle(u32, String),
    #[error("relay did not become ready within {0:?}")]
    ReadyTimeout(Duration),
    #[error("browser process failed: {0}")]
    Process(String),
}

/// Seam to the headless-browser orchestration.
///
/// `switch_to` loads bundle `index` into a fresh page context, drives the
/// page to a relay-ready state and only then returns. Callers treat it as an
/// expensive, serialised operation; the rotation controller guarantees it is
/// never invoked concurrently with itself.
#[async_trait::async_trait]
pub trait BrowserSession: Send + Sync {
    async fn switch_to(&self, index: u32) -> Result<(), BrowserError>;
}
