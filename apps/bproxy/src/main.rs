use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::routing::get;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use bproxy_common::{ProxyConfig, ProxyConfigPatch};
use bproxy_core::events::ProxyEvent;
use bproxy_core::state::AppState;
use bproxy_core::CredentialStore;
use bproxy_relay::{RelayChannel, RequestMultiplexer};
use bproxy_relay::channel::DEFAULT_GRACE_PERIOD;

mod admin_ui;
mod browser;

#[derive(Debug, Clone, Parser)]
#[command(name = "bproxy", version, about = "Browser-relay AI API proxy")]
struct CliArgs {
    /// Bind host for the API and admin surface.
    #[arg(long)]
    host: Option<String>,

    /// HTTP port.
    #[arg(long)]
    port: Option<u16>,

    /// Relay WebSocket port.
    #[arg(long)]
    ws_port: Option<u16>,

    /// Directory holding auth-<N>.json credential bundles. Without it, the
    /// AUTH_JSON_<N> environment variables are scanned instead.
    #[arg(long)]
    auth_dir: Option<PathBuf>,

    /// Camoufox launcher executable.
    #[arg(long)]
    camoufox: Option<PathBuf>,
}

impl CliArgs {
    fn to_patch(&self) -> ProxyConfigPatch {
        ProxyConfigPatch {
            host: self.host.clone(),
            http_port: self.port,
            ws_port: self.ws_port,
            auth_dir: self.auth_dir.clone(),
            camoufox_executable: self.camoufox.clone(),
            ..ProxyConfigPatch::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = CliArgs::parse();
    let mut patch = ProxyConfigPatch::from_env();
    patch.overlay(args.to_patch());
    let config = patch.into_config();
    config.validate().context("configuration")?;

    let store = build_store(&config).context("credential discovery")?;
    tracing::info!(
        accounts = store.available_indices().len(),
        "credential store ready"
    );

    let channel = RelayChannel::new(Arc::new(RequestMultiplexer::new()), DEFAULT_GRACE_PERIOD);
    let launcher = Arc::new(browser::CamoufoxLauncher::new(
        config.camoufox_executable.clone(),
        Arc::clone(&store),
        Arc::clone(&channel),
        format!("ws://127.0.0.1:{}/ws", config.ws_port),
        Duration::from_secs(120),
    )?);

    let state = AppState::new(config, store, launcher, channel);
    if state.config.uses_default_api_key() {
        state.events.emit(ProxyEvent::Notice(
            "API_KEYS not set, using the default key 123456".to_string(),
        ));
    }

    // First bundle load runs in the background; requests arriving before the
    // relay is ready fall back to auto-recovery or 503.
    {
        let rotation = Arc::clone(&state.rotation);
        tokio::spawn(async move {
            if let Err(error) = rotation.recover().await {
                tracing::warn!(%error, "initial browser session did not come up");
            }
        });
    }

    let api = bproxy_router::proxy_router(Arc::clone(&state))
        .merge(bproxy_router::admin_router(Arc::clone(&state)))
        .route("/", get(admin_ui::console));
    let relay = bproxy_router::relay_router(Arc::clone(&state));

    let http_bind = format!("{}:{}", state.config.host, state.config.http_port);
    let ws_bind = format!("{}:{}", state.config.host, state.config.ws_port);

    let http_listener = tokio::net::TcpListener::bind(&http_bind)
        .await
        .with_context(|| format!("bind {http_bind}"))?;
    let ws_listener = tokio::net::TcpListener::bind(&ws_bind)
        .await
        .with_context(|| format!("bind {ws_bind}"))?;

    tracing::info!(http = %http_bind, relay_ws = %ws_bind, "listening");

    tokio::try_join!(
        async { axum::serve(http_listener, api).await.context("http server") },
        async { axum::serve(ws_listener, relay).await.context("relay server") },
    )?;
    Ok(())
}

fn build_store(config: &ProxyConfig) -> anyhow::Result<Arc<CredentialStore>> {
    let store = match &config.auth_dir {
        Some(dir) => CredentialStore::from_dir(dir.clone())?,
        None => CredentialStore::from_env()?,
    };
    Ok(Arc::new(store))
}
