//! Configuration loading and tracing setup.

use anyhow::{Context, Result};
use telepathy_core::{BusKind, ClientConfig, ZbusBus};
use tracing_subscriber::EnvFilter;

use super::Args;

pub(super) fn load_config(args: &Args) -> Result<ClientConfig> {
    match args.config.as_ref() {
        Some(path) => ClientConfig::load_from_path(path).context("read config from path"),
        None => ClientConfig::load_default().context("read default config"),
    }
}

pub(super) fn init_tracing(config: &ClientConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(
            config
                .general
                .log_level
                .clone()
                .unwrap_or_else(|| "info".to_string()),
        )
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub(super) fn config_source(args: &Args) -> &'static str {
    if args.config.is_some() {
        return "custom";
    }
    match ClientConfig::default_config_path() {
        Ok(path) if path.exists() => "default",
        _ => "builtin",
    }
}

pub(super) async fn connect_bus(config: &ClientConfig) -> Result<std::sync::Arc<ZbusBus>> {
    let timeout = config.introspection.call_timeout();
    match config.bus.kind {
        BusKind::Session => ZbusBus::session(timeout)
            .await
            .context("connect to session bus"),
        BusKind::System => ZbusBus::system(timeout)
            .await
            .context("connect to system bus"),
    }
}
