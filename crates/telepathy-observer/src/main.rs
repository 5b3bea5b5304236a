//! Observer client entrypoint.
//!
//! Registers an observer on the bus, feeds `ObserveChannels` into the core
//! pipeline and logs channel events until shut down.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use telepathy_core::{
    CallChannel, CallEvent, Channel, ChannelFactory, ConnectionContactManager, ContactManager,
    Observer, ObserverEvent, ObserverRegistry, SimpleObserver, SimpleObserverEvent,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info};

mod observer_server;
mod registrar;
mod runtime_config;
mod shutdown_signal;

use crate::observer_server::export_observer;
use crate::registrar::DbusRegistrar;
use crate::runtime_config::{config_source, connect_bus, init_tracing, load_config};
use crate::shutdown_signal::shutdown_signal;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to config.toml
    #[arg(long)]
    config: Option<PathBuf>,

    /// Validate configuration and exit
    #[arg(long)]
    check: bool,

    /// Only report channels of this account object path
    #[arg(long)]
    account: Option<String>,

    /// Only report channels whose target is this contact (requires --account)
    #[arg(long, requires = "account")]
    contact: Option<String>,

    /// Connection bus name used to normalize --contact
    #[arg(long, requires = "contact")]
    connection: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args).context("load config")?;

    init_tracing(&config);
    info!(config_source = config_source(&args), "configuration loaded");
    if telepathy_core::diagnostic_mode() {
        info!(
            limit = telepathy_core::log_limit(),
            "diagnostic logging enabled (snippets capped; newlines stripped)"
        );
    }

    if args.check {
        info!("configuration loaded successfully");
        return Ok(());
    }

    let bus = connect_bus(&config).await?;
    let connection = bus.connection().clone();
    let factory = Arc::new(ChannelFactory::new(bus.clone()));
    let filter = config.observer.channel_filter();

    match args.account.clone() {
        None => {
            let unique_name = connection
                .unique_name()
                .map(|name| name.to_string())
                .ok_or_else(|| anyhow!("bus connection has no unique name"))?;
            let name = format!(
                "{}_{}",
                config.observer.name_prefix,
                unique_name.replace([':', '.'], "_")
            );
            let observer = Observer::with_settings(
                name,
                filter,
                factory,
                (&config.observer).into(),
            );
            export_observer(&connection, &observer)
                .await
                .context("export observer")?;
            info!(client = %observer.name(), "telepathy-observer running");
            run(observer.subscribe(), log_observer_event).await;
        }
        Some(account) => {
            let registrar = Arc::new(DbusRegistrar::new(connection.clone()));
            let registry = ObserverRegistry::from_config(factory, registrar, &config.observer);
            let simple = match args.contact.as_deref() {
                Some(contact) => {
                    let contacts = args.connection.as_deref().map(|bus_name| {
                        Arc::new(ConnectionContactManager::new(bus.clone(), bus_name))
                            as Arc<dyn ContactManager>
                    });
                    SimpleObserver::create_for_contact(
                        &registry,
                        &account,
                        filter,
                        contact,
                        Vec::new(),
                        contacts,
                    )
                }
                None => SimpleObserver::create(&registry, &account, filter, Vec::new()),
            }
            .map_err(|err| anyhow!(err))
            .context("create observer")?;
            info!(
                client = %simple.observer().name(),
                account = %account,
                "telepathy-observer running"
            );
            run(simple.subscribe(), log_simple_event).await;
        }
    }

    info!("telepathy-observer stopped");
    Ok(())
}

async fn run<E>(mut events: UnboundedReceiver<E>, log: fn(&E)) {
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            signal = &mut shutdown => {
                info!(signal, "shutting down");
                return;
            }
            event = events.recv() => {
                let Some(event) = event else {
                    return;
                };
                log(&event);
            }
        }
    }
}

fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S%.3f").to_string()
}

fn log_observer_event(event: &ObserverEvent) {
    match event {
        ObserverEvent::NewChannels {
            account,
            channels,
            dispatch_operation,
            ..
        } => {
            info!(
                at = %timestamp(),
                account = %telepathy_core::log_snippet(account),
                dispatch_operation = %telepathy_core::log_snippet(dispatch_operation),
                channels = channels.len(),
                "new channels"
            );
            channels.iter().for_each(log_channel);
        }
        ObserverEvent::ChannelInvalidated { channel, error, .. } => {
            info!(
                at = %timestamp(),
                path = %channel.object_path(),
                error = %telepathy_core::log_snippet(&error.to_string()),
                "channel invalidated"
            );
        }
    }
}

fn log_simple_event(event: &SimpleObserverEvent) {
    match event {
        SimpleObserverEvent::NewChannels(channels) => {
            info!(at = %timestamp(), channels = channels.len(), "new channels");
            channels.iter().for_each(log_channel);
        }
        SimpleObserverEvent::ChannelInvalidated { channel, error } => {
            info!(
                at = %timestamp(),
                path = %channel.object_path(),
                error = %telepathy_core::log_snippet(&error.to_string()),
                "channel invalidated"
            );
        }
    }
}

fn log_channel(channel: &Channel) {
    info!(
        path = %channel.object_path(),
        channel_type = %channel.channel_type(),
        target = %telepathy_core::log_snippet(&channel.target_id()),
        requested = channel.is_requested(),
        "channel"
    );
    match serde_json::to_string(&channel.details()) {
        Ok(details) => debug!(path = %channel.object_path(), %details, "channel details"),
        Err(err) => debug!(path = %channel.object_path(), ?err, "channel details not serializable"),
    }
    if let Some(call) = CallChannel::from_channel(channel) {
        let path = channel.object_path().to_string();
        call.on_event(move |event| log_call_event(&path, event));
    }
}

fn log_call_event(path: &str, event: &CallEvent) {
    match event {
        CallEvent::ContentAdded(content) => {
            info!(at = %timestamp(), path, content = %content.name(), "call content added");
        }
        CallEvent::ContentRemoved { content, reason } => {
            info!(
                at = %timestamp(),
                path,
                content = %content.name(),
                reason = reason.reason,
                "call content removed"
            );
        }
        CallEvent::CallStateChanged { state, flags, .. } => {
            info!(at = %timestamp(), path, ?state, flags, "call state changed");
        }
        CallEvent::LocalHoldStateChanged { state, reason } => {
            info!(at = %timestamp(), path, ?state, ?reason, "local hold state changed");
        }
    }
}
