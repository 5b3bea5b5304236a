//! Command-line inspection of remote Telepathy channels.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use telepathy_core::constants::{IFACE_CHANNEL, PROP_CHANNEL_TYPE};
use telepathy_core::{
    BusKind, CallChannel, Channel, ChannelFactory, ClientConfig, ContactSearchChannel, DBusProxy,
    PendingOperation, PendingReply, PropertyMap, SearchEvent, SearchState, Variant, ZbusBus,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print JSON instead of plain lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Make a channel ready and print its state
    Inspect {
        connection: String,
        channel: String,
    },
    /// Run a contact search and print results as they arrive
    Search {
        connection: String,
        channel: String,
        /// Search term as key=value; repeatable
        #[arg(long = "term", value_parser = parse_term, required = true)]
        terms: Vec<(String, String)>,
    },
}

fn parse_term(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))?;
    if key.is_empty() {
        return Err("search key must not be empty".to_string());
    }
    Ok((key.to_string(), value.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = match args.config.as_ref() {
        Some(path) => ClientConfig::load_from_path(path).context("read config from path")?,
        None => ClientConfig::load_default().context("read default config")?,
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.general.log_level.as_deref().unwrap_or("warn")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let timeout = config.introspection.call_timeout();
    let bus = match config.bus.kind {
        BusKind::Session => ZbusBus::session(timeout)
            .await
            .context("connect to session bus")?,
        BusKind::System => ZbusBus::system(timeout)
            .await
            .context("connect to system bus")?,
    };
    let factory = ChannelFactory::new(bus);

    match args.command {
        Command::Inspect {
            connection,
            channel,
        } => {
            let channel = open_channel(&factory, &connection, &channel).await?;
            print_inspection(&channel, args.json)?;
        }
        Command::Search {
            connection,
            channel,
            terms,
        } => {
            let channel = open_channel(&factory, &connection, &channel).await?;
            let search = ContactSearchChannel::from_channel(&channel)
                .ok_or_else(|| anyhow!("{} is not a contact search channel", channel.object_path()))?;
            run_search(&search, terms.into_iter().collect(), args.json).await?;
        }
    }
    Ok(())
}

async fn wait(operation: &PendingOperation) -> Result<()> {
    operation.finished().await.map_err(|err| anyhow!(err))
}

async fn wait_reply<T: Clone + Send + 'static>(reply: PendingReply<T>) -> Result<T> {
    wait(reply.operation()).await?;
    reply
        .value()
        .ok_or_else(|| anyhow!("reply finished without a value"))
}

/// Build the typed channel and make the factory's features ready on it.
async fn open_channel(factory: &ChannelFactory, connection: &str, path: &str) -> Result<Channel> {
    let probe = DBusProxy::new(factory.bus().clone(), connection, path);
    let channel_type = wait_reply(probe.get(IFACE_CHANNEL, "ChannelType"))
        .await
        .context("read channel type")?;
    let channel_type = channel_type
        .as_str()
        .ok_or_else(|| anyhow!("ChannelType is not a string"))?
        .to_string();
    debug!(path, channel_type = %channel_type, "probed channel type");

    let mut immutable = PropertyMap::new();
    immutable.insert(PROP_CHANNEL_TYPE.to_string(), Variant::Str(channel_type));
    let channel = factory.create(connection, path, immutable);
    let features = factory.features_for(&channel);
    let ready = channel.become_ready(features.clone());
    if let Err(err) = wait(&ready).await {
        warn!(path, error = %err, "channel did not become ready");
        return Err(err.context("make channel ready"));
    }
    debug!(path, features = features.len(), "channel ready");
    Ok(channel)
}

#[derive(Serialize)]
struct ContentView {
    name: String,
    content_type: u32,
    disposition: u32,
    streams: Vec<String>,
}

fn print_inspection(channel: &Channel, as_json: bool) -> Result<()> {
    let mut report = json!({ "channel": channel.details(), "path": channel.object_path() });
    if let Some(call) = CallChannel::from_channel(channel) {
        let contents: Vec<ContentView> = call
            .contents()
            .iter()
            .map(|content| ContentView {
                name: content.name(),
                content_type: content.content_type(),
                disposition: content.disposition(),
                streams: content.streams(),
            })
            .collect();
        report["call"] = json!({
            "state": call.call_state(),
            "flags": call.call_flags(),
            "reason": call.call_state_reason(),
            "hardware_streaming": call.hardware_streaming(),
            "contents": contents,
        });
    }
    if let Some(search) = ContactSearchChannel::from_channel(channel) {
        report["search"] = json!({
            "state": search.search_state(),
            "limit": search.limit(),
            "keys": search.available_search_keys(),
            "server": search.server(),
        });
    }

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!("{} ({})", channel.object_path(), channel.channel_type());
    println!("  target: {}", channel.target_id());
    println!("  requested: {}", channel.is_requested());
    println!("  interfaces: {}", channel.interfaces().join(", "));
    if let Some(call) = CallChannel::from_channel(channel) {
        println!("  call state: {:?} (flags {})", call.call_state(), call.call_flags());
        for content in call.contents() {
            println!("  - content {} ({} streams)", content.name(), content.streams().len());
        }
    }
    if let Some(search) = ContactSearchChannel::from_channel(channel) {
        println!("  search state: {:?}", search.search_state());
        println!("  limit: {}", search.limit());
        println!("  keys: {}", search.available_search_keys().join(", "));
    }
    Ok(())
}

async fn run_search(
    search: &ContactSearchChannel,
    terms: BTreeMap<String, String>,
    as_json: bool,
) -> Result<()> {
    let mut events = search.subscribe();
    let request = search.search(terms);
    wait(&request).await.context("start search")?;

    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                info!(path = %search.object_path(), "interrupted, stopping search");
                wait(&search.stop_search()).await.context("stop search")?;
                continue;
            }
        };
        let Some(event) = event else {
            bail!("search channel went away");
        };
        match event {
            SearchEvent::ResultReceived(result) => {
                for (contact, fields) in &result {
                    if as_json {
                        println!("{}", json!({ "contact": contact, "fields": fields }));
                        continue;
                    }
                    println!("{contact}");
                    for field in fields {
                        println!("  {}: {}", field.field_name, field.field_value.join(" "));
                    }
                }
            }
            SearchEvent::StateChanged {
                state, error_name, ..
            } => {
                if as_json {
                    println!("{}", json!({ "state": state, "error": error_name }));
                } else {
                    println!("{}", state_line(state, &error_name));
                }
                if !error_name.is_empty() {
                    warn!(
                        path = %search.object_path(),
                        error = %telepathy_core::log_snippet(&error_name),
                        "search reported an error"
                    );
                }
                if state.is_final() {
                    return Ok(());
                }
            }
        }
    }
}

fn state_line(state: SearchState, error_name: &str) -> String {
    if error_name.is_empty() {
        format!("search state: {state:?}")
    } else {
        format!("search state: {state:?} ({error_name})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terms_split_on_first_equals() {
        assert_eq!(
            parse_term("x-n-given=Ali=ce"),
            Ok(("x-n-given".to_string(), "Ali=ce".to_string()))
        );
        assert!(parse_term("nickname").is_err());
        assert!(parse_term("=bob").is_err());
    }

    #[test]
    fn state_lines_mention_errors_only_when_present() {
        assert_eq!(
            state_line(SearchState::Completed, ""),
            "search state: Completed"
        );
        assert_eq!(
            state_line(SearchState::Failed, "org.freedesktop.Telepathy.Error.NetworkError"),
            "search state: Failed (org.freedesktop.Telepathy.Error.NetworkError)"
        );
    }
}
