//! lms-cli: command-line client for the Squeezebox/LMS CLI protocol.
//!
//! Usage:
//!   lms-cli discover [timeout-ms]
//!   lms-cli connect
//!   lms-cli list <kind> [start] [count]
//!   lms-cli queue <player-id> [start] [count]
//!   lms-cli version
//!
//! The server comes from the configuration (`LMS_HOST`, `LMSC_SERVER__HOST`
//! or `config.toml`); without one, the first discovered server is used.

use std::env;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures::future::try_join_all;
use tokio::signal;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lms_cli_client::bus::{self, BusEvent};
use lms_cli_client::config::{self, Config};
use lms_cli_client::connection::{ConnectOptions, ConnectionState, ConnectionStateMachine, HandshakeResult};
use lms_cli_client::discovery::{self, DiscoveryOptions};
use lms_cli_client::library::{Catalog, ListKind, ListQuery};

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout stays machine-readable.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lms_cli_client=info,lms_cli=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = env::args().collect();
    let Some(command) = args.get(1) else {
        print_usage();
        process::exit(1);
    };

    match command.as_str() {
        "discover" => {
            let timeout_ms = parse_arg(&args, 2, 3000u64)?;
            discover(Duration::from_millis(timeout_ms)).await
        }
        "connect" => {
            let config = config::load_config()?;
            connect_and_listen(&config).await
        }
        "list" => {
            let config = config::load_config()?;
            let Some(name) = args.get(2) else {
                eprintln!("Error: Missing list kind");
                print_usage();
                process::exit(1);
            };
            let kind = ListKind::parse(name).ok_or_else(|| anyhow!("unknown list kind '{}'", name))?;
            let start = parse_arg(&args, 3, 0usize)?;
            let count = parse_arg(&args, 4, config.page_size)?;
            list(&config, ListQuery::new(kind), start, count).await
        }
        "queue" => {
            let config = config::load_config()?;
            let Some(player_id) = args.get(2) else {
                eprintln!("Error: Missing player id");
                print_usage();
                process::exit(1);
            };
            let start = parse_arg(&args, 3, 0usize)?;
            let count = parse_arg(&args, 4, config.page_size)?;
            list(&config, ListQuery::current_playlist(player_id.as_str()), start, count).await
        }
        "version" | "--version" | "-V" => {
            println!("lms-cli {} ({})", env!("LMSC_VERSION"), env!("LMSC_GIT_SHA"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            process::exit(1);
        }
    }
}

fn print_usage() {
    eprintln!("lms-cli - Squeezebox/LMS command-line client");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  lms-cli discover [timeout-ms]");
    eprintln!("  lms-cli connect");
    eprintln!("  lms-cli list <kind> [start] [count]");
    eprintln!("  lms-cli queue <player-id> [start] [count]");
    eprintln!("  lms-cli version");
    eprintln!();
    eprintln!("Kinds: artists, albums, songs, genres, years, playlists, musicfolder, players");
}

fn parse_arg<T: std::str::FromStr>(args: &[String], index: usize, default: T) -> Result<T> {
    match args.get(index) {
        Some(raw) => raw
            .parse()
            .map_err(|_| anyhow!("invalid argument '{}'", raw)),
        None => Ok(default),
    }
}

async fn discover(timeout: Duration) -> Result<()> {
    let servers = discovery::discover_servers(DiscoveryOptions {
        timeout,
        ..DiscoveryOptions::default()
    })
    .await?;
    println!("{}", serde_json::to_string_pretty(&servers)?);
    Ok(())
}

/// Configured server address, or the first one that answers discovery.
async fn resolve_address(config: &Config) -> Result<String> {
    if let Some(server) = &config.server {
        return Ok(server.address());
    }
    tracing::info!("No server configured, discovering...");
    let servers = discovery::discover_servers(DiscoveryOptions::default()).await?;
    let server = servers
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no server configured and none discovered"))?;
    tracing::info!("Using {} at {}", server.name, server.cli_address());
    Ok(server.cli_address())
}

async fn connect(config: &Config, bus: bus::SharedBus) -> Result<(ConnectionStateMachine, HandshakeResult)> {
    let address = resolve_address(config).await?;
    let machine = ConnectionStateMachine::new(bus, ConnectOptions::from(&config.session));
    let handshake = machine
        .connect(&address, config.credentials())
        .wait()
        .await
        .with_context(|| format!("connecting to {}", address))?;
    Ok((machine, handshake))
}

async fn connect_and_listen(config: &Config) -> Result<()> {
    let bus = bus::create_bus();
    let mut events = BroadcastStream::new(bus.subscribe());
    let (machine, handshake) = connect(config, bus.clone()).await?;
    println!("{}", serde_json::to_string_pretty(&handshake)?);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = events.next() => match event {
                Some(Ok(BusEvent::ServerEvent { event })) => {
                    println!("{}", serde_json::to_string(&event)?);
                }
                Some(Ok(BusEvent::ConnectionStateChanged { state: ConnectionState::Disconnected })) => {
                    tracing::warn!("Server closed the connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    tracing::warn!("Dropped {} events", skipped);
                }
                None => break,
            },
        }
    }

    machine.disconnect();
    Ok(())
}

async fn list(config: &Config, query: ListQuery, start: usize, count: usize) -> Result<()> {
    let bus = bus::create_bus();
    let (machine, handshake) = connect(config, bus.clone()).await?;

    let catalog = Catalog::new(Arc::new(machine.clone()), bus);
    catalog.set_handshake(Some(handshake));
    if !catalog.available_kinds().contains(&query.kind)
        && !matches!(query.kind, ListKind::CurrentPlaylist { .. })
    {
        machine.disconnect();
        bail!("server does not support listing {}", query.kind);
    }

    // Pages are queued together; the session still sends them one at a time.
    let list_id = catalog.open(query);
    let end = start.saturating_add(count);
    let pages = page_ranges(start, end, config.page_size)
        .map(|(page_start, page_count)| catalog.fetch_range(&list_id, page_start, page_count));
    let result = try_join_all(pages).await;
    let fetched: usize = match result {
        Ok(counts) => counts.into_iter().sum(),
        Err(e) => {
            machine.disconnect();
            return Err(e.into());
        }
    };

    let items = catalog.list(&list_id)?;
    let total = items.total_count();
    tracing::info!(
        "{}: fetched {} of {} from {} ({} cached)",
        list_id,
        fetched,
        total,
        start,
        items.fetched_count()
    );
    if let Some(gap) = items.first_missing(start, count) {
        tracing::warn!("{}: list changed while paging, first gap at {}", list_id, gap);
    }
    for index in start..end.min(total) {
        if let Some(item) = catalog.get_item(&list_id, index)? {
            let mut line = serde_json::json!({ "index": index, "item": item });
            if let Some(url) = machine.artwork_url(&item) {
                line["artwork_url"] = serde_json::Value::String(url.to_string());
            }
            println!("{}", line);
        }
    }

    machine.disconnect();
    Ok(())
}

/// `(start, count)` pages covering `[start, end)`.
fn page_ranges(start: usize, end: usize, page_size: usize) -> impl Iterator<Item = (usize, usize)> {
    let page_size = page_size.max(1);
    (start..end)
        .step_by(page_size)
        .map(move |page_start| (page_start, page_size.min(end - page_start)))
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, disconnecting..."),
        _ = terminate => tracing::info!("Received SIGTERM, disconnecting..."),
    }
}
