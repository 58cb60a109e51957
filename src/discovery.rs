//! Server discovery via UDP broadcast on port 3483.
//!
//! The request is `e` followed by the wanted tags, each NUL-terminated.
//! Servers answer with `E` followed by `<tag:4><len:1><value:len>` fields:
//!
//! ```text
//! E IPAD\x0c192.168.1.50 NAME\x0aHome Music CLIP\x049090 UUID\x24... VERS\x058.5.1
//! ```
//!
//! Try it by hand:
//! ```bash
//! echo -ne "eIPAD\x00NAME\x00CLIP\x00UUID\x00VERS\x00" | socat -t5 - udp-datagram:255.255.255.255:3483,broadcast | od -Ax -c
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::protocol::DEFAULT_CLI_PORT;

pub const DISCOVERY_PORT: u16 = 3483;
const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(3);
const DISCOVERY_REQUEST: &[u8] = b"eIPAD\x00NAME\x00CLIP\x00UUID\x00VERS\x00JSON\x00";

/// A server that answered the broadcast.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoveredServer {
    pub host: String,
    pub cli_port: u16,
    pub name: String,
    pub uuid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Web port, when announced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,
}

impl DiscoveredServer {
    /// `host:port` of the CLI.
    pub fn cli_address(&self) -> String {
        format!("{}:{}", self.host, self.cli_port)
    }

    fn dedup_key(&self) -> &str {
        if self.uuid.is_empty() {
            &self.host
        } else {
            &self.uuid
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DiscoveryOptions {
    /// Where the request is sent; the limited broadcast address by default.
    pub target: SocketAddr,
    /// How long to collect answers.
    pub timeout: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            target: SocketAddr::from(([255, 255, 255, 255], DISCOVERY_PORT)),
            timeout: DEFAULT_DISCOVERY_TIMEOUT,
        }
    }
}

/// Split the fields of a response. `None` if the marker byte is wrong.
///
/// A field whose declared length runs past the datagram ends parsing;
/// fields read before it are kept.
fn parse_fields(data: &[u8]) -> Option<HashMap<[u8; 4], String>> {
    let (&marker, mut rest) = data.split_first()?;
    if marker != b'E' {
        debug!(marker, "discovery: not a response");
        return None;
    }

    let mut fields = HashMap::new();
    while rest.len() >= 5 {
        let mut tag = [0u8; 4];
        tag.copy_from_slice(&rest[..4]);
        let len = rest[4] as usize;
        rest = &rest[5..];

        if len > rest.len() {
            debug!(
                tag = %String::from_utf8_lossy(&tag),
                len,
                available = rest.len(),
                "discovery: truncated field"
            );
            break;
        }
        let (value, tail) = rest.split_at(len);
        fields.insert(tag, String::from_utf8_lossy(value).into_owned());
        rest = tail;
    }
    Some(fields)
}

/// Build a server entry from one response datagram.
fn parse_response(data: &[u8], source: &SocketAddr) -> Option<DiscoveredServer> {
    let fields = parse_fields(data)?;
    let field = |tag: &[u8; 4]| fields.get(tag).filter(|v| !v.is_empty());

    let Some(name) = field(b"NAME") else {
        debug!(%source, "discovery: response without a name");
        return None;
    };

    Some(DiscoveredServer {
        host: field(b"IPAD")
            .cloned()
            .unwrap_or_else(|| source.ip().to_string()),
        cli_port: field(b"CLIP")
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_CLI_PORT),
        name: name.clone(),
        uuid: field(b"UUID").cloned().unwrap_or_default(),
        version: field(b"VERS").cloned(),
        http_port: field(b"JSON").and_then(|p| p.parse().ok()),
    })
}

/// Broadcast a discovery request and collect answers until the timeout.
///
/// Servers are deduplicated by uuid (or host when a server sends none).
pub async fn discover_servers(options: DiscoveryOptions) -> Result<Vec<DiscoveredServer>> {
    let bind: SocketAddr = if options.target.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.set_broadcast(true)?;
    socket.send_to(DISCOVERY_REQUEST, options.target).await?;
    debug!(target = %options.target, "discovery request sent");

    let mut found: HashMap<String, DiscoveredServer> = HashMap::new();
    let mut buf = [0u8; 1500];
    let deadline = Instant::now() + options.timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, source))) => {
                debug!(%source, len, "discovery response");
                if let Some(server) = parse_response(&buf[..len], &source) {
                    found.insert(server.dedup_key().to_string(), server);
                }
            }
            Ok(Err(e)) => {
                warn!("discovery receive failed: {}", e);
                break;
            }
            Err(_) => break,
        }
    }

    let mut servers: Vec<DiscoveredServer> = found.into_values().collect();
    servers.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.host.cmp(&b.host)));
    info!("discovery found {} server(s)", servers.len());
    Ok(servers)
}
