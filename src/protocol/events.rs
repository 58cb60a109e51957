//! Parsing of server-pushed event lines.
//!
//! Once `listen 1` is active the server interleaves notifications with
//! replies. Player notifications start with the player id (a MAC address):
//!
//! - `00:04:20:aa:bb:cc playlist newsong Track%20Name 5`
//! - `00:04:20:aa:bb:cc mixer volume 75`
//! - `00:04:20:aa:bb:cc power 1`
//! - `00:04:20:aa:bb:cc client new`
//!
//! Server-wide notifications have no player prefix (`rescan done`).

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static PLAYER_ID: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[0-9A-Fa-f]{2}(:[0-9A-Fa-f]{2}){5}$").ok());

/// Whether a decoded token looks like a player id.
pub fn is_player_id(token: &str) -> bool {
    PLAYER_ID
        .as_ref()
        .map(|re| re.is_match(token))
        .unwrap_or(false)
}

/// Notification pushed by the server outside request/reply correlation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Playlist changed (newsong, play, stop, pause, add, delete, move...)
    Playlist {
        player_id: String,
        command: String,
        /// Track name for newsong events
        track_name: Option<String>,
        /// Playlist index for newsong events
        index: Option<u32>,
    },
    /// Mixer changed (volume, muting)
    Mixer {
        player_id: String,
        param: String,
        /// None when the value does not parse (avoids silent conversion to 0)
        value: Option<i32>,
    },
    Power { player_id: String, state: bool },
    /// Client connected/disconnected/new/forget
    Client { player_id: String, action: String },
    /// Library rescan progress; `done` is set on completion.
    Rescan { done: bool },
    Unknown { raw_line: String },
}

impl ServerEvent {
    pub fn player_id(&self) -> Option<&str> {
        match self {
            Self::Playlist { player_id, .. }
            | Self::Mixer { player_id, .. }
            | Self::Power { player_id, .. }
            | Self::Client { player_id, .. } => Some(player_id),
            Self::Rescan { .. } | Self::Unknown { .. } => None,
        }
    }
}

/// Classify an already-decoded event line.
pub fn parse_server_event(tokens: &[String], raw_line: &str) -> ServerEvent {
    let unknown = || ServerEvent::Unknown {
        raw_line: raw_line.trim().to_string(),
    };

    let Some(first) = tokens.first() else {
        return unknown();
    };

    if !is_player_id(first) {
        return match (first.as_str(), tokens.get(1).map(String::as_str)) {
            ("rescan", Some("done")) => ServerEvent::Rescan { done: true },
            ("rescan", _) => ServerEvent::Rescan { done: false },
            _ => unknown(),
        };
    }

    let player_id = first.clone();
    let arg = |i: usize| tokens.get(i).map(String::as_str);

    match arg(1) {
        Some("playlist") => ServerEvent::Playlist {
            player_id,
            command: arg(2).unwrap_or("").to_string(),
            track_name: arg(3).map(str::to_string),
            index: arg(4).and_then(|s| s.parse().ok()),
        },
        Some("mixer") => ServerEvent::Mixer {
            player_id,
            param: arg(2).unwrap_or("volume").to_string(),
            value: arg(3).and_then(|s| s.parse().ok()),
        },
        Some("power") => ServerEvent::Power {
            player_id,
            state: arg(2) == Some("1"),
        },
        Some("client") => ServerEvent::Client {
            player_id,
            action: arg(2).unwrap_or("unknown").to_string(),
        },
        _ => unknown(),
    }
}
