//! Catalog query shapes.
//!
//! Every catalog command has the form
//! `<words...> <start> <count> [tags:...] [filter:value...]` and its reply
//! echoes the words, start and count, followed by tagged records and a
//! total. The total key and the key that opens each record differ per kind:
//!
//! | kind            | command                 | record key       | total key         |
//! |-----------------|-------------------------|------------------|-------------------|
//! | artists         | `artists`               | `id`             | `count`           |
//! | albums          | `albums`                | `id`             | `count`           |
//! | songs           | `titles`                | `id`             | `count`           |
//! | genres          | `genres`                | `id`             | `count`           |
//! | years           | `years`                 | `year`           | `count`           |
//! | playlists       | `playlists`             | `id`             | `count`           |
//! | music folder    | `musicfolder`           | `id`             | `count`           |
//! | players         | `players`               | `playerindex`    | `count`           |
//! | player playlist | `<player> status`       | `playlist index` | `playlist_tracks` |

use std::fmt;

use serde::{Deserialize, Serialize};

use super::item::Item;
use super::ListId;
use crate::connection::HandshakeResult;
use crate::error::{CliError, CliResult};
use crate::protocol::codec::parse_tagged;
use crate::protocol::{Command, Reply};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ListKind {
    Artists,
    Albums,
    Songs,
    Genres,
    Years,
    Playlists,
    MusicFolder,
    Players,
    /// The play queue of one player.
    CurrentPlaylist { player_id: String },
}

impl ListKind {
    /// Parse the short name used on the command line.
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "artists" => Self::Artists,
            "albums" => Self::Albums,
            "songs" | "titles" | "tracks" => Self::Songs,
            "genres" => Self::Genres,
            "years" => Self::Years,
            "playlists" => Self::Playlists,
            "musicfolder" | "folders" => Self::MusicFolder,
            "players" => Self::Players,
            _ => return None,
        })
    }

    /// Command words preceding `<start> <count>`.
    fn words(&self) -> Vec<String> {
        match self {
            Self::Artists => vec!["artists".into()],
            Self::Albums => vec!["albums".into()],
            Self::Songs => vec!["titles".into()],
            Self::Genres => vec!["genres".into()],
            Self::Years => vec!["years".into()],
            Self::Playlists => vec!["playlists".into()],
            Self::MusicFolder => vec!["musicfolder".into()],
            Self::Players => vec!["players".into()],
            Self::CurrentPlaylist { player_id } => vec![player_id.clone(), "status".into()],
        }
    }

    fn tags(&self) -> Option<&'static str> {
        match self {
            Self::Albums => Some("tags:alyj"),
            Self::Songs | Self::CurrentPlaylist { .. } => Some("tags:alyc"),
            _ => None,
        }
    }

    fn record_key(&self) -> &'static str {
        match self {
            Self::Years => "year",
            Self::Players => "playerindex",
            Self::CurrentPlaylist { .. } => "playlist index",
            _ => "id",
        }
    }

    fn id_key(&self) -> &'static str {
        match self {
            Self::Years => "year",
            Self::Players => "playerid",
            _ => "id",
        }
    }

    fn name_key(&self) -> &'static str {
        match self {
            Self::Artists => "artist",
            Self::Albums => "album",
            Self::Songs | Self::CurrentPlaylist { .. } => "title",
            Self::Genres => "genre",
            Self::Years => "year",
            Self::Playlists => "playlist",
            Self::MusicFolder => "filename",
            Self::Players => "name",
        }
    }

    fn total_key(&self) -> &'static str {
        match self {
            Self::CurrentPlaylist { .. } => "playlist_tracks",
            _ => "count",
        }
    }

    /// Whether the server must report `can musicfolder 1` for this list.
    pub fn requires_music_folders(&self) -> bool {
        matches!(self, Self::MusicFolder)
    }
}

impl fmt::Display for ListKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CurrentPlaylist { player_id } => write!(f, "status:{}", player_id),
            other => f.write_str(&other.words().join(" ")),
        }
    }
}

/// Browsable kinds for a server with the given capabilities.
pub fn available_kinds(handshake: Option<&HandshakeResult>) -> Vec<ListKind> {
    let folders = handshake.is_some_and(|h| h.can_music_folders);
    [
        ListKind::Artists,
        ListKind::Albums,
        ListKind::Songs,
        ListKind::Genres,
        ListKind::Years,
        ListKind::Playlists,
        ListKind::MusicFolder,
        ListKind::Players,
    ]
    .into_iter()
    .filter(|kind| folders || !kind.requires_music_folders())
    .collect()
}

/// A list kind plus tagged filters (`artist_id:12`, `sort:new`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListQuery {
    pub kind: ListKind,
    pub filters: Vec<(String, String)>,
}

impl ListQuery {
    pub fn new(kind: ListKind) -> Self {
        Self {
            kind,
            filters: Vec::new(),
        }
    }

    pub fn current_playlist(player_id: impl Into<String>) -> Self {
        Self::new(ListKind::CurrentPlaylist {
            player_id: player_id.into(),
        })
    }

    /// Add or replace a filter.
    pub fn filter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        match self.filters.iter_mut().find(|(k, _)| *k == key) {
            Some(existing) => existing.1 = value,
            None => self.filters.push((key, value)),
        }
        self
    }

    pub fn artist(self, artist_id: impl Into<String>) -> Self {
        self.filter("artist_id", artist_id)
    }

    pub fn album(self, album_id: impl Into<String>) -> Self {
        self.filter("album_id", album_id)
    }

    pub fn genre(self, genre_id: impl Into<String>) -> Self {
        self.filter("genre_id", genre_id)
    }

    pub fn folder(self, folder_id: impl Into<String>) -> Self {
        self.filter("folder_id", folder_id)
    }

    pub fn sort(self, sort: impl Into<String>) -> Self {
        self.filter("sort", sort)
    }

    pub fn search(self, term: impl Into<String>) -> Self {
        self.filter("search", term)
    }

    fn has_filter(&self, key: &str) -> bool {
        self.filters.iter().any(|(k, _)| k == key)
    }

    /// Albums follow the server's preferred sort unless one was chosen.
    pub fn with_defaults(self, handshake: Option<&HandshakeResult>) -> Self {
        match handshake {
            Some(h) if self.kind == ListKind::Albums && !self.has_filter("sort") => {
                self.sort(h.album_sort.as_str())
            }
            _ => self,
        }
    }

    /// Stable id for this query: the kind plus its filters.
    pub fn list_id(&self) -> ListId {
        let mut id = self.kind.to_string();
        for (i, (key, value)) in self.filters.iter().enumerate() {
            id.push(if i == 0 { '?' } else { '&' });
            id.push_str(key);
            id.push('=');
            id.push_str(value);
        }
        ListId::from(id)
    }

    /// Command fetching `[start, start + count)`.
    pub fn command(&self, start: usize, count: usize) -> Command {
        let mut tokens = self.kind.words();
        tokens.push(start.to_string());
        tokens.push(count.to_string());
        let echo_len = tokens.len();

        if let Some(tags) = self.kind.tags() {
            tokens.push(tags.to_string());
        }
        tokens.extend(self.filters.iter().map(|(k, v)| format!("{}:{}", k, v)));

        Command::new(tokens).with_echo_len(echo_len)
    }

    /// Parse a reply into the reported total and the page's items.
    pub fn parse_page(&self, reply: &Reply) -> CliResult<Page> {
        let label = self.kind.to_string();
        let tagged = parse_tagged(reply.tail(), self.kind.record_key(), &[self.kind.total_key()]);

        let total = match tagged.header.get(self.kind.total_key()) {
            Some(raw) => raw.parse::<usize>().map_err(|_| {
                CliError::malformed(&label, format!("bad total '{}'", raw))
            })?,
            None => {
                return Err(CliError::malformed(
                    &label,
                    format!("missing '{}'", self.kind.total_key()),
                ))
            }
        };

        let items = tagged
            .records
            .iter()
            .map(|record| {
                Item::from_record(record, self.kind.id_key(), self.kind.name_key()).ok_or_else(
                    || CliError::malformed(&label, format!("record without '{}'", self.kind.id_key())),
                )
            })
            .collect::<CliResult<Vec<_>>>()?;

        Ok(Page { total, items })
    }
}

/// One decoded page.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub total: usize,
    pub items: Vec<Item>,
}
