//! Catalog entries built from server records.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::protocol::Record;

/// One catalog entry. Identity is the server id: two items with the same id
/// compare equal even if their other fields differ.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<u32>,
    /// Server-side artwork reference (cover id or artwork track id).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artwork: Option<String>,
}

impl Item {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            artist: None,
            album: None,
            year: None,
            artwork: None,
        }
    }

    /// Build from a tagged record. `None` when the record lacks `id_key`.
    pub fn from_record(record: &Record, id_key: &str, name_key: &str) -> Option<Self> {
        let id = record.get(id_key).filter(|id| !id.is_empty())?;
        let name = record.get(name_key).unwrap_or(id);
        Some(Self {
            id: id.to_string(),
            name: name.to_string(),
            artist: record.get("artist").map(str::to_string),
            album: record.get("album").map(str::to_string),
            // "0" is what the server sends for an unknown year
            year: record
                .get("year")
                .and_then(|y| y.parse().ok())
                .filter(|y| *y > 0),
            artwork: record
                .get("coverid")
                .or_else(|| record.get("artwork_track_id"))
                .map(str::to_string),
        })
    }
}

impl PartialEq for Item {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Item {}

impl Hash for Item {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
