//! Client-side catalog: sparse lists of items fetched page by page.

pub mod catalog;
pub mod item;
pub mod query;
pub mod sparse_list;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use catalog::Catalog;
pub use item::Item;
pub use query::{available_kinds, ListKind, ListQuery, Page};
pub use sparse_list::SparsePagedList;

/// Name of one list held by a [`Catalog`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListId(String);

impl ListId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ListId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ListId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for ListId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
