//! Domain types exchanged between the index client and the stream stages.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::cursor::Cursor;

/// Exclusive upper bound on a page size.
pub const MAX_PAGE_SIZE: usize = 1000;

pub const DEFAULT_SORT_FIELD: &str = "id";

/// Sort orientation. `Default` leaves the choice to the index server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
    #[default]
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl SortKey {
    pub fn new(field: impl Into<String>, direction: SortDirection) -> Self {
        Self {
            field: field.into(),
            direction,
        }
    }

    pub fn asc(field: impl Into<String>) -> Self {
        Self::new(field, SortDirection::Asc)
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self::new(field, SortDirection::Desc)
    }
}

/// `[("id", default)]`
pub fn default_sort_keys() -> Vec<SortKey> {
    vec![SortKey::new(DEFAULT_SORT_FIELD, SortDirection::Default)]
}

/// One page request. `query_text` is the effective query fragment in its
/// canonical JSON form; clients wrap it verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub index_name: String,
    pub query_text: String,
    pub page_size: usize,
    pub sort_keys: Vec<SortKey>,
    pub cursor: Option<Cursor>,
}

/// A document handle. Only the id and its sort values are fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    pub id: String,
    pub sort_values: Cursor,
}

impl Hit {
    pub fn new(id: impl Into<String>, sort_values: Cursor) -> Self {
        Self {
            id: id.into(),
            sort_values,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TotalRelation {
    Equal,
    GreaterThanOrEqual,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchResponse {
    pub hits: Vec<Hit>,
    pub total_hits: u64,
    pub total_relation: TotalRelation,
    pub took: Duration,
}

impl SearchResponse {
    pub fn new(hits: Vec<Hit>, total_hits: u64, total_relation: TotalRelation) -> Self {
        Self {
            hits,
            total_hits,
            total_relation,
            took: Duration::ZERO,
        }
    }

    /// Total hits as the index reports it, e.g. `10000+`.
    pub fn total_display(&self) -> String {
        match self.total_relation {
            TotalRelation::Equal => self.total_hits.to_string(),
            TotalRelation::GreaterThanOrEqual => format!("{}+", self.total_hits),
        }
    }
}

/// An ordered, non-empty page of hits as it travels downstream.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    hits: Vec<Hit>,
}

impl Batch {
    /// Returns `None` for an empty hit list.
    pub fn new(hits: Vec<Hit>) -> Option<Self> {
        if hits.is_empty() {
            None
        } else {
            Some(Self { hits })
        }
    }

    pub fn hits(&self) -> &[Hit] {
        &self.hits
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.hits.iter().map(|h| h.id.as_str())
    }

    pub fn first_sort_values(&self) -> &Cursor {
        &self.hits[0].sort_values
    }

    /// The cursor a follow-up request must carry.
    pub fn cursor(&self) -> &Cursor {
        &self.hits[self.hits.len() - 1].sort_values
    }
}
