//! bulkexport-es
//!
//! `IndexClient` over the Elasticsearch `_search` HTTP API. Requests are
//! built in `wire`, sent by `client` on the tokio runtime; completions are
//! reported through the stage's `SearchListener`.
pub mod client;
pub mod wire;

pub use client::{EsClientConfig, EsIndexClient};
pub use wire::{parse_response, search_body};
