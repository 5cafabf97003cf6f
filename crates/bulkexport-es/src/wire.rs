//! `_search` request bodies and response parsing.
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;

use bulkexport_core::error::{Error, Result};
use bulkexport_core::types::{
    Hit, SearchRequest, SearchResponse, SortDirection, SortKey, TotalRelation,
};
use bulkexport_core::{Cursor, SortValue};

fn sort_clause(key: &SortKey) -> Value {
    let order = match key.direction {
        SortDirection::Default => return Value::String(key.field.clone()),
        SortDirection::Asc => "asc",
        SortDirection::Desc => "desc",
    };
    let mut clause = Map::new();
    clause.insert(key.field.clone(), json!({ "order": order }));
    Value::Object(clause)
}

/// Body for one page. The query text travels base64-encoded inside a
/// `wrapper` query so it reaches the server exactly as supplied.
pub fn search_body(request: &SearchRequest) -> Value {
    let mut body = Map::new();
    body.insert("_source".into(), Value::Bool(false));
    body.insert("size".into(), Value::from(request.page_size));
    body.insert("track_total_hits".into(), Value::Bool(true));
    body.insert(
        "query".into(),
        json!({ "wrapper": { "query": STANDARD.encode(&request.query_text) } }),
    );
    let sort = request.sort_keys.iter().map(sort_clause).collect();
    body.insert("sort".into(), Value::Array(sort));
    if let Some(cursor) = &request.cursor {
        body.insert("search_after".into(), Value::from(cursor.clone()));
    }
    Value::Object(body)
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    #[serde(default)]
    took: u64,
    hits: RawHits,
}

#[derive(Debug, Deserialize)]
struct RawHits {
    #[serde(default)]
    total: Option<RawTotal>,
    #[serde(default)]
    hits: Vec<RawHit>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTotal {
    Tracked { value: u64, relation: String },
    Legacy(u64),
}

#[derive(Debug, Deserialize)]
struct RawHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(default)]
    sort: Vec<Value>,
}

/// Parse a `_search` response body. Hits without sort values are rejected:
/// the stream could not resume after them.
pub fn parse_response(payload: &[u8]) -> Result<SearchResponse> {
    let raw: RawResponse = serde_json::from_slice(payload)
        .map_err(|e| Error::Index(format!("malformed search response: {e}")))?;

    let mut hits = Vec::with_capacity(raw.hits.hits.len());
    for hit in raw.hits.hits {
        if hit.sort.is_empty() {
            return Err(Error::Index(format!(
                "hit `{}` carries no sort values",
                hit.id
            )));
        }
        let sort_values = hit
            .sort
            .into_iter()
            .map(SortValue::try_from)
            .collect::<Result<Vec<_>>>()?;
        hits.push(Hit::new(hit.id, Cursor::new(sort_values)?));
    }

    let (total_hits, total_relation) = match raw.hits.total {
        Some(RawTotal::Tracked { value, relation }) if relation == "gte" => {
            (value, TotalRelation::GreaterThanOrEqual)
        }
        Some(RawTotal::Tracked { value, .. } | RawTotal::Legacy(value)) => {
            (value, TotalRelation::Equal)
        }
        None => (hits.len() as u64, TotalRelation::Equal),
    };

    Ok(SearchResponse {
        hits,
        total_hits,
        total_relation,
        took: Duration::from_millis(raw.took),
    })
}
