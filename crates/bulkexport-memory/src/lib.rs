//! bulkexport-memory
//!
//! An in-process index over JSON documents implementing `IndexClient`.
//! Supports a small query subset (`match_all`, `term`, `terms`, `ids`,
//! `bool.must`/`bool.filter`), multi-key sorting and search-after. Every call
//! is recorded so tests can assert on request sequencing and concurrency.
use anyhow::Context;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

use bulkexport_core::error::{Error, Result};
use bulkexport_core::traits::{IndexClient, SearchListener};
use bulkexport_core::types::{Hit, SearchRequest, SearchResponse, SortKey, TotalRelation};
use bulkexport_core::{Cursor, SortValue};

#[derive(Debug, Clone)]
struct Document {
    id: String,
    source: Value,
}

impl Document {
    fn new(position: usize, source: Value) -> Self {
        let id = match source.get("id").or_else(|| source.get("_id")) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => position.to_string(),
        };
        Self { id, source }
    }

    fn field(&self, path: &str) -> Option<&Value> {
        path.split('.').try_fold(&self.source, |value, part| value.get(part))
    }

    fn sort_tuple(&self, keys: &[SortKey]) -> Result<Cursor> {
        let values = keys
            .iter()
            .map(|key| {
                if key.field == "_id" {
                    return SortValue::String(self.id.clone());
                }
                self.field(&key.field)
                    .cloned()
                    .and_then(|v| SortValue::try_from(v).ok())
                    .unwrap_or(SortValue::Null)
            })
            .collect();
        Cursor::new(values)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Query {
    MatchAll,
    Term { field: String, value: Value },
    Terms { field: String, values: Vec<Value> },
    Ids(Vec<String>),
    All(Vec<Query>),
}

fn single_entry<'a>(body: &'a Value, clause: &str) -> Result<(&'a String, &'a Value)> {
    let obj = body
        .as_object()
        .filter(|o| o.len() == 1)
        .ok_or_else(|| Error::Index(format!("`{clause}` expects a single field")))?;
    obj.iter()
        .next()
        .ok_or_else(|| Error::Index(format!("`{clause}` expects a single field")))
}

fn clause_list(value: Option<&Value>) -> Vec<&Value> {
    match value {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(other) => vec![other],
        None => Vec::new(),
    }
}

impl Query {
    fn parse(value: &Value) -> Result<Self> {
        let obj: &Map<String, Value> = value
            .as_object()
            .ok_or_else(|| Error::Index("query must be a JSON object".into()))?;
        if obj.is_empty() {
            return Ok(Query::MatchAll);
        }
        let (kind, body) = single_entry(value, "query")?;
        match kind.as_str() {
            "match_all" => Ok(Query::MatchAll),
            "term" => {
                let (field, term) = single_entry(body, "term")?;
                let value = term.get("value").unwrap_or(term).clone();
                Ok(Query::Term {
                    field: field.clone(),
                    value,
                })
            }
            "terms" => {
                let (field, values) = single_entry(body, "terms")?;
                let values = values
                    .as_array()
                    .cloned()
                    .ok_or_else(|| Error::Index("`terms` expects an array".into()))?;
                Ok(Query::Terms {
                    field: field.clone(),
                    values,
                })
            }
            "ids" => {
                let ids = body
                    .get("values")
                    .and_then(Value::as_array)
                    .ok_or_else(|| Error::Index("`ids` expects `values`".into()))?
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect();
                Ok(Query::Ids(ids))
            }
            "bool" => {
                let clauses = clause_list(body.get("must"))
                    .into_iter()
                    .chain(clause_list(body.get("filter")))
                    .map(Query::parse)
                    .collect::<Result<Vec<_>>>()?;
                Ok(Query::All(clauses))
            }
            other => Err(Error::Index(format!("unsupported query clause `{other}`"))),
        }
    }

    fn matches(&self, doc: &Document) -> bool {
        match self {
            Query::MatchAll => true,
            Query::Term { field, value } => field_contains(doc, field, |v| v == value),
            Query::Terms { field, values } => {
                field_contains(doc, field, |v| values.contains(v))
            }
            Query::Ids(ids) => ids.contains(&doc.id),
            Query::All(clauses) => clauses.iter().all(|q| q.matches(doc)),
        }
    }
}

fn field_contains(doc: &Document, field: &str, pred: impl Fn(&Value) -> bool) -> bool {
    match doc.field(field) {
        Some(Value::Array(items)) => items.iter().any(pred),
        Some(v) => pred(v),
        None => false,
    }
}

/// Call counters shared between clones of a [`MemoryIndex`].
#[derive(Debug, Default)]
pub struct CallStats {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    requests: Mutex<Vec<SearchRequest>>,
}

impl CallStats {
    pub fn calls(&self) -> usize {
        self.calls.load(AtomicOrdering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(AtomicOrdering::SeqCst)
    }

    /// Highest number of requests outstanding at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(AtomicOrdering::SeqCst)
    }

    pub fn requests(&self) -> Vec<SearchRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn record(&self, request: &SearchRequest) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(request.clone());
        let now = self.in_flight.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, AtomicOrdering::SeqCst);
        self.calls.fetch_add(1, AtomicOrdering::SeqCst) + 1
    }
}

#[derive(Debug, Clone)]
pub struct MemoryIndex {
    name: String,
    docs: Arc<Vec<Document>>,
    stats: Arc<CallStats>,
    fail_on_call: Option<usize>,
    latency: Option<Duration>,
    total_hits_cap: Option<u64>,
}

impl MemoryIndex {
    pub fn new(name: impl Into<String>, docs: Vec<Value>) -> Self {
        let docs = docs
            .into_iter()
            .enumerate()
            .map(|(i, d)| Document::new(i, d))
            .collect();
        Self {
            name: name.into(),
            docs: Arc::new(docs),
            stats: Arc::new(CallStats::default()),
            fail_on_call: None,
            latency: None,
            total_hits_cap: None,
        }
    }

    /// `n` documents `{"id": "doc-00000", "seq": 0}` ... ids sort like `seq`.
    pub fn sequential(name: impl Into<String>, n: usize) -> Self {
        let docs = (0..n)
            .map(|i| serde_json::json!({ "id": format!("doc-{i:05}"), "seq": i }))
            .collect();
        Self::new(name, docs)
    }

    /// One JSON document per line; blank lines are skipped.
    pub fn from_jsonl(name: impl Into<String>, path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut docs = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let doc: Value = serde_json::from_str(line).with_context(|| {
                format!("{}:{}: invalid JSON document", path.display(), line_no + 1)
            })?;
            docs.push(doc);
        }
        Ok(Self::new(name, docs))
    }

    /// Make the `call`-th request (1-based) fail with an index error.
    pub fn with_failure_on_call(mut self, call: usize) -> Self {
        self.fail_on_call = Some(call);
        self
    }

    /// Deliver every response after `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Report totals above `cap` as `cap+`, like an index that stops counting.
    pub fn with_total_hits_cap(mut self, cap: u64) -> Self {
        self.total_hits_cap = Some(cap);
        self
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn stats(&self) -> Arc<CallStats> {
        Arc::clone(&self.stats)
    }

    /// Evaluate one page synchronously.
    pub fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        if request.index_name != self.name {
            return Err(Error::NotFound(format!(
                "no such index `{}`",
                request.index_name
            )));
        }
        let started = Instant::now();
        let query_value: Value = serde_json::from_str(&request.query_text)
            .map_err(|e| Error::Index(format!("malformed query: {e}")))?;
        let query = Query::parse(&query_value)?;
        let keys = &request.sort_keys;
        if keys.is_empty() {
            return Err(Error::Index("search needs at least one sort key".into()));
        }

        let mut matched: Vec<(&Document, Cursor)> = self
            .docs
            .iter()
            .filter(|d| query.matches(d))
            .map(|d| Ok((d, d.sort_tuple(keys)?)))
            .collect::<Result<_>>()?;
        let total = matched.len() as u64;
        matched.sort_by(|a, b| a.1.compare(&b.1, keys));

        let hits: Vec<Hit> = matched
            .into_iter()
            .filter(|(_, tuple)| match &request.cursor {
                Some(after) => tuple.compare(after, keys) == Ordering::Greater,
                None => true,
            })
            .take(request.page_size)
            .map(|(d, tuple)| Hit::new(d.id.clone(), tuple))
            .collect();

        let (total_hits, total_relation) = match self.total_hits_cap {
            Some(cap) if total > cap => (cap, TotalRelation::GreaterThanOrEqual),
            _ => (total, TotalRelation::Equal),
        };
        debug!(index = %self.name, hits = hits.len(), total, "memory search");
        Ok(SearchResponse {
            hits,
            total_hits,
            total_relation,
            took: started.elapsed(),
        })
    }
}

impl IndexClient for MemoryIndex {
    fn search_async(&self, request: SearchRequest, listener: Box<dyn SearchListener>) {
        let call = self.stats.record(&request);
        let result = if self.fail_on_call == Some(call) {
            Err(Error::Index(format!("injected failure on call {call}")))
        } else {
            self.search(&request)
        };
        let stats = Arc::clone(&self.stats);
        let latency = self.latency;
        tokio::spawn(async move {
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            stats.in_flight.fetch_sub(1, AtomicOrdering::SeqCst);
            match result {
                Ok(response) => listener.on_response(response),
                Err(error) => listener.on_failure(error),
            }
        });
    }
}
