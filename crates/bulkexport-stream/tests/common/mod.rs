#![allow(dead_code)]

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use bulkexport_core::traits::RemainingTime;
use bulkexport_core::types::Batch;
use bulkexport_core::{Cursor, SortValue};
use bulkexport_stream::SourceSettings;
use serde_json::json;

/// Starts at `initial` and loses `step` ms on every reading.
pub struct Countdown {
    remaining: AtomicI64,
    step: i64,
}

impl Countdown {
    pub fn new(initial: i64, step: i64) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicI64::new(initial),
            step,
        })
    }
}

impl RemainingTime for Countdown {
    fn remaining_millis(&self) -> i64 {
        self.remaining.fetch_sub(self.step, Ordering::SeqCst)
    }
}

/// Lets exactly `pulls` demands through before tripping a gate configured
/// with `window` ms.
pub fn trips_after(pulls: i64, window: i64) -> Arc<dyn RemainingTime> {
    Countdown::new(window + pulls * 100, 100)
}

pub fn plenty() -> Arc<dyn RemainingTime> {
    Arc::new(|| i64::MAX)
}

/// match_all over `works`.
pub fn plain(page_size: usize) -> SourceSettings {
    SourceSettings::new("works", json!({}), page_size)
}

pub fn cursor_of(id: &str) -> Cursor {
    Cursor::new(vec![SortValue::from(id)]).expect("non-empty cursor")
}

pub fn abc_docs() -> Vec<serde_json::Value> {
    vec![json!({"id": "a"}), json!({"id": "b"}), json!({"id": "c"})]
}

pub fn batch_ids(batches: &[Batch]) -> Vec<Vec<String>> {
    batches
        .iter()
        .map(|b| b.ids().map(str::to_string).collect())
        .collect()
}

pub fn flat_ids(batches: &[Batch]) -> Vec<String> {
    batches
        .iter()
        .flat_map(|b| b.ids().map(str::to_string))
        .collect()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init();
}
