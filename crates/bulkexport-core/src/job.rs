//! Job boundary: what an invocation is given and what it hands back.
//!
//! A bulk export runs as a sequence of invocations. Each one consumes the
//! continuation cursor of the previous, makes progress, and reports a new
//! cursor. The orchestrator re-invokes until the job reports done.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::cursor::Cursor;
use crate::types::SortKey;

fn default_query() -> Value {
    serde_json::json!({ "match_all": {} })
}

fn default_page_size() -> usize {
    500
}

fn default_finalization_window_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportInput {
    pub index_name: String,
    #[serde(default = "default_query")]
    pub query: Value,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_keys: Option<Vec<SortKey>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
    #[serde(default = "default_finalization_window_ms")]
    pub finalization_window_ms: u64,
    /// Stop after this many batches even when time remains.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_batches: Option<usize>,
}

impl ExportInput {
    pub fn new(index_name: impl Into<String>, query: Value) -> Self {
        Self {
            index_name: index_name.into(),
            query,
            page_size: default_page_size(),
            sort_keys: None,
            cursor: None,
            finalization_window_ms: default_finalization_window_ms(),
            max_batches: None,
        }
    }

    pub fn finalization_window(&self) -> Duration {
        Duration::from_millis(self.finalization_window_ms)
    }
}

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The index is exhausted; the cursor is final.
    Done,
    /// Stopped on the per-invocation batch limit.
    More,
    TimedOut,
    Failed,
}

impl Outcome {
    pub fn is_done(self) -> bool {
        self == Outcome::Done
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportOutput {
    pub cursor_out: Option<Cursor>,
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub outcome: Outcome,
    pub hits_exported: u64,
    pub batches: usize,
}

/// A process that can be executed iteratively, picking up where it left off.
///
/// `iteration` counts completed invocations and orders their partial outputs.
/// The continuation is whatever lets the next invocation resume; for an index
/// export it is the search-after cursor.
pub trait Reentrant {
    type Continuation;

    fn is_done(&self) -> bool;
    fn iteration(&self) -> u32;
    fn continuation(&self) -> Option<&Self::Continuation>;
    fn complete_iteration(
        &mut self,
        is_done: bool,
        continuation: Option<Self::Continuation>,
        exception_message: Option<String>,
    );
}

/// Persisted state of an index export job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportJob {
    #[serde(flatten)]
    pub input: ExportInput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
    #[serde(default)]
    pub iteration: u32,
    #[serde(default)]
    pub is_done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_message: Option<String>,
}

impl ExportJob {
    pub fn new(input: ExportInput) -> Self {
        Self {
            input,
            output_dir: None,
            iteration: 0,
            is_done: false,
            exception_message: None,
        }
    }

    /// Fold one invocation's result into the job.
    pub fn record(&mut self, output: &ExportOutput) {
        self.complete_iteration(
            output.outcome.is_done(),
            output.cursor_out.clone(),
            output.error.clone(),
        );
    }

    /// File name for the current iteration's partial output.
    pub fn output_file_name(&self) -> String {
        let stem: String = self
            .input
            .index_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}-{:05}.txt", stem, self.iteration)
    }
}

impl Reentrant for ExportJob {
    type Continuation = Cursor;

    fn is_done(&self) -> bool {
        self.is_done
    }

    fn iteration(&self) -> u32 {
        self.iteration
    }

    fn continuation(&self) -> Option<&Cursor> {
        self.input.cursor.as_ref()
    }

    fn complete_iteration(
        &mut self,
        is_done: bool,
        continuation: Option<Cursor>,
        exception_message: Option<String>,
    ) {
        self.is_done = is_done;
        self.iteration += 1;
        self.input.cursor = continuation;
        self.exception_message = exception_message;
    }
}
