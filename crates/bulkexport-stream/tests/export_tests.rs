mod common;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::bail;
use serde_json::json;

use bulkexport_core::job::{ExportInput, ExportJob, ExportOutput, Outcome, Reentrant};
use bulkexport_core::traits::RemainingTime;
use bulkexport_core::types::Batch;
use bulkexport_core::Error;
use bulkexport_memory::MemoryIndex;
use bulkexport_stream::{run_invocation, BatchSink};

use common::{cursor_of, flat_ids, init_tracing, plenty, Countdown};

fn input(page_size: usize) -> ExportInput {
    ExportInput {
        page_size,
        ..ExportInput::new("works", json!({"query": {"match_all": {}}}))
    }
}

async fn export<K: BatchSink>(
    index: &MemoryIndex,
    input: &ExportInput,
    oracle: Arc<dyn RemainingTime>,
    sink: &mut K,
) -> ExportOutput {
    run_invocation(Arc::new(index.clone()), input, oracle, sink)
        .await
        .expect("runs")
}

/// Accepts batches until the `fail_on`-th write (1-based).
struct FlakySink {
    accepted: Vec<Batch>,
    fail_on: usize,
    writes: usize,
}

impl BatchSink for FlakySink {
    async fn write_batch(&mut self, batch: &Batch) -> anyhow::Result<()> {
        self.writes += 1;
        if self.writes == self.fail_on {
            bail!("disk full");
        }
        self.accepted.push(batch.clone());
        Ok(())
    }
}

#[tokio::test]
async fn exhausting_the_index_is_done() {
    init_tracing();
    let index = MemoryIndex::sequential("works", 3);
    let mut sink: Vec<Batch> = Vec::new();
    let out = export(&index, &input(2), plenty(), &mut sink).await;

    assert_eq!(out.outcome, Outcome::Done);
    assert!(!out.timed_out);
    assert_eq!(out.error, None);
    assert_eq!(out.cursor_out, Some(cursor_of("doc-00002")));
    assert_eq!((out.hits_exported, out.batches), (3, 2));
    assert_eq!(flat_ids(&sink), vec!["doc-00000", "doc-00001", "doc-00002"]);
}

#[tokio::test]
async fn timed_out_invocation_resumes_without_loss() {
    let index = MemoryIndex::sequential("works", 1000);
    let first_input = ExportInput {
        finalization_window_ms: 5_000,
        ..input(100)
    };

    let mut first: Vec<Batch> = Vec::new();
    let oracle = Countdown::new(10_000, 1_000);
    let out = export(&index, &first_input, oracle, &mut first).await;
    assert_eq!(out.outcome, Outcome::TimedOut);
    assert!(out.timed_out);
    assert_eq!(out.hits_exported, 600);
    assert_eq!(out.cursor_out, Some(cursor_of("doc-00599")));

    let resumed = ExportInput {
        cursor: out.cursor_out.clone(),
        ..first_input
    };
    let mut second: Vec<Batch> = Vec::new();
    let out = export(&index, &resumed, plenty(), &mut second).await;
    assert_eq!(out.outcome, Outcome::Done);
    assert_eq!(out.hits_exported, 400);

    let mut all = flat_ids(&first);
    all.extend(flat_ids(&second));
    let unique: HashSet<_> = all.iter().collect();
    assert_eq!(all.len(), 1000);
    assert_eq!(unique.len(), 1000, "no document is exported twice");
}

#[tokio::test]
async fn index_failure_reports_the_last_written_cursor() {
    let index = MemoryIndex::sequential("works", 5).with_failure_on_call(2);
    let mut sink: Vec<Batch> = Vec::new();
    let out = export(&index, &input(2), plenty(), &mut sink).await;

    assert_eq!(out.outcome, Outcome::Failed);
    assert!(!out.timed_out);
    assert!(
        out.error
            .as_deref()
            .is_some_and(|e| e.contains("injected failure")),
        "{:?}",
        out.error
    );
    assert_eq!(out.cursor_out, Some(cursor_of("doc-00001")));
    assert_eq!(out.hits_exported, 2);
}

#[tokio::test]
async fn sink_failure_keeps_the_cursor_at_the_last_accepted_batch() {
    let index = MemoryIndex::sequential("works", 50);
    let mut sink = FlakySink {
        accepted: Vec::new(),
        fail_on: 2,
        writes: 0,
    };
    let out = export(&index, &input(10), plenty(), &mut sink).await;

    assert_eq!(out.outcome, Outcome::Failed);
    assert_eq!(out.error.as_deref(), Some("disk full"));
    assert_eq!(sink.accepted.len(), 1);
    assert_eq!(out.cursor_out.as_ref(), Some(sink.accepted[0].cursor()));
    assert_eq!(out.batches, 1);
}

#[tokio::test]
async fn batch_limit_asks_for_another_invocation() {
    let index = MemoryIndex::sequential("works", 50);
    let limited = ExportInput {
        max_batches: Some(2),
        ..input(10)
    };
    let mut sink: Vec<Batch> = Vec::new();
    let out = export(&index, &limited, plenty(), &mut sink).await;

    assert_eq!(out.outcome, Outcome::More);
    assert!(!out.timed_out);
    assert_eq!(out.cursor_out, Some(cursor_of("doc-00019")));
    assert_eq!(out.hits_exported, 20);
}

#[tokio::test]
async fn resuming_from_a_start_cursor_skips_earlier_hits() {
    let index = MemoryIndex::sequential("works", 10);
    let resumed = ExportInput {
        cursor: Some(cursor_of("doc-00006")),
        ..input(5)
    };
    let mut sink: Vec<Batch> = Vec::new();
    let out = export(&index, &resumed, plenty(), &mut sink).await;

    assert_eq!(flat_ids(&sink), vec!["doc-00007", "doc-00008", "doc-00009"]);
    assert_eq!(out.cursor_out, Some(cursor_of("doc-00009")));
}

#[tokio::test]
async fn nothing_left_keeps_the_incoming_cursor() {
    let index = MemoryIndex::sequential("works", 10);
    let resumed = ExportInput {
        cursor: Some(cursor_of("doc-00009")),
        ..input(5)
    };
    let mut sink: Vec<Batch> = Vec::new();
    let out = export(&index, &resumed, plenty(), &mut sink).await;

    assert_eq!(out.outcome, Outcome::Done);
    assert!(sink.is_empty());
    assert_eq!(out.cursor_out, Some(cursor_of("doc-00009")));
}

#[tokio::test]
async fn invalid_configuration_is_rejected_before_any_request() {
    let index = MemoryIndex::sequential("works", 10);
    let mut sink: Vec<Batch> = Vec::new();
    let err = run_invocation(Arc::new(index.clone()), &input(0), plenty(), &mut sink)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)), "got {err:?}");
    assert_eq!(index.stats().calls(), 0);
}

#[tokio::test]
async fn job_is_reinvoked_until_done() {
    let index = MemoryIndex::sequential("works", 45);
    let mut job = ExportJob::new(ExportInput {
        max_batches: Some(2),
        ..input(10)
    });
    let mut exported = Vec::new();

    while !job.is_done() {
        assert!(job.iteration() < 10, "runaway job");
        let mut sink: Vec<Batch> = Vec::new();
        let out = export(&index, &job.input, plenty(), &mut sink).await;
        exported.extend(flat_ids(&sink));
        job.record(&out);
    }

    assert_eq!(job.iteration(), 3);
    assert_eq!(job.continuation(), Some(&cursor_of("doc-00044")));
    assert_eq!(job.exception_message, None);
    let expected: Vec<String> = (0..45).map(|i| format!("doc-{i:05}")).collect();
    assert_eq!(exported, expected);
}
