mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use bulkexport_core::traits::{IndexClient, RemainingTime};
use bulkexport_core::types::Batch;
use bulkexport_core::{Cursor, Error};
use bulkexport_memory::MemoryIndex;
use bulkexport_stream::{run_via, Deadline, DeadlineGate, IndexSource, SourceSettings};

use common::{
    abc_docs, batch_ids, cursor_of, flat_ids, init_tracing, plain, plenty, trips_after, Countdown,
};

struct Run {
    batches: Vec<Batch>,
    error: Option<Error>,
    cursor: Option<Cursor>,
    timed_out: bool,
}

async fn run_gated(
    index: &MemoryIndex,
    settings: SourceSettings,
    oracle: Arc<dyn RemainingTime>,
    window_ms: u64,
) -> Run {
    let client: Arc<dyn IndexClient> = Arc::new(index.clone());
    let source = IndexSource::new(client, settings).expect("valid settings");
    let gate = DeadlineGate::<Batch>::new(oracle, Duration::from_millis(window_ms));
    let (cursor_mat, gate_mat, mut queue) = run_via(source, gate);
    let mut batches = Vec::new();
    let mut error = None;
    while let Some(next) = queue.next().await {
        match next {
            Ok(batch) => batches.push(batch),
            Err(e) => error = Some(e),
        }
    }
    Run {
        batches,
        error,
        cursor: cursor_mat.get().await.expect("source materialized"),
        timed_out: gate_mat.get().await.expect("gate materialized"),
    }
}

#[tokio::test]
async fn passes_everything_through_with_time_to_spare() {
    init_tracing();
    let index = MemoryIndex::sequential("works", 25);
    let run = run_gated(&index, plain(10), plenty(), 30_000).await;

    assert!(run.error.is_none());
    assert!(!run.timed_out);
    assert_eq!(
        run.batches.iter().map(Batch::len).collect::<Vec<_>>(),
        vec![10, 10, 5]
    );
    assert_eq!(run.cursor, Some(cursor_of("doc-00024")));
}

#[tokio::test]
async fn remaining_equal_to_window_trips_on_first_pull() {
    let index = MemoryIndex::sequential("works", 50);
    let oracle: Arc<dyn RemainingTime> = Arc::new(|| 5_000i64);
    let run = run_gated(&index, plain(10), oracle, 5_000).await;

    assert!(run.timed_out);
    assert!(
        run.error.is_none(),
        "a timeout completes the stream, it does not fail it"
    );
    assert_eq!(
        run.batches.len(),
        1,
        "the demand forwarded when tripping is still delivered"
    );
    assert_eq!(run.cursor.as_ref(), Some(run.batches[0].cursor()));
}

#[tokio::test]
async fn trips_after_the_allowed_pulls() {
    let index = MemoryIndex::sequential("works", 100);
    let oracle = trips_after(3, 1_000);
    let run = run_gated(&index, plain(10), oracle, 1_000).await;

    assert!(run.timed_out);
    assert_eq!(run.batches.len(), 4, "three open pulls plus the drained one");
    assert_eq!(
        flat_ids(&run.batches).last().map(String::as_str),
        Some("doc-00039")
    );
    assert_eq!(run.cursor.as_ref(), run.batches.last().map(Batch::cursor));
}

#[tokio::test]
async fn source_cursor_matches_the_sink_after_a_trip() {
    // 10s remaining, 1s lost per check, 5s window: trips on the sixth pull.
    let index = MemoryIndex::sequential("works", 1000);
    let oracle = Countdown::new(10_000, 1_000);
    let run = run_gated(&index, plain(100), oracle, 5_000).await;

    assert!(run.timed_out);
    assert_eq!(flat_ids(&run.batches).len(), 600);
    assert_eq!(run.cursor, Some(cursor_of("doc-00599")));
}

#[tokio::test]
async fn upstream_completion_while_draining_is_not_a_timeout() {
    let index = MemoryIndex::new("works", abc_docs());
    let settings = plain(2).starting_at(Some(cursor_of("c")));
    let run = run_gated(&index, settings, Arc::new(|| 0i64), 10).await;

    assert!(run.batches.is_empty());
    assert!(!run.timed_out);
}

#[tokio::test]
async fn upstream_failure_is_propagated_and_not_a_timeout() {
    let index = MemoryIndex::new("works", abc_docs()).with_failure_on_call(2);
    let run = run_gated(&index, plain(1), plenty(), 1_000).await;

    assert_eq!(batch_ids(&run.batches), vec![vec!["a"]]);
    assert!(matches!(run.error, Some(Error::Index(_))));
    assert!(!run.timed_out);
    assert_eq!(run.cursor, Some(cursor_of("a")));
}

#[tokio::test]
async fn failure_of_the_drained_request_clears_the_trip() {
    let index = MemoryIndex::new("works", abc_docs()).with_failure_on_call(1);
    let run = run_gated(&index, plain(2), Arc::new(|| 0i64), 0).await;

    assert!(run.batches.is_empty());
    assert!(run.error.is_some());
    assert!(!run.timed_out);
}

#[tokio::test]
async fn downstream_cancel_stops_both_stages() {
    let index = MemoryIndex::sequential("works", 100);
    let client: Arc<dyn IndexClient> = Arc::new(index.clone());
    let source = IndexSource::new(client, plain(10)).expect("valid settings");
    let gate = DeadlineGate::<Batch>::new(plenty(), Duration::from_secs(1));
    let (cursor_mat, gate_mat, mut queue) = run_via(source, gate);

    let first = queue.next().await.expect("element").expect("batch");
    queue.cancel();

    assert!(!gate_mat.get().await.expect("gate materialized"));
    let cursor = cursor_mat.get().await.expect("source materialized");
    assert_eq!(cursor.as_ref(), Some(first.cursor()));
}

#[tokio::test]
async fn expired_wall_clock_deadline_trips_immediately() {
    let index = MemoryIndex::sequential("works", 30);
    let oracle = Arc::new(Deadline::after(Duration::ZERO));
    tokio::time::sleep(Duration::from_millis(2)).await;
    assert!(oracle.remaining_millis() < 0);

    let run = run_gated(&index, plain(10), oracle, 0).await;
    assert!(run.timed_out);
    assert_eq!(run.batches.len(), 1);
}

#[test]
fn deadline_counts_down_from_budget() {
    let deadline = Deadline::after(Duration::from_secs(60));
    let remaining = deadline.remaining_millis();
    assert!(
        remaining > 59_000 && remaining <= 60_000,
        "remaining {remaining}"
    );
}
