//! One reentrant invocation: `IndexSource -> DeadlineGate -> BatchSink`.
use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use tracing::{info, warn};

use bulkexport_core::error::Result;
use bulkexport_core::job::{ExportInput, ExportOutput, Outcome};
use bulkexport_core::traits::{IndexClient, RemainingTime};
use bulkexport_core::types::Batch;
use bulkexport_core::Cursor;

use crate::gate::DeadlineGate;
use crate::runtime::run_via;
use crate::source::{IndexSource, SourceSettings};

/// Where exported batches end up (a file writer, an archiver...).
pub trait BatchSink: Send {
    fn write_batch(
        &mut self,
        batch: &Batch,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

impl BatchSink for Vec<Batch> {
    async fn write_batch(&mut self, batch: &Batch) -> anyhow::Result<()> {
        self.push(batch.clone());
        Ok(())
    }
}

impl From<&ExportInput> for SourceSettings {
    fn from(input: &ExportInput) -> Self {
        SourceSettings {
            index_name: input.index_name.clone(),
            query: input.query.clone(),
            starting_cursor: input.cursor.clone(),
            page_size: input.page_size,
            sort_keys: input.sort_keys.clone(),
        }
    }
}

/// Run a single invocation and report where it got to.
///
/// Configuration errors are returned as `Err` before anything is requested.
/// Index and sink failures end the invocation with [`Outcome::Failed`]; the
/// reported cursor is then the one of the last batch the sink accepted.
pub async fn run_invocation<K: BatchSink>(
    client: Arc<dyn IndexClient>,
    input: &ExportInput,
    oracle: Arc<dyn RemainingTime>,
    sink: &mut K,
) -> Result<ExportOutput> {
    let source = IndexSource::new(client, SourceSettings::from(input))?;
    let gate = DeadlineGate::<Batch>::new(oracle, input.finalization_window());
    let (cursor_mat, timed_out_mat, mut batches) = run_via(source, gate);

    let mut acked: Option<Cursor> = input.cursor.clone();
    let mut failure: Option<String> = None;
    let mut limit_reached = false;
    let mut hits_exported = 0u64;
    let mut written = 0usize;

    while let Some(next) = batches.next().await {
        let batch = match next {
            Ok(batch) => batch,
            Err(e) => {
                failure = Some(e.to_string());
                break;
            }
        };
        if let Err(e) = sink.write_batch(&batch).await {
            failure = Some(format!("{e:#}"));
            break;
        }
        acked = Some(batch.cursor().clone());
        hits_exported += batch.len() as u64;
        written += 1;
        if input.max_batches.is_some_and(|limit| written >= limit) {
            limit_reached = true;
            break;
        }
    }
    drop(batches);

    let materialized = cursor_mat.get().await?;
    let timed_out = timed_out_mat.get().await?;

    let (outcome, cursor_out) = match failure {
        Some(_) => (Outcome::Failed, acked),
        None => {
            if materialized != acked {
                warn!(
                    materialized = ?materialized,
                    acked = ?acked,
                    "source cursor differs from the last written batch"
                );
            }
            let outcome = if timed_out {
                Outcome::TimedOut
            } else if limit_reached {
                Outcome::More
            } else {
                Outcome::Done
            };
            (outcome, materialized)
        }
    };

    info!(?outcome, hits_exported, batches = written, "invocation finished");
    Ok(ExportOutput {
        cursor_out,
        timed_out,
        error: failure,
        outcome,
        hits_exported,
        batches: written,
    })
}
