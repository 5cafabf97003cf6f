//! bulkexport-stream
//!
//! The reentrant export core: a paginated index source and a deadline gate
//! running on a small single-threaded stage runtime, plus the runner that
//! drives one invocation into a sink.
pub mod export;
pub mod gate;
pub mod runtime;
pub mod source;

pub use export::{run_invocation, BatchSink};
pub use gate::{Deadline, DeadlineGate};
pub use runtime::{run_source, run_via, GraphStage, Materialized, SinkQueue, StageContext};
pub use source::{effective_query_text, IndexSource, SourceSettings};
