use crate::error::Error;
use crate::types::{SearchRequest, SearchResponse};

/// Completion handle for one index request. Exactly one of the two methods
/// is called, from whichever thread the client completes on.
pub trait SearchListener: Send {
    fn on_response(self: Box<Self>, response: SearchResponse);
    fn on_failure(self: Box<Self>, error: Error);
}

/// An asynchronous, paginated search over an external index.
///
/// Implementations must not block the caller; the result is delivered
/// through `listener`.
pub trait IndexClient: Send + Sync {
    fn search_async(&self, request: SearchRequest, listener: Box<dyn SearchListener>);
}

/// Milliseconds left before the host terminates the invocation.
pub trait RemainingTime: Send + Sync {
    fn remaining_millis(&self) -> i64;
}

impl<F> RemainingTime for F
where
    F: Fn() -> i64 + Send + Sync,
{
    fn remaining_millis(&self) -> i64 {
        self()
    }
}
