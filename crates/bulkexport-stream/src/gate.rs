//! Pass-through stage that ends the stream gracefully before the host's
//! deadline.
//!
//! The remaining budget is consulted on downstream demand only, so the stream
//! is never cut while an element is mid-flight and the cursor materialized by
//! the source always matches the last batch the sink received.
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use bulkexport_core::error::{Error, Result};
use bulkexport_core::traits::RemainingTime;

use crate::runtime::{GraphStage, StageContext};

/// Wall-clock budget measured from construction.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }
}

impl RemainingTime for Deadline {
    fn remaining_millis(&self) -> i64 {
        let now = Instant::now();
        if now >= self.at {
            -i64::try_from((now - self.at).as_millis()).unwrap_or(i64::MAX)
        } else {
            i64::try_from((self.at - now).as_millis()).unwrap_or(i64::MAX)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Open,
    /// Tripped; the one demand forwarded upstream is still outstanding.
    Draining,
}

pub struct DeadlineGate<T> {
    oracle: Arc<dyn RemainingTime>,
    finalization_window_ms: i64,
    state: GateState,
    tripped: bool,
    passed: u64,
    _elem: PhantomData<fn(T) -> T>,
}

impl<T> DeadlineGate<T> {
    pub fn new(oracle: Arc<dyn RemainingTime>, finalization_window: Duration) -> Self {
        let finalization_window_ms =
            i64::try_from(finalization_window.as_millis()).unwrap_or(i64::MAX);
        Self {
            oracle,
            finalization_window_ms,
            state: GateState::Open,
            tripped: false,
            passed: 0,
            _elem: PhantomData,
        }
    }

    fn can_continue(&self) -> bool {
        self.oracle
            .remaining_millis()
            .saturating_sub(self.finalization_window_ms)
            > 0
    }
}

impl<T: Send + 'static> GraphStage for DeadlineGate<T> {
    type In = T;
    type Out = T;
    type Event = ();
    type Mat = bool;

    fn name(&self) -> &'static str {
        "deadline-gate"
    }

    fn on_pull(&mut self, ctx: &mut StageContext<Self>) -> Result<()> {
        if self.state == GateState::Draining {
            return Err(Error::ProtocolViolation("pull after the gate tripped".into()));
        }
        if self.can_continue() {
            return ctx.pull();
        }
        self.tripped = true;
        self.state = GateState::Draining;
        info!(passed = self.passed, "Stream timed out");
        ctx.pull()
    }

    fn on_push(&mut self, elem: T, ctx: &mut StageContext<Self>) -> Result<()> {
        ctx.push(elem)?;
        self.passed += 1;
        if self.state == GateState::Draining {
            debug!("drained the in-flight element, completing");
            ctx.complete_stage();
        }
        Ok(())
    }

    fn on_upstream_finish(&mut self, ctx: &mut StageContext<Self>) -> Result<()> {
        self.tripped = false;
        ctx.complete_stage();
        Ok(())
    }

    fn on_upstream_failure(
        &mut self,
        error: Error,
        ctx: &mut StageContext<Self>,
    ) -> Result<()> {
        self.tripped = false;
        ctx.fail_stage(error);
        Ok(())
    }

    fn post_stop(&mut self) -> bool {
        self.tripped
    }
}
