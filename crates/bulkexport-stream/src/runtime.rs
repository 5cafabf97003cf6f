//! Single-threaded cooperative stage runtime.
//!
//! Every stage owns a mailbox drained by one tokio task: handler calls for
//! pull/push/finish/cancel and marshalled async callbacks all run there, one at
//! a time. Stage state is only ever touched from inside that task, so handlers
//! take no locks. Anything arriving from another thread (an index client
//! completing a request, say) goes through an [`AsyncCallback`], which only
//! enqueues.
//!
//! Demand flows upstream as [`Demand`], data and termination flow downstream
//! as [`Signal`]. Each stage resolves a [`Materialized`] value exactly once
//! when it stops.
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn, Instrument};

use bulkexport_core::error::{Error, Result};

/// Downstream-bound events.
#[derive(Debug)]
pub enum Signal<T> {
    Push(T),
    Complete,
    Fail(Error),
}

/// Upstream-bound events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Demand {
    Pull,
    Cancel,
}

pub(crate) enum Message<In, Ev> {
    Pull,
    Cancel,
    Push(In),
    UpstreamFinish,
    UpstreamFailure(Error),
    Callback(Ev),
}

fn signal_to_message<In, Ev>(signal: Signal<In>) -> Message<In, Ev> {
    match signal {
        Signal::Push(elem) => Message::Push(elem),
        Signal::Complete => Message::UpstreamFinish,
        Signal::Fail(e) => Message::UpstreamFailure(e),
    }
}

fn demand_to_message<In, Ev>(demand: Demand) -> Message<In, Ev> {
    match demand {
        Demand::Pull => Message::Pull,
        Demand::Cancel => Message::Cancel,
    }
}

/// A thread-safe handle that enqueues a value onto some stage's mailbox.
///
/// Invoking it after the target stage stopped is a no-op and returns `false`.
pub struct AsyncCallback<A> {
    deliver: Arc<dyn Fn(A) -> bool + Send + Sync>,
}

impl<A> Clone for AsyncCallback<A> {
    fn clone(&self) -> Self {
        Self {
            deliver: Arc::clone(&self.deliver),
        }
    }
}

impl<A: 'static> AsyncCallback<A> {
    fn new<E, F>(tx: mpsc::UnboundedSender<E>, map: F) -> Self
    where
        E: Send + 'static,
        F: Fn(A) -> E + Send + Sync + 'static,
    {
        Self {
            deliver: Arc::new(move |value| tx.send(map(value)).is_ok()),
        }
    }

    pub fn invoke(&self, value: A) -> bool {
        (self.deliver)(value)
    }
}

/// Handler surface of a stage. Sources use `In = Infallible`.
///
/// Returning `Err` from any handler fails the stage with that error.
pub trait GraphStage: Send + Sized + 'static {
    type In: Send + 'static;
    type Out: Send + 'static;
    type Event: Send + 'static;
    type Mat: Send + 'static;

    fn name(&self) -> &'static str;

    fn pre_start(&mut self, _ctx: &mut StageContext<Self>) -> Result<()> {
        Ok(())
    }

    fn on_pull(&mut self, ctx: &mut StageContext<Self>) -> Result<()>;

    fn on_push(&mut self, _elem: Self::In, _ctx: &mut StageContext<Self>) -> Result<()> {
        Err(Error::ProtocolViolation(format!("{} has no inlet", self.name())))
    }

    fn on_upstream_finish(&mut self, ctx: &mut StageContext<Self>) -> Result<()> {
        ctx.complete_stage();
        Ok(())
    }

    fn on_upstream_failure(
        &mut self,
        error: Error,
        ctx: &mut StageContext<Self>,
    ) -> Result<()> {
        ctx.fail_stage(error);
        Ok(())
    }

    /// Downstream cancelled. Quietly stops by default.
    fn on_downstream_finish(&mut self, ctx: &mut StageContext<Self>) -> Result<()> {
        ctx.complete_stage();
        Ok(())
    }

    fn on_event(&mut self, _event: Self::Event, _ctx: &mut StageContext<Self>) -> Result<()> {
        Ok(())
    }

    /// Runs once after the stage stopped, for whatever reason. The returned
    /// value resolves the stage's [`Materialized`] handle.
    fn post_stop(&mut self) -> Self::Mat;
}

/// Port operations available to a stage's handlers.
pub struct StageContext<S: GraphStage> {
    name: &'static str,
    inbox: mpsc::UnboundedSender<Message<S::In, S::Event>>,
    downstream: Option<AsyncCallback<Signal<S::Out>>>,
    upstream: Option<AsyncCallback<Demand>>,
    out_demanded: bool,
    in_pulled: bool,
    in_closed: bool,
    out_closed: bool,
    stopped: bool,
}

impl<S: GraphStage> StageContext<S> {
    fn new(
        name: &'static str,
        inbox: mpsc::UnboundedSender<Message<S::In, S::Event>>,
        downstream: Option<AsyncCallback<Signal<S::Out>>>,
        upstream: Option<AsyncCallback<Demand>>,
    ) -> Self {
        Self {
            name,
            inbox,
            in_closed: upstream.is_none(),
            out_closed: downstream.is_none(),
            downstream,
            upstream,
            out_demanded: false,
            in_pulled: false,
            stopped: false,
        }
    }

    /// A callable that may be invoked from any thread; each invocation runs
    /// `on_event` on this stage's executor with `map(value)`.
    pub fn create_async_callback<A, F>(&self, map: F) -> AsyncCallback<A>
    where
        A: 'static,
        F: Fn(A) -> S::Event + Send + Sync + 'static,
    {
        AsyncCallback::new(self.inbox.clone(), move |value| {
            Message::Callback(map(value))
        })
    }

    pub fn push(&mut self, elem: S::Out) -> Result<()> {
        if !self.out_demanded {
            return Err(Error::ProtocolViolation(format!(
                "{}: push without downstream demand",
                self.name
            )));
        }
        let Some(downstream) = self.downstream.as_ref() else {
            return Err(Error::ProtocolViolation(format!(
                "{}: push on a stage without outlet",
                self.name
            )));
        };
        self.out_demanded = false;
        downstream.invoke(Signal::Push(elem));
        Ok(())
    }

    pub fn pull(&mut self) -> Result<()> {
        if self.in_closed {
            return Err(Error::ProtocolViolation(format!(
                "{}: pull on a closed inlet",
                self.name
            )));
        }
        if self.in_pulled {
            return Err(Error::ProtocolViolation(format!(
                "{}: inlet pulled twice",
                self.name
            )));
        }
        self.in_pulled = true;
        if let Some(upstream) = self.upstream.as_ref() {
            upstream.invoke(Demand::Pull);
        }
        Ok(())
    }

    /// Complete the outlet and cancel the inlet. Idempotent.
    pub fn complete_stage(&mut self) {
        if self.stopped {
            return;
        }
        debug!(stage = self.name, "completing stage");
        self.stopped = true;
        self.close_ports(Signal::Complete);
    }

    /// Fail the outlet with `error` and cancel the inlet. Idempotent.
    pub fn fail_stage(&mut self, error: Error) {
        if self.stopped {
            return;
        }
        warn!(stage = self.name, error = %error, "failing stage");
        self.stopped = true;
        self.close_ports(Signal::Fail(error));
    }

    fn close_ports(&mut self, terminal: Signal<S::Out>) {
        if !self.out_closed {
            self.out_closed = true;
            if let Some(downstream) = self.downstream.as_ref() {
                downstream.invoke(terminal);
            }
        }
        if !self.in_closed {
            self.in_closed = true;
            if let Some(upstream) = self.upstream.as_ref() {
                upstream.invoke(Demand::Cancel);
            }
        }
    }

    fn accept_pull(&mut self) -> Result<()> {
        if self.out_demanded {
            return Err(Error::ProtocolViolation(format!(
                "{}: downstream pulled twice",
                self.name
            )));
        }
        self.out_demanded = true;
        Ok(())
    }

    fn accept_push(&mut self) -> Result<()> {
        if !self.in_pulled {
            return Err(Error::ProtocolViolation(format!(
                "{}: element pushed without demand",
                self.name
            )));
        }
        self.in_pulled = false;
        Ok(())
    }
}

/// Future-like handle to a stage's terminal value, resolved exactly once.
#[derive(Debug)]
pub struct Materialized<M> {
    rx: oneshot::Receiver<M>,
}

impl<M> Materialized<M> {
    pub async fn get(self) -> Result<M> {
        self.rx.await.map_err(|_| {
            Error::Operation("stage dropped before materializing its value".into())
        })
    }
}

async fn drive<S: GraphStage>(
    mut stage: S,
    mut ctx: StageContext<S>,
    mut inbox: mpsc::UnboundedReceiver<Message<S::In, S::Event>>,
    mat: oneshot::Sender<S::Mat>,
) {
    if let Err(e) = stage.pre_start(&mut ctx) {
        ctx.fail_stage(e);
    }
    while !ctx.stopped {
        let Some(message) = inbox.recv().await else {
            break;
        };
        let handled = match message {
            Message::Pull => ctx.accept_pull().and_then(|()| stage.on_pull(&mut ctx)),
            Message::Push(elem) => ctx
                .accept_push()
                .and_then(|()| stage.on_push(elem, &mut ctx)),
            Message::UpstreamFinish => {
                ctx.in_closed = true;
                ctx.in_pulled = false;
                stage.on_upstream_finish(&mut ctx)
            }
            Message::UpstreamFailure(e) => {
                ctx.in_closed = true;
                ctx.in_pulled = false;
                stage.on_upstream_failure(e, &mut ctx)
            }
            Message::Cancel => {
                ctx.out_closed = true;
                stage.on_downstream_finish(&mut ctx)
            }
            Message::Callback(event) => stage.on_event(event, &mut ctx),
        };
        if let Err(e) = handled {
            ctx.fail_stage(e);
        }
    }
    // Late callbacks (a response to an abandoned request) are dropped here.
    inbox.close();
    let _ = mat.send(stage.post_stop());
}

fn spawn_stage<S: GraphStage>(
    stage: S,
    inbox_tx: mpsc::UnboundedSender<Message<S::In, S::Event>>,
    inbox_rx: mpsc::UnboundedReceiver<Message<S::In, S::Event>>,
    downstream: Option<AsyncCallback<Signal<S::Out>>>,
    upstream: Option<AsyncCallback<Demand>>,
) -> Materialized<S::Mat> {
    let (mat_tx, mat_rx) = oneshot::channel();
    let name = stage.name();
    let ctx = StageContext::new(name, inbox_tx, downstream, upstream);
    tokio::spawn(
        drive(stage, ctx, inbox_rx, mat_tx).instrument(tracing::info_span!("stage", name)),
    );
    Materialized { rx: mat_rx }
}

/// Run `source` into `flow` and expose the flow's output as a pull-based
/// [`SinkQueue`]. Must be called from within a tokio runtime.
pub fn run_via<S, F>(
    source: S,
    flow: F,
) -> (Materialized<S::Mat>, Materialized<F::Mat>, SinkQueue<F::Out>)
where
    S: GraphStage<In = Infallible>,
    F: GraphStage<In = S::Out>,
{
    let (source_tx, source_rx) = mpsc::unbounded_channel::<Message<S::In, S::Event>>();
    let (flow_tx, flow_rx) = mpsc::unbounded_channel::<Message<F::In, F::Event>>();
    let (sink_tx, sink_rx) = mpsc::unbounded_channel::<Signal<F::Out>>();

    let source_out = AsyncCallback::new(flow_tx.clone(), signal_to_message::<F::In, F::Event>);
    let flow_in = AsyncCallback::new(source_tx.clone(), demand_to_message::<S::In, S::Event>);
    let flow_out = AsyncCallback::new(sink_tx, |signal: Signal<F::Out>| signal);
    let sink_in = AsyncCallback::new(flow_tx.clone(), demand_to_message::<F::In, F::Event>);

    let source_mat = spawn_stage(source, source_tx, source_rx, Some(source_out), None);
    let flow_mat = spawn_stage(flow, flow_tx, flow_rx, Some(flow_out), Some(flow_in));
    (source_mat, flow_mat, SinkQueue::new(sink_rx, sink_in))
}

/// Run a source directly into a [`SinkQueue`].
pub fn run_source<S>(source: S) -> (Materialized<S::Mat>, SinkQueue<S::Out>)
where
    S: GraphStage<In = Infallible>,
{
    let (source_tx, source_rx) = mpsc::unbounded_channel::<Message<S::In, S::Event>>();
    let (sink_tx, sink_rx) = mpsc::unbounded_channel::<Signal<S::Out>>();
    let source_out = AsyncCallback::new(sink_tx, |signal: Signal<S::Out>| signal);
    let sink_in = AsyncCallback::new(source_tx.clone(), demand_to_message::<S::In, S::Event>);
    let source_mat = spawn_stage(source, source_tx, source_rx, Some(source_out), None);
    (source_mat, SinkQueue::new(sink_rx, sink_in))
}

/// Terminal consumer. Each poll with no element outstanding signals one unit
/// of demand upstream; dropping the queue before completion cancels upstream.
pub struct SinkQueue<T> {
    signals: mpsc::UnboundedReceiver<Signal<T>>,
    upstream: AsyncCallback<Demand>,
    pulled: bool,
    done: bool,
}

impl<T> SinkQueue<T> {
    fn new(
        signals: mpsc::UnboundedReceiver<Signal<T>>,
        upstream: AsyncCallback<Demand>,
    ) -> Self {
        Self {
            signals,
            upstream,
            pulled: false,
            done: false,
        }
    }

    /// Stop consuming and cancel upstream.
    pub fn cancel(self) {
        drop(self);
    }
}

impl<T> Unpin for SinkQueue<T> {}

impl<T> Stream for SinkQueue<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        if !this.pulled {
            this.pulled = true;
            this.upstream.invoke(Demand::Pull);
        }
        match this.signals.poll_recv(cx) {
            Poll::Ready(Some(Signal::Push(elem))) => {
                this.pulled = false;
                Poll::Ready(Some(Ok(elem)))
            }
            Poll::Ready(Some(Signal::Fail(e))) => {
                this.done = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(Some(Signal::Complete)) | Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for SinkQueue<T> {
    fn drop(&mut self) {
        if !self.done {
            self.upstream.invoke(Demand::Cancel);
        }
    }
}
