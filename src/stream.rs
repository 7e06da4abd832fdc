//! Subscription Event Streams
//!
//! The resolver-facing lazy sequence abstraction. A resolver that returns an
//! [`EventStream`] hands the gateway a possibly-infinite source of values plus
//! a termination callback that is guaranteed to fire exactly once, whether the
//! stream ends naturally, is stopped by the client, or the connection drops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

/// Why a stream stopped producing values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Stop was requested or the consumer disconnected
    Cancelled,
    /// The underlying producer finished on its own
    Completed,
}

type TerminationFn = Box<dyn FnOnce(EndReason) + Send + 'static>;
type EndValueFn<T> = Box<dyn FnOnce() -> T + Send + 'static>;

/// A lazy, possibly-infinite sequence of subscription values
///
/// Wraps an asynchronous producer with:
/// - an optional initial value, emitted before the first upstream value
/// - an optional lazily-computed end value, emitted after the producer
///   completes naturally (never after a stop or disconnect)
/// - a termination callback, supplied at construction, invoked exactly once
///   with the [`EndReason`]
///
/// Nothing is consumed until [`produce`](EventStream::produce) is called.
pub struct EventStream<T> {
    source: BoxStream<'static, T>,
    initial: Option<T>,
    end_value: Option<EndValueFn<T>>,
    // None once consumed by produce()/map(); Drop fires it otherwise
    termination: Option<TerminationFn>,
}

impl<T: Send + 'static> EventStream<T> {
    /// Create a stream from an asynchronous producer with an explicit
    /// termination callback.
    ///
    /// The callback is where resources tied to the producer are released,
    /// e.g. unregistering a broadcast downstream.
    pub fn new<S, F>(source: S, termination: F) -> Self
    where
        S: Stream<Item = T> + Send + 'static,
        F: FnOnce(EndReason) + Send + 'static,
    {
        Self {
            source: source.boxed(),
            initial: None,
            end_value: None,
            termination: Some(Box::new(termination)),
        }
    }

    /// Create a stream over a finite sequence of values.
    ///
    /// The termination callback defaults to a no-op; replace it with
    /// [`on_end`](EventStream::on_end) if cleanup is needed.
    pub fn from_values(values: Vec<T>) -> Self {
        Self::new(stream::iter(values), |_| {})
    }

    /// Create a stream backed by an mpsc channel.
    ///
    /// The stream completes naturally when every sender is dropped.
    pub fn from_channel(rx: mpsc::UnboundedReceiver<T>) -> Self {
        let source = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|value| (value, rx))
        });
        Self::new(source, |_| {})
    }

    /// Set a value emitted before the first upstream value
    pub fn with_initial(mut self, value: T) -> Self {
        self.initial = Some(value);
        self
    }

    /// Set a lazily-computed value emitted after natural completion.
    ///
    /// Not emitted when the stream is stopped early.
    pub fn with_end<F>(mut self, end_value: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        self.end_value = Some(Box::new(end_value));
        self
    }

    /// Replace the termination callback
    pub fn on_end<F>(mut self, termination: F) -> Self
    where
        F: FnOnce(EndReason) + Send + 'static,
    {
        self.termination = Some(Box::new(termination));
        self
    }

    /// Transform every value (initial, upstream, and end) with `f`
    pub fn map<U, F>(mut self, f: F) -> EventStream<U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let source = std::mem::replace(&mut self.source, stream::empty().boxed());
        let initial = self.initial.take();
        let end_value = self.end_value.take();
        let termination = self.termination.take();

        let f = Arc::new(f);
        let for_source = Arc::clone(&f);
        let for_end = Arc::clone(&f);

        EventStream {
            initial: initial.map(|v| f(v)),
            source: source.map(move |v| for_source(v)).boxed(),
            end_value: end_value.map(|g| Box::new(move || for_end(g())) as EndValueFn<U>),
            termination,
        }
    }

    /// Begin consuming the stream.
    ///
    /// Spawns a task that invokes `on_value` for each produced value and
    /// `on_end` once when the stream stops. The construction-time termination
    /// callback fires before `on_end`, with the same reason. Returns a
    /// [`StreamHandle`] whose [`stop`](StreamHandle::stop) requests early
    /// termination.
    pub fn produce<V, E>(mut self, mut on_value: V, on_end: E) -> StreamHandle
    where
        V: FnMut(T) + Send + 'static,
        E: FnOnce(EndReason) + Send + 'static,
    {
        let stop = Arc::new(Notify::new());
        let stopped = Arc::new(AtomicBool::new(false));

        let stop_signal = Arc::clone(&stop);
        let mut source = std::mem::replace(&mut self.source, stream::empty().boxed());
        let initial = self.initial.take();
        let end_value = self.end_value.take();
        let termination = self.termination.take();

        let task = tokio::spawn(async move {
            if let Some(value) = initial {
                on_value(value);
            }

            let reason = loop {
                tokio::select! {
                    biased;
                    _ = stop_signal.notified() => break EndReason::Cancelled,
                    item = source.next() => match item {
                        Some(value) => on_value(value),
                        None => {
                            if let Some(end) = end_value {
                                on_value(end());
                            }
                            break EndReason::Completed;
                        }
                    }
                }
            };

            if let Some(termination) = termination {
                termination(reason);
            }
            on_end(reason);
        });

        StreamHandle {
            stop,
            stopped,
            task,
        }
    }
}

impl<T> Drop for EventStream<T> {
    /// A stream dropped without ever being consumed still owes its
    /// termination callback a call; the consumer effectively disconnected.
    fn drop(&mut self) {
        if let Some(termination) = self.termination.take() {
            termination(EndReason::Cancelled);
        }
    }
}

impl<T> std::fmt::Debug for EventStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("has_initial", &self.initial.is_some())
            .field("has_end_value", &self.end_value.is_some())
            .finish()
    }
}

/// Handle to a running stream consumption task
///
/// Dropping the handle detaches the task; the termination callback still
/// fires when the stream ends.
#[derive(Debug)]
pub struct StreamHandle {
    stop: Arc<Notify>,
    stopped: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl StreamHandle {
    /// Request early termination.
    ///
    /// Cooperative and idempotent: the consuming task observes the signal at
    /// its next suspension point and fires termination with
    /// [`EndReason::Cancelled`]. Calling `stop` after the stream already
    /// finished has no effect.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.stop.notify_one();
        }
    }

    /// Whether the consuming task has finished
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the consuming task to finish
    pub async fn join(self) {
        let _ = self.task.await;
    }
}
