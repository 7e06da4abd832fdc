//! Broadcast Fan-Out
//!
//! One upstream producer, N independently-cancelable downstream consumers.
//! Upstream systems often support only one logical subscriber (a single Redis
//! channel subscription, a single change feed); [`Broadcast`] lets many
//! subscription operations share that one upstream, each downstream removable
//! without tearing down the others or the upstream itself.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use futures_util::stream::Stream;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::stream::EndReason;

type TerminationFn = Box<dyn FnOnce(EndReason) + Send + 'static>;

struct Entry<T> {
    sender: mpsc::UnboundedSender<T>,
    on_terminate: Option<TerminationFn>,
}

struct Shared<T> {
    entries: HashMap<Uuid, Entry<T>>,
    closed: bool,
}

/// Fan-out of one value source to many independent consumers
///
/// Each [`downstream`](Broadcast::downstream) call allocates an independent
/// queue, so a slow consumer never stalls delivery to the others. Closing the
/// broadcast terminates every downstream but leaves the upstream producer to
/// its owner.
pub struct Broadcast<T> {
    shared: Arc<Mutex<Shared<T>>>,
}

impl<T> Clone for Broadcast<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for Broadcast<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Broadcast<T> {
    /// Create an empty broadcast
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                entries: HashMap::new(),
                closed: false,
            })),
        }
    }

    /// Register a new downstream consumer
    pub fn downstream(&self) -> Downstream<T> {
        self.register(None)
    }

    /// Register a new downstream consumer with a termination callback.
    ///
    /// The callback fires exactly once, with [`EndReason::Cancelled`], when
    /// the downstream is cancelled or the broadcast is closed.
    pub fn downstream_with<F>(&self, on_terminate: F) -> Downstream<T>
    where
        F: FnOnce(EndReason) + Send + 'static,
    {
        self.register(Some(Box::new(on_terminate)))
    }

    fn register(&self, on_terminate: Option<TerminationFn>) -> Downstream<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();

        let mut shared = self.shared.lock().unwrap();
        if shared.closed {
            // Hand back an already-terminated stream so callers need not
            // check closed state first.
            drop(shared);
            drop(tx);
            if let Some(callback) = on_terminate {
                callback(EndReason::Cancelled);
            }
        } else {
            shared.entries.insert(
                id,
                Entry {
                    sender: tx,
                    on_terminate,
                },
            );
        }

        Downstream {
            id,
            rx,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Deliver `value` to every currently-registered downstream.
    ///
    /// The sender set is snapshotted so in-flight registrations are never
    /// blocked; a downstream added during a publish may or may not receive
    /// that particular value.
    pub fn publish(&self, value: T)
    where
        T: Clone,
    {
        let senders: Vec<(Uuid, mpsc::UnboundedSender<T>)> = {
            let shared = self.shared.lock().unwrap();
            if shared.closed {
                return;
            }
            shared
                .entries
                .iter()
                .map(|(id, entry)| (*id, entry.sender.clone()))
                .collect()
        };

        let mut dead = Vec::new();
        for (id, sender) in &senders {
            if sender.send(value.clone()).is_err() {
                dead.push(*id);
            }
        }

        if !dead.is_empty() {
            let callbacks: Vec<TerminationFn> = {
                let mut shared = self.shared.lock().unwrap();
                dead.iter()
                    .filter_map(|id| shared.entries.remove(id))
                    .filter_map(|entry| entry.on_terminate)
                    .collect()
            };
            for callback in callbacks {
                callback(EndReason::Cancelled);
            }
        }
    }

    /// Terminate and remove every downstream, then mark the broadcast closed.
    ///
    /// The upstream producer is untouched; closing it remains the caller's
    /// responsibility.
    pub fn close(&self) {
        let callbacks: Vec<TerminationFn> = {
            let mut shared = self.shared.lock().unwrap();
            shared.closed = true;
            shared
                .entries
                .drain()
                .filter_map(|(_, entry)| entry.on_terminate)
                .collect()
        };
        // Fired outside the lock so a callback may safely re-enter.
        for callback in callbacks {
            callback(EndReason::Cancelled);
        }
    }

    /// Whether [`close`](Broadcast::close) has been called
    pub fn is_closed(&self) -> bool {
        self.shared.lock().unwrap().closed
    }

    /// Number of currently-registered downstreams
    pub fn downstream_count(&self) -> usize {
        self.shared.lock().unwrap().entries.len()
    }
}

/// One consumer-side branch of a broadcast
///
/// Implements [`Stream`]; the stream ends when the downstream is cancelled or
/// the broadcast closes. Dropping a `Downstream` unregisters it.
pub struct Downstream<T> {
    id: Uuid,
    rx: mpsc::UnboundedReceiver<T>,
    shared: Weak<Mutex<Shared<T>>>,
}

impl<T> Downstream<T> {
    /// Identifier of this downstream within its broadcast
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Capability handle for cancelling this downstream from elsewhere
    pub fn handle(&self) -> DownstreamHandle<T> {
        DownstreamHandle {
            id: self.id,
            shared: Weak::clone(&self.shared),
        }
    }
}

impl<T> Stream for Downstream<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl<T> Drop for Downstream<T> {
    fn drop(&mut self) {
        self.handle().cancel();
    }
}

/// Cancellation capability for a [`Downstream`]
pub struct DownstreamHandle<T> {
    id: Uuid,
    shared: Weak<Mutex<Shared<T>>>,
}

impl<T> Clone for DownstreamHandle<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            shared: Weak::clone(&self.shared),
        }
    }
}

impl<T> DownstreamHandle<T> {
    /// Unregister the downstream from its broadcast.
    ///
    /// Idempotent; other downstreams and the upstream are unaffected. The
    /// downstream's termination callback, if any, fires with
    /// [`EndReason::Cancelled`].
    pub fn cancel(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let callback = {
            let mut shared = shared.lock().unwrap();
            shared
                .entries
                .remove(&self.id)
                .and_then(|entry| entry.on_terminate)
        };
        if let Some(callback) = callback {
            callback(EndReason::Cancelled);
        }
    }
}
