//! Ordered, typed publish/subscribe dispatcher
//!
//! One logical event stream, one dispatch loop:
//! - `publish` enqueues and never synchronously invokes handlers, so a
//!   handler can never starve a publisher.
//! - The loop dequeues in publish order and runs every handler subscribed
//!   to that event's kind, in registration order, to completion before the
//!   next event is dequeued. Invocation order is guaranteed; completion of
//!   off-loop work is not (see [`BusHandle::offload`]).
//! - Handlers doing non-trivial work hand it to `offload`, which tracks it
//!   in an outstanding-work counter. `drained` observes "queue empty AND no
//!   outstanding work", which is what makes the replay feed's lock-step
//!   pacing sound: a chained publish from off-loop work lands in the queue
//!   before the counter can reach zero, and a chained offload increments
//!   the counter before its parent decrements, so the drained signal can
//!   neither fire early nor deadlock on transitively chained work.
//!
//! Subscription must happen before `run`; a late `subscribe` fails loudly
//! with `LateSubscription`. Handler/payload mismatches are impossible by
//! construction since the dispatch table is keyed by the closed
//! [`EventKind`] tag.


use crate::error::{EngineError, Result};
use crate::events::{Boundary, Event, EventKind, EventPayload};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, warn};

/// Handler for one or more event kinds
///
/// `handle` runs on the dispatch loop and must return promptly; anything
/// slow belongs in [`BusHandle::offload`].
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handler name for logging
    fn name(&self) -> &str;

    async fn handle(&self, event: &Event, bus: &BusHandle) -> Result<()>;
}

struct Shared {
    seq: AtomicU64,
    /// Serializes seq assignment with the enqueue, so queue order and
    /// sequence order can never disagree under concurrent publishers.
    publish_lock: parking_lot::Mutex<()>,
    queue_depth: AtomicUsize,
    outstanding: AtomicUsize,
    idle: Notify,
    started: AtomicBool,
}

impl Shared {
    fn is_drained(&self) -> bool {
        self.queue_depth.load(Ordering::SeqCst) == 0
            && self.outstanding.load(Ordering::SeqCst) == 0
    }
}

/// Cloneable capability to publish, offload work, and observe drain state
#[derive(Clone)]
pub struct BusHandle {
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Event>,
}

impl BusHandle {
    /// Enqueue an event; returns its sequence number.
    ///
    /// Never invokes handlers synchronously.
    pub fn publish(&self, timestamp: DateTime<Utc>, payload: EventPayload) -> Result<u64> {
        let _ordering = self.shared.publish_lock.lock();
        let seq = self.shared.seq.fetch_add(1, Ordering::SeqCst);
        // Depth goes up before the send so drained() can never observe an
        // enqueued-but-uncounted event.
        self.shared.queue_depth.fetch_add(1, Ordering::SeqCst);
        let event = Event {
            seq,
            timestamp,
            payload,
        };
        if self.tx.send(event).is_err() {
            self.shared.queue_depth.fetch_sub(1, Ordering::SeqCst);
            return Err(EngineError::Channel("event queue closed".into()));
        }
        Ok(seq)
    }

    /// Run work off the dispatch loop without stalling other handlers.
    ///
    /// The outstanding-work counter is incremented before the task is
    /// spawned and decremented only after the future completes, so any
    /// event the work publishes is already queued, and any further work it
    /// offloads is already counted, by the time the counter can hit zero.
    pub fn offload<F>(&self, label: &str, fut: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.shared.outstanding.fetch_add(1, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let label = label.to_string();
        tokio::spawn(async move {
            if let Err(e) = fut.await {
                error!("off-loop task '{}' failed: {}", label, e);
            }
            shared.outstanding.fetch_sub(1, Ordering::SeqCst);
            shared.idle.notify_waiters();
        });
    }

    /// Wait until the queue is empty and no off-loop work is outstanding.
    ///
    /// The replay feed awaits this between timestamps.
    pub async fn drained(&self) {
        loop {
            let idle = self.shared.idle.notified();
            if self.shared.is_drained() {
                return;
            }
            idle.await;
        }
    }

    /// Current outstanding off-loop work count (diagnostics)
    pub fn outstanding_work(&self) -> usize {
        self.shared.outstanding.load(Ordering::SeqCst)
    }
}

/// Run-level cancellation switch
#[derive(Clone)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// The dispatcher. Build, subscribe, then `run`.
pub struct EventBus {
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Event>,
    rx: mpsc::UnboundedReceiver<Event>,
    handlers: HashMap<EventKind, Vec<Arc<dyn EventHandler>>>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                seq: AtomicU64::new(0),
                publish_lock: parking_lot::Mutex::new(()),
                queue_depth: AtomicUsize::new(0),
                outstanding: AtomicUsize::new(0),
                idle: Notify::new(),
                started: AtomicBool::new(false),
            }),
            tx,
            rx,
            handlers: HashMap::new(),
            cancel_tx,
            cancel_rx,
        }
    }

    pub fn handle(&self) -> BusHandle {
        BusHandle {
            shared: Arc::clone(&self.shared),
            tx: self.tx.clone(),
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: self.cancel_tx.clone(),
        }
    }

    /// Watch channel components observe to stop producing on cancellation
    pub fn cancel_watch(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    /// Register a handler for one event kind.
    ///
    /// Must happen before `run`; registration order per kind is the
    /// invocation order.
    pub fn subscribe(&mut self, kind: EventKind, handler: Arc<dyn EventHandler>) -> Result<()> {
        if self.shared.started.load(Ordering::SeqCst) {
            return Err(EngineError::LateSubscription(format!(
                "handler '{}' for {} registered after bus start",
                handler.name(),
                kind
            )));
        }
        debug!("subscribed handler '{}' to {}", handler.name(), kind);
        self.handlers.entry(kind).or_default().push(handler);
        Ok(())
    }

    /// Dispatch until the stream ends.
    ///
    /// Terminates once `StreamBoundary(End)` has been dispatched, the
    /// queue is empty, and no off-loop work remains. A cancellation signal
    /// switches the loop into the same drain mode: already-queued events
    /// still dispatch, nothing is dropped.
    ///
    /// Fatal errors (sequence violation, ledger violation) abort the run;
    /// recoverable handler errors are logged and dispatch continues.
    pub async fn run(mut self) -> Result<()> {
        self.shared.started.store(true, Ordering::SeqCst);
        let handle = self.handle();
        let mut last_seq: Option<u64> = None;
        let mut draining = false;

        loop {
            if !draining && *self.cancel_rx.borrow() {
                debug!("cancellation observed, draining remaining events");
                draining = true;
            }

            let event = if draining {
                match self.drain_next().await {
                    Some(event) => event,
                    None => break,
                }
            } else {
                tokio::select! {
                    maybe = self.rx.recv() => match maybe {
                        Some(event) => event,
                        None => break,
                    },
                    _ = self.cancel_rx.changed() => continue,
                }
            };

            if let Some(prev) = last_seq {
                if event.seq <= prev {
                    return Err(EngineError::SequenceViolation {
                        prev,
                        seq: event.seq,
                    });
                }
            }
            last_seq = Some(event.seq);

            if matches!(event.payload, EventPayload::StreamBoundary(Boundary::End)) {
                draining = true;
            }

            if let Some(handlers) = self.handlers.get(&event.kind()) {
                for handler in handlers {
                    if let Err(e) = handler.handle(&event, &handle).await {
                        if e.is_fatal() {
                            error!(
                                "handler '{}' hit fatal error on {} event: {}",
                                handler.name(),
                                event.kind(),
                                e
                            );
                            return Err(e);
                        }
                        warn!(
                            "handler '{}' failed on {} event (seq {}): {}",
                            handler.name(),
                            event.kind(),
                            event.seq,
                            e
                        );
                    }
                }
            }

            // Dispatch for this event is complete only now; decrement after
            // the handlers so drained() counts in-flight dispatch.
            self.shared.queue_depth.fetch_sub(1, Ordering::SeqCst);
            self.shared.idle.notify_waiters();
        }

        debug!("event bus terminated");
        Ok(())
    }

    /// Next event while draining: pull whatever is queued; once the queue
    /// is empty, finish only when outstanding work (which may still
    /// publish) has gone to zero.
    async fn drain_next(&mut self) -> Option<Event> {
        loop {
            let idle = self.shared.idle.notified();
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(mpsc::error::TryRecvError::Empty) => {
                    if self.shared.outstanding.load(Ordering::SeqCst) == 0 {
                        return None;
                    }
                    idle.await;
                }
                Err(mpsc::error::TryRecvError::Disconnected) => return None,
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
