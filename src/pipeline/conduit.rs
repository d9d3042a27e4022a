//! Typed handoff conduits between stages.
//!
//! A conduit is a capacity-1 `mpsc` channel: a send parks until the next
//! stage has taken the previous item. Both ends race every operation
//! against the run's cancellation token so blocked workers unwind as soon
//! as the run is aborted.
//!
//! The sending half closes when its last clone is dropped. Stages never
//! close their outbound conduit explicitly; returning from `Stage::run`
//! drops it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;

/// Number of items a conduit holds before the sender parks.
const CONDUIT_CAPACITY: usize = 1;

/// Create a conduit for items produced by `stage`.
pub fn conduit<T>(stage: &'static str, cancel: CancellationToken) -> (Outbound<T>, Inbound<T>) {
    let (tx, rx) = mpsc::channel(CONDUIT_CAPACITY);
    let outbound = Outbound {
        tx,
        stage,
        cancel: cancel.clone(),
        sent: Arc::new(AtomicUsize::new(0)),
    };
    let inbound = Inbound {
        rx,
        cancel,
        watch: DrainWatch {
            upstream: stage,
            drained: Arc::new(AtomicBool::new(false)),
        },
    };
    (outbound, inbound)
}

// ── Sending half ────────────────────────────────────────────────────

/// Producing end of a conduit. Cheap to clone into fan-out workers.
#[derive(Debug)]
pub struct Outbound<T> {
    tx: mpsc::Sender<T>,
    stage: &'static str,
    cancel: CancellationToken,
    sent: Arc<AtomicUsize>,
}

impl<T> Clone for Outbound<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            stage: self.stage,
            cancel: self.cancel.clone(),
            sent: Arc::clone(&self.sent),
        }
    }
}

impl<T> Outbound<T> {
    /// Hand `item` to the next stage, waiting until it has room.
    pub async fn send(&self, item: T) -> Result<(), PipelineError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PipelineError::Cancelled),
            sent = self.tx.send(item) => {
                sent.map_err(|_| PipelineError::DownstreamClosed { stage: self.stage })?;
                self.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    /// Counter of items successfully handed downstream, shared by all clones.
    pub fn sent_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.sent)
    }
}

// ── Receiving half ──────────────────────────────────────────────────

/// Consuming end of a conduit.
#[derive(Debug)]
pub struct Inbound<T> {
    rx: mpsc::Receiver<T>,
    cancel: CancellationToken,
    watch: DrainWatch,
}

impl<T> Inbound<T> {
    /// Next item, or `None` once the conduit is closed and drained.
    pub async fn recv(&mut self) -> Result<Option<T>, PipelineError> {
        let item = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(PipelineError::Cancelled),
            item = self.rx.recv() => item,
        };
        if item.is_none() {
            self.watch.drained.store(true, Ordering::Release);
        }
        Ok(item)
    }

    /// Handle that outlives this end and reports whether it was read to
    /// the end.
    pub fn drain_watch(&self) -> DrainWatch {
        self.watch.clone()
    }

    /// Share this end between several pool workers.
    pub fn shared(self) -> SharedInbound<T> {
        SharedInbound {
            inner: Arc::new(Mutex::new(self)),
        }
    }
}

/// Records whether an inbound conduit was read until it closed.
#[derive(Debug, Clone)]
pub struct DrainWatch {
    upstream: &'static str,
    drained: Arc<AtomicBool>,
}

impl DrainWatch {
    /// Stage producing into the watched conduit.
    pub fn upstream(&self) -> &'static str {
        self.upstream
    }

    pub fn is_drained(&self) -> bool {
        self.drained.load(Ordering::Acquire)
    }
}

/// An inbound conduit claimed from by several workers.
///
/// Whichever worker is free first takes the next item; there is no
/// item-to-worker affinity.
#[derive(Debug)]
pub struct SharedInbound<T> {
    inner: Arc<Mutex<Inbound<T>>>,
}

impl<T> Clone for SharedInbound<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> SharedInbound<T> {
    pub async fn recv(&self) -> Result<Option<T>, PipelineError> {
        let mut inbound = self.inner.lock().await;
        inbound.recv().await
    }
}
