//! Fire-and-forget queue for counter increments.
//!
//! Increments are applied by one worker thread in submission order. Delivery
//! is at-most-once: a failed write is logged and dropped, never retried.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::cache::{CacheKey, CounterCache};
use crate::store::{CounterStore, PageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Increment {
    pub page_id: PageId,
    pub delta: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeferredStats {
    pub applied: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Tally {
    applied: AtomicU64,
    failed: AtomicU64,
}

enum Message {
    Apply(Increment),
    Flush(Sender<()>),
}

pub struct DeferredUpdates {
    sender: Option<Sender<Message>>,
    worker: Option<JoinHandle<()>>,
    tally: Arc<Tally>,
}

impl DeferredUpdates {
    /// Start the worker. Each applied increment invalidates the page's cache entry.
    pub fn spawn(store: Arc<dyn CounterStore>, cache: CounterCache) -> Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let tally = Arc::new(Tally::default());
        let worker_tally = Arc::clone(&tally);
        let worker = thread::Builder::new()
            .name("hitcounters-deferred".to_string())
            .spawn(move || run_worker(receiver, store.as_ref(), &cache, &worker_tally))
            .context("failed to spawn deferred update worker")?;
        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
            tally,
        })
    }

    /// Queue an increment without waiting for it to be written.
    pub fn push(&self, increment: Increment) {
        let Some(sender) = self.sender.as_ref() else {
            return;
        };
        if sender.send(Message::Apply(increment)).is_err() {
            warn!(
                page_id = increment.page_id,
                delta = increment.delta,
                "deferred update worker is gone; dropping view count update"
            );
        }
    }

    /// Block until everything queued before this call has been applied or dropped.
    pub fn flush(&self) {
        let Some(sender) = self.sender.as_ref() else {
            return;
        };
        let (ack, done) = mpsc::channel();
        if sender.send(Message::Flush(ack)).is_ok() {
            let _ = done.recv();
        }
    }

    pub fn stats(&self) -> DeferredStats {
        DeferredStats {
            applied: self.tally.applied.load(Ordering::SeqCst),
            failed: self.tally.failed.load(Ordering::SeqCst),
        }
    }
}

impl Drop for DeferredUpdates {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain what is queued and exit.
        self.sender.take();
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            warn!("deferred update worker panicked");
        }
    }
}

impl fmt::Debug for DeferredUpdates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredUpdates")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn run_worker(
    receiver: Receiver<Message>,
    store: &dyn CounterStore,
    cache: &CounterCache,
    tally: &Tally,
) {
    for message in receiver {
        match message {
            Message::Apply(increment) => apply(store, cache, tally, increment),
            Message::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    debug!("deferred update worker stopped");
}

fn apply(store: &dyn CounterStore, cache: &CounterCache, tally: &Tally, increment: Increment) {
    match store.increment_count(increment.page_id, increment.delta) {
        Ok(count) => {
            tally.applied.fetch_add(1, Ordering::SeqCst);
            cache.invalidate(&CacheKey::view_count(increment.page_id));
            debug!(
                page_id = increment.page_id,
                delta = increment.delta,
                count,
                "applied view count update"
            );
        }
        Err(error) => {
            tally.failed.fetch_add(1, Ordering::SeqCst);
            warn!(
                page_id = increment.page_id,
                delta = increment.delta,
                %error,
                "dropping view count update"
            );
        }
    }
}
