use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use log::{debug, info};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::feed::Update;
use crate::relay::sink::{PushOutcome, Sink};

/// Fan-out of the update stream to every registered [`Sink`].
pub struct Broadcaster {
    sinks: Mutex<Vec<Arc<Sink>>>,
    dispatched: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            sinks: Mutex::new(Vec::new()),
            dispatched: AtomicU64::new(0),
        }
    }

    /// Adds `sink` unless it is already registered. Returns whether it was added.
    pub fn register(&self, sink: &Arc<Sink>) -> bool {
        let mut sinks = self.sinks.lock();
        if sinks.iter().any(|registered| registered.id() == sink.id()) {
            return false;
        }
        sinks.push(sink.clone());
        debug!("Registered sink {} ({} total)", sink.id(), sinks.len());
        true
    }

    /// Removes `sink` if present. Returns whether it was removed.
    pub fn deregister(&self, sink: &Sink) -> bool {
        let mut sinks = self.sinks.lock();
        match sinks.iter().position(|registered| registered.id() == sink.id()) {
            Some(index) => {
                sinks.remove(index);
                debug!("Deregistered sink {} ({} total)", sink.id(), sinks.len());
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn is_registered(&self, sink: &Sink) -> bool {
        self.sinks.lock().iter().any(|registered| registered.id() == sink.id())
    }

    pub fn subscriber_count(&self) -> usize {
        self.sinks.lock().len()
    }

    /// The registered sinks, in registry order.
    pub fn snapshot(&self) -> Vec<Arc<Sink>> {
        self.sinks.lock().clone()
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Pushes `update` to every sink registered when the call starts and
    /// returns how many of them queued it.
    ///
    /// The registry lock is only held to take the snapshot, so no sink lock
    /// is ever taken while it is held. Pushes do not block.
    pub fn dispatch(&self, update: &Update) -> usize {
        let accepted = self
            .snapshot()
            .iter()
            .filter(|sink| matches!(sink.push(update), PushOutcome::Queued | PushOutcome::DroppedOldest))
            .count();

        self.dispatched.fetch_add(1, Ordering::Relaxed);
        accepted
    }

    /// Dispatch loop over the ingestor's update stream.
    pub async fn run(&self, mut updates: mpsc::Receiver<Update>, cancel: CancellationToken) {
        info!("Broadcaster listening for updates");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Broadcaster cancelled");
                    break;
                }
                next = updates.recv() => match next {
                    Some(update) => {
                        self.dispatch(&update);
                    }
                    None => {
                        info!("Update stream closed - broadcaster stopping");
                        break;
                    }
                }
            }
        }
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}
