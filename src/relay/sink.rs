use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::DEFAULT_SINK_QUEUE_CAPACITY;
use crate::feed::Update;

pub type SinkId = Uuid;

/// What a full sink does with the next accepted update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    DropOldest,
    DropNewest,
    /// Stop the sink; its connection is closed once the queue is forwarded.
    Disconnect,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "drop-oldest" => Ok(Self::DropOldest),
            "drop-newest" => Ok(Self::DropNewest),
            "disconnect" => Ok(Self::Disconnect),
            other => Err(format!(
                "unknown overflow policy '{}', expected drop-oldest, drop-newest or disconnect",
                other
            )),
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DropOldest => "drop-oldest",
            Self::DropNewest => "drop-newest",
            Self::Disconnect => "disconnect",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SinkSettings {
    pub capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_SINK_QUEUE_CAPACITY,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Filtered out; nothing changed.
    Rejected,
    Queued,
    /// Queued after evicting the oldest pending update.
    DroppedOldest,
    /// Queue full, the incoming update was discarded.
    DroppedNewest,
    /// The sink overflowed under [`OverflowPolicy::Disconnect`].
    Overflowed,
}

#[derive(Debug, Default)]
struct SinkState {
    queue: VecDeque<Update>,
    // Empty set accepts every symbol.
    accepted: HashSet<String>,
    overflowed: bool,
}

impl SinkState {
    fn accepts(&self, symbol: &str) -> bool {
        self.accepted.is_empty() || self.accepted.contains(symbol)
    }
}

/// Per-subscriber buffer and interest filter.
///
/// The broadcaster pushes into the sink without ever waiting on it. A drain
/// task started with [`Sink::consume`] forwards queued updates to the
/// connection's outbound stream at whatever pace the connection reads them.
pub struct Sink {
    id: SinkId,
    settings: SinkSettings,
    state: Mutex<SinkState>,
    wake: Notify,
    dropped: AtomicU64,
}

impl Sink {
    pub fn new(settings: SinkSettings) -> Self {
        Self {
            id: Uuid::new_v4(),
            settings,
            state: Mutex::new(SinkState::default()),
            wake: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> SinkId {
        self.id
    }

    pub fn accepts(&self, symbol: &str) -> bool {
        self.state.lock().accepts(symbol)
    }

    /// Filters and enqueues `update`, then wakes the drain task.
    ///
    /// Never blocks: wakes are coalesced into a single pending permit.
    pub fn push(&self, update: &Update) -> PushOutcome {
        let outcome = {
            let mut state = self.state.lock();

            if !state.accepts(&update.symbol) {
                return PushOutcome::Rejected;
            }
            if state.overflowed {
                return PushOutcome::Overflowed;
            }

            if state.queue.len() < self.settings.capacity {
                state.queue.push_back(update.clone());
                PushOutcome::Queued
            } else {
                match self.settings.overflow {
                    OverflowPolicy::DropOldest => {
                        state.queue.pop_front();
                        state.queue.push_back(update.clone());
                        PushOutcome::DroppedOldest
                    }
                    OverflowPolicy::DropNewest => PushOutcome::DroppedNewest,
                    OverflowPolicy::Disconnect => {
                        state.overflowed = true;
                        PushOutcome::Overflowed
                    }
                }
            }
        };

        match outcome {
            PushOutcome::DroppedOldest | PushOutcome::DroppedNewest => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            PushOutcome::Overflowed => {
                warn!("Sink {} overflowed its queue of {} updates", self.id, self.settings.capacity);
            }
            _ => {}
        }

        if outcome != PushOutcome::DroppedNewest {
            self.wake.notify_one();
        }
        outcome
    }

    /// Replaces the filter. Updates already queued are kept.
    pub fn set_accepted_symbols<I>(&self, symbols: I)
    where
        I: IntoIterator<Item = String>,
    {
        let accepted: HashSet<String> = symbols.into_iter().collect();
        self.state.lock().accepted = accepted;
    }

    pub fn accepted_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.state.lock().accepted.iter().cloned().collect();
        symbols.sort();
        symbols
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_overflowed(&self) -> bool {
        self.state.lock().overflowed
    }

    /// Drain task: on each wake, swaps out the whole queue and forwards it
    /// in FIFO order to `outbound`.
    ///
    /// Returns when cancelled, when the outbound reader is dropped, or after
    /// forwarding the backlog of an overflowed sink.
    pub async fn consume(self: Arc<Self>, outbound: mpsc::Sender<Update>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.wake.notified() => {}
            }

            let (pending, overflowed) = {
                let mut state = self.state.lock();
                (std::mem::take(&mut state.queue), state.overflowed)
            };

            for update in pending {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = outbound.send(update) => {
                        if sent.is_err() {
                            debug!("Outbound stream for sink {} closed", self.id);
                            return;
                        }
                    }
                }
            }

            if overflowed {
                warn!("Stopping drain task for overflowed sink {}", self.id);
                return;
            }
        }
    }
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sink")
            .field("id", &self.id)
            .field("settings", &self.settings)
            .field("dropped", &self.dropped())
            .finish()
    }
}
