//! Priority-ordered admission for stage work.
//!
//! Each stage kind (fetch, decode, process) owns one [`StageScheduler`]
//! bounding how many units of that kind execute at once. Units that cannot
//! start immediately wait in a queue ordered by priority, then by arrival:
//!
//! ```text
//! max_concurrent: 2
//! running: [fetch a] [fetch b]
//! queue:   VeryHigh#7 → High#3 → High#5 → Low#1
//!                 ▲ dequeued first when a slot is released
//! ```
//!
//! Queue entries follow their unit's priority: [`StageScheduler::reprioritize`]
//! moves an entry without losing its arrival order, and
//! [`StageScheduler::dequeue`] drops it immediately when the unit is
//! cancelled, so cancelled work never runs.

use crate::pipeline::work_unit::SubscriberId;
use crate::request::Priority;
use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Position of a waiting unit in the queue.
///
/// Orders higher priority first, then lower sequence (older) first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueueSlot {
    priority: Priority,
    sequence: u64,
}

impl PartialOrd for QueueSlot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueSlot {
    fn cmp(&self, other: &Self) -> Ordering {
        match other.priority.cmp(&self.priority) {
            Ordering::Equal => self.sequence.cmp(&other.sequence),
            other_ordering => other_ordering,
        }
    }
}

struct Waiter {
    unit: SubscriberId,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct SchedulerState {
    running: usize,
    queue: BTreeMap<QueueSlot, Waiter>,
    index: HashMap<SubscriberId, QueueSlot>,
    next_sequence: u64,
}

impl SchedulerState {
    /// Hands a released slot to the best waiter, or frees it.
    fn release(&mut self) {
        while let Some((_, waiter)) = self.queue.pop_first() {
            self.index.remove(&waiter.unit);
            if waiter.grant.send(()).is_ok() {
                return;
            }
        }
        self.running = self.running.saturating_sub(1);
    }
}

/// Bounded, priority-aware admission for one stage kind.
pub struct StageScheduler {
    label: &'static str,
    max_concurrent: usize,
    state: Mutex<SchedulerState>,
}

impl StageScheduler {
    /// Creates a scheduler admitting at most `max_concurrent` units at once.
    ///
    /// A limit of zero is treated as one.
    pub fn new(label: &'static str, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        info!(label, max_concurrent, "Created stage scheduler");
        Self {
            label,
            max_concurrent,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    /// Requests an execution slot for `unit`.
    ///
    /// The unit is admitted or queued before this returns, so a
    /// [`reprioritize`](Self::reprioritize) issued afterwards always finds
    /// it. Dropping the returned future before it resolves removes the unit
    /// from the queue. The slot is released when the [`StagePermit`] is
    /// dropped.
    pub fn acquire(
        self: &Arc<Self>,
        unit: SubscriberId,
        priority: Priority,
    ) -> BoxFuture<'static, StagePermit> {
        let mut state = self.state.lock();
        if state.running < self.max_concurrent && state.queue.is_empty() {
            state.running += 1;
            return future::ready(StagePermit {
                scheduler: Arc::clone(self),
            })
            .boxed();
        }

        let (tx, rx) = oneshot::channel();
        let slot = QueueSlot {
            priority,
            sequence: state.next_sequence,
        };
        state.next_sequence += 1;
        state.queue.insert(slot, Waiter { unit, grant: tx });
        state.index.insert(unit, slot);
        debug!(
            label = self.label,
            unit = %unit,
            priority = %priority,
            queued = state.queue.len(),
            "Queued stage work"
        );
        drop(state);

        QueuedTicket {
            scheduler: Arc::clone(self),
            unit,
            grant: Some(rx),
        }
        .granted()
        .boxed()
    }

    /// Moves a queued unit to its new priority, keeping its arrival order.
    ///
    /// Does nothing for units that are not queued.
    pub fn reprioritize(&self, unit: SubscriberId, priority: Priority) {
        let mut state = self.state.lock();
        let Some(slot) = state.index.get(&unit).copied() else {
            return;
        };
        if slot.priority == priority {
            return;
        }
        if let Some(waiter) = state.queue.remove(&slot) {
            let moved = QueueSlot { priority, ..slot };
            state.queue.insert(moved, waiter);
            state.index.insert(unit, moved);
        }
    }

    /// Removes a queued unit without running it.
    pub fn dequeue(&self, unit: SubscriberId) {
        let mut state = self.state.lock();
        if let Some(slot) = state.index.remove(&unit) {
            state.queue.remove(&slot);
            debug!(label = self.label, unit = %unit, "Dequeued cancelled stage work");
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Number of units currently holding a slot.
    pub fn running(&self) -> usize {
        self.state.lock().running
    }

    /// Number of units waiting for a slot.
    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Returns true if `unit` is waiting for a slot.
    pub fn is_queued(&self, unit: SubscriberId) -> bool {
        self.state.lock().index.contains_key(&unit)
    }
}

impl std::fmt::Debug for StageScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("StageScheduler")
            .field("label", &self.label)
            .field("max_concurrent", &self.max_concurrent)
            .field("running", &state.running)
            .field("queued", &state.queue.len())
            .finish()
    }
}

/// A unit waiting in the queue. Dropping it gives up the place in line.
struct QueuedTicket {
    scheduler: Arc<StageScheduler>,
    unit: SubscriberId,
    grant: Option<oneshot::Receiver<()>>,
}

impl QueuedTicket {
    async fn granted(mut self) -> StagePermit {
        if let Some(grant) = self.grant.as_mut() {
            if grant.await.is_err() {
                // Dequeued: the unit was cancelled and its driver is about to
                // be dropped. Never hand out a slot that was not granted.
                std::future::pending::<()>().await;
            }
        }
        self.grant = None;
        StagePermit {
            scheduler: Arc::clone(&self.scheduler),
        }
    }
}

impl Drop for QueuedTicket {
    fn drop(&mut self) {
        let Some(mut grant) = self.grant.take() else {
            return;
        };
        let mut state = self.scheduler.state.lock();
        if let Some(slot) = state.index.remove(&self.unit) {
            state.queue.remove(&slot);
            return;
        }
        // Granted after the waiter stopped listening: pass the slot on.
        if grant.try_recv().is_ok() {
            state.release();
        }
    }
}

/// An execution slot. Released on drop.
pub struct StagePermit {
    scheduler: Arc<StageScheduler>,
}

impl Drop for StagePermit {
    fn drop(&mut self) {
        self.scheduler.state.lock().release();
    }
}

impl std::fmt::Debug for StagePermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagePermit")
            .field("label", &self.scheduler.label)
            .finish()
    }
}
