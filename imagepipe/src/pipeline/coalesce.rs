//! Per-stage registries of in-flight work units.
//!
//! Each stage kind has one [`CoalescingRegistry`] mapping its key type to the
//! live [`WorkUnit`] for that key. When a subscriber arrives:
//!
//! - if a live unit exists for the key, the subscriber joins it
//! - otherwise a new unit is created, registered and returned to the caller,
//!   who is responsible for starting it
//!
//! ```text
//! submit A ─┐                                    ┌─▶ A
//! submit B ─┼──▶ registry[key] ──▶ one WorkUnit ─┼─▶ B
//! submit C ─┘                                    └─▶ C
//! ```
//!
//! Lookup and attach happen atomically under the map's entry lock, so two
//! concurrent callers can never both create a unit for the same key. Units
//! remove themselves through a release hook when they finish or are
//! cancelled. A unit found in the map in a terminal state is treated as
//! absent and replaced.
//!
//! With coalescing disabled every call creates a fresh unit; those units
//! are still tracked so the pipeline can abort them on invalidation.

use crate::pipeline::work_unit::{
    ProgressReplay, StageKind, SubscriberId, Subscription, WorkUnit,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Result of registering a subscriber.
pub(crate) enum Coalesced<T> {
    /// A new unit was created; the caller must start it
    Created(Arc<WorkUnit<T>>),
    /// The subscriber joined a unit that is already in flight
    Joined(Arc<WorkUnit<T>>),
}

impl<T> Coalesced<T> {
    pub fn unit(&self) -> &Arc<WorkUnit<T>> {
        match self {
            Coalesced::Created(unit) | Coalesced::Joined(unit) => unit,
        }
    }

    pub fn into_unit(self) -> Arc<WorkUnit<T>> {
        match self {
            Coalesced::Created(unit) | Coalesced::Joined(unit) => unit,
        }
    }
}

/// Statistics for monitoring coalescing effectiveness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoalescerStats {
    /// Total subscriptions received
    pub total_requests: u64,
    /// Subscriptions that joined existing work
    pub coalesced_requests: u64,
    /// Subscriptions that created new work
    pub new_requests: u64,
}

impl CoalescerStats {
    /// Returns the coalescing ratio (0.0 to 1.0)
    pub fn coalescing_ratio(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.coalesced_requests as f64 / self.total_requests as f64
        }
    }
}

/// Live work units of one stage kind, keyed by that stage's key.
pub struct CoalescingRegistry<K, T> {
    kind: StageKind,
    enabled: bool,
    in_flight: Arc<DashMap<K, Arc<WorkUnit<T>>>>,
    uncoalesced: Arc<DashMap<SubscriberId, Arc<WorkUnit<T>>>>,
    total_requests: AtomicU64,
    coalesced_requests: AtomicU64,
    new_requests: AtomicU64,
}

impl<K, T> CoalescingRegistry<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + 'static,
{
    pub fn new(kind: StageKind, enabled: bool) -> Self {
        Self {
            kind,
            enabled,
            in_flight: Arc::new(DashMap::new()),
            uncoalesced: Arc::new(DashMap::new()),
            total_requests: AtomicU64::new(0),
            coalesced_requests: AtomicU64::new(0),
            new_requests: AtomicU64::new(0),
        }
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Attaches `subscription` to the live unit for `key`, creating one with
    /// `factory` if there is none.
    pub(crate) fn get_or_create<F>(
        &self,
        key: &K,
        subscription: Subscription<T>,
        factory: F,
    ) -> Coalesced<T>
    where
        F: FnOnce() -> WorkUnit<T>,
    {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        if !self.enabled {
            return Coalesced::Created(self.create_uncoalesced(subscription, factory));
        }

        let unit = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(mut entry) => match entry.get().try_attach(subscription) {
                Ok(replay) => {
                    let unit = Arc::clone(entry.get());
                    drop(entry);
                    return self.joined(unit, replay);
                }
                Err(subscription) => {
                    // Finished but not yet released: replace it
                    let unit = Arc::new(factory());
                    attach_fresh(&unit, subscription);
                    entry.insert(Arc::clone(&unit));
                    unit
                }
            },
            Entry::Vacant(entry) => {
                let unit = Arc::new(factory());
                attach_fresh(&unit, subscription);
                entry.insert(Arc::clone(&unit));
                unit
            }
        };

        self.new_requests.fetch_add(1, Ordering::Relaxed);
        debug!(
            stage = %self.kind,
            unit = %unit.id(),
            key = %unit.label(),
            in_flight = self.in_flight.len(),
            "New work unit"
        );

        let map = Arc::downgrade(&self.in_flight);
        let key = key.clone();
        let id = unit.id();
        unit.set_release(Box::new(move || release_keyed(&map, &key, id)));

        Coalesced::Created(unit)
    }

    /// Finishes a join once the map entry is no longer locked.
    fn joined(&self, unit: Arc<WorkUnit<T>>, replay: Option<ProgressReplay>) -> Coalesced<T> {
        let coalesced = self.coalesced_requests.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            stage = %self.kind,
            unit = %unit.id(),
            coalesced,
            "Coalescing subscriber onto in-flight work"
        );
        if let Some(replay) = replay {
            replay.deliver();
        }
        Coalesced::Joined(unit)
    }

    fn create_uncoalesced<F>(&self, subscription: Subscription<T>, factory: F) -> Arc<WorkUnit<T>>
    where
        F: FnOnce() -> WorkUnit<T>,
    {
        let unit = Arc::new(factory());
        attach_fresh(&unit, subscription);
        self.new_requests.fetch_add(1, Ordering::Relaxed);

        let id = unit.id();
        self.uncoalesced.insert(id, Arc::clone(&unit));
        let map = Arc::downgrade(&self.uncoalesced);
        unit.set_release(Box::new(move || {
            if let Some(map) = map.upgrade() {
                map.remove(&id);
            }
        }));
        unit
    }

    /// Removes the entry for `key` if it still refers to unit `id`.
    pub fn remove(&self, key: &K, id: SubscriberId) {
        self.in_flight.remove_if(key, |_, unit| unit.id() == id);
    }

    /// Returns the live unit for `key`, if any.
    pub fn get(&self, key: &K) -> Option<Arc<WorkUnit<T>>> {
        self.in_flight.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Aborts every live unit. Their subscribers receive no result.
    pub(crate) fn abort_all(&self) {
        let units: Vec<Arc<WorkUnit<T>>> = self
            .in_flight
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .chain(self.uncoalesced.iter().map(|entry| Arc::clone(entry.value())))
            .collect();

        if !units.is_empty() {
            info!(stage = %self.kind, count = units.len(), "Aborting in-flight work units");
        }
        for unit in units {
            unit.abort();
        }
    }

    /// Returns a snapshot of the current statistics.
    pub fn stats(&self) -> CoalescerStats {
        CoalescerStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            coalesced_requests: self.coalesced_requests.load(Ordering::Relaxed),
            new_requests: self.new_requests.load(Ordering::Relaxed),
        }
    }

    /// Returns the number of live units.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len() + self.uncoalesced.len()
    }

    /// Logs current statistics.
    pub fn log_stats(&self) {
        let stats = self.stats();
        info!(
            stage = %self.kind,
            total_requests = stats.total_requests,
            coalesced = stats.coalesced_requests,
            new_requests = stats.new_requests,
            in_flight = self.in_flight_count(),
            coalescing_ratio = format!("{:.1}%", stats.coalescing_ratio() * 100.0),
            "Request coalescing statistics"
        );
    }
}

fn attach_fresh<T>(unit: &WorkUnit<T>, subscription: Subscription<T>)
where
    T: Clone + Send + 'static,
{
    // A unit nobody else has seen cannot be terminal yet, nor have progress
    if unit.try_attach(subscription).is_err() {
        debug!(unit = %unit.id(), "Fresh work unit rejected its first subscriber");
    }
}

fn release_keyed<K, T>(map: &Weak<DashMap<K, Arc<WorkUnit<T>>>>, key: &K, id: SubscriberId)
where
    K: Eq + Hash,
    T: Clone + Send + 'static,
{
    if let Some(map) = map.upgrade() {
        map.remove_if(key, |_, unit| unit.id() == id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::error::PipelineError;
    use crate::pipeline::scheduler::StageScheduler;
    use crate::pipeline::task::Progress;
    use crate::pipeline::work_unit::{ProgressSink, StageResult, UnitState};
    use crate::request::Priority;
    use tokio::sync::oneshot;

    type Registry = CoalescingRegistry<&'static str, u32>;

    fn factory(scheduler: &Arc<StageScheduler>) -> impl FnOnce() -> WorkUnit<u32> + '_ {
        move || WorkUnit::new(StageKind::Fetch, "test", Arc::clone(scheduler))
    }

    fn subscription() -> (Subscription<u32>, oneshot::Receiver<StageResult<u32>>) {
        let (tx, rx) = oneshot::channel();
        (
            Subscription::new(SubscriberId::next(), Priority::Normal, tx),
            rx,
        )
    }

    #[test]
    fn test_coalescer_stats_ratio() {
        let stats = CoalescerStats {
            total_requests: 10,
            coalesced_requests: 3,
            new_requests: 7,
        };
        assert!((stats.coalescing_ratio() - 0.3).abs() < 0.001);
        assert_eq!(CoalescerStats::default().coalescing_ratio(), 0.0);
    }

    #[tokio::test]
    async fn test_same_key_joins_existing_unit() {
        let scheduler = Arc::new(StageScheduler::new("test", 1));
        let registry = Registry::new(StageKind::Fetch, true);

        let (s1, rx1) = subscription();
        let (s2, rx2) = subscription();
        let first = registry.get_or_create(&"a", s1, factory(&scheduler));
        let second = registry.get_or_create(&"a", s2, factory(&scheduler));

        assert!(matches!(first, Coalesced::Created(_)));
        assert!(matches!(second, Coalesced::Joined(_)));
        assert_eq!(first.unit().id(), second.unit().id());
        assert_eq!(first.unit().subscriber_count(), 2);

        first.unit().complete(Ok(3));
        assert_eq!(rx1.await.unwrap().unwrap(), 3);
        assert_eq!(rx2.await.unwrap().unwrap(), 3);

        let stats = registry.stats();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.coalesced_requests, 1);
        assert_eq!(stats.new_requests, 1);
    }

    #[test]
    fn test_different_keys_create_separate_units() {
        let scheduler = Arc::new(StageScheduler::new("test", 1));
        let registry = Registry::new(StageKind::Fetch, true);

        let (s1, _rx1) = subscription();
        let (s2, _rx2) = subscription();
        let a = registry.get_or_create(&"a", s1, factory(&scheduler));
        let b = registry.get_or_create(&"b", s2, factory(&scheduler));

        assert!(matches!(b, Coalesced::Created(_)));
        assert_ne!(a.unit().id(), b.unit().id());
        assert_eq!(registry.in_flight_count(), 2);
    }

    #[test]
    fn test_completed_unit_is_released() {
        let scheduler = Arc::new(StageScheduler::new("test", 1));
        let registry = Registry::new(StageKind::Fetch, true);

        let (s1, _rx1) = subscription();
        let first = registry.get_or_create(&"a", s1, factory(&scheduler));
        first.unit().complete(Err(PipelineError::Cancelled));
        assert_eq!(registry.in_flight_count(), 0);

        let (s2, _rx2) = subscription();
        let second = registry.get_or_create(&"a", s2, factory(&scheduler));
        assert!(matches!(second, Coalesced::Created(_)));
        assert_ne!(first.unit().id(), second.unit().id());
    }

    #[test]
    fn test_cancelled_unit_is_released() {
        let scheduler = Arc::new(StageScheduler::new("test", 1));
        let registry = Registry::new(StageKind::Fetch, true);

        let (s1, _rx1) = subscription();
        let subscriber = s1.id;
        let created = registry.get_or_create(&"a", s1, factory(&scheduler));
        created.unit().detach_subscriber(subscriber);

        assert_eq!(created.unit().state(), UnitState::Cancelled);
        assert!(registry.get(&"a").is_none());
    }

    #[test]
    fn test_stale_release_keeps_replacement() {
        let scheduler = Arc::new(StageScheduler::new("test", 1));
        let registry = Registry::new(StageKind::Fetch, true);

        let (s1, _rx1) = subscription();
        let first = registry.get_or_create(&"a", s1, factory(&scheduler));
        let (s2, _rx2) = subscription();
        registry.get_or_create(&"b", s2, factory(&scheduler));

        // Removing with a stale id leaves the live entry alone
        registry.remove(&"a", SubscriberId::next());
        assert_eq!(registry.get(&"a").map(|u| u.id()), Some(first.unit().id()));

        registry.remove(&"a", first.unit().id());
        assert!(registry.get(&"a").is_none());
    }

    #[test]
    fn test_disabled_registry_never_coalesces() {
        let scheduler = Arc::new(StageScheduler::new("test", 1));
        let registry = Registry::new(StageKind::Fetch, false);

        let (s1, _rx1) = subscription();
        let (s2, _rx2) = subscription();
        let a = registry.get_or_create(&"a", s1, factory(&scheduler));
        let b = registry.get_or_create(&"a", s2, factory(&scheduler));

        assert!(matches!(b, Coalesced::Created(_)));
        assert_ne!(a.unit().id(), b.unit().id());
        assert_eq!(registry.in_flight_count(), 2);
        assert!(registry.get(&"a").is_none());

        a.unit().complete(Ok(1));
        assert_eq!(registry.in_flight_count(), 1);
    }

    #[tokio::test]
    async fn test_abort_all_drops_subscribers() {
        let scheduler = Arc::new(StageScheduler::new("test", 1));
        let registry = Registry::new(StageKind::Fetch, true);

        let (s1, rx1) = subscription();
        let created = registry.get_or_create(&"a", s1, factory(&scheduler));
        registry.abort_all();

        assert!(rx1.await.is_err());
        assert_eq!(created.unit().state(), UnitState::Cancelled);
        assert_eq!(registry.in_flight_count(), 0);
    }

    #[test]
    fn test_progress_replay_runs_outside_map_lock() {
        let scheduler = Arc::new(StageScheduler::new("test", 1));
        let registry = Arc::new(Registry::new(StageKind::Fetch, true));

        let (s1, _rx1) = subscription();
        let first = registry.get_or_create(&"a", s1, factory(&scheduler));
        first.unit().report_progress(Progress::new(5, Some(10)));

        // The sink reads the registry, which needs the entry's shard lock
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink_registry = Arc::clone(&registry);
        let sink_seen = Arc::clone(&seen);
        let sink: ProgressSink = Arc::new(move |progress: Progress| {
            let live = sink_registry.get(&"a").is_some();
            sink_seen.lock().push((progress.completed, live));
        });

        let (tx, _rx2) = oneshot::channel();
        let late =
            Subscription::new(SubscriberId::next(), Priority::Normal, tx).with_progress(sink);
        let joined = registry.get_or_create(&"a", late, factory(&scheduler));

        assert!(matches!(joined, Coalesced::Joined(_)));
        assert_eq!(*seen.lock(), vec![(5, true)]);
    }
}
