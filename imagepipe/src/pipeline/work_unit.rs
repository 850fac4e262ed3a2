//! Shared, reference-counted units of stage work.
//!
//! A [`WorkUnit`] is one in-flight execution of one stage (fetch, decode or
//! one processing prefix) for one key. Any number of subscribers attach to
//! it: end-user tasks and downstream units alike. The unit:
//!
//! - runs at the maximum priority of its attached subscribers
//! - delivers exactly one result to every subscriber still attached
//! - cancels itself, and detaches from its own upstream, when its last
//!   subscriber leaves before it finishes
//!
//! ```text
//! task A ─┐                       ┌─ process[k=1] unit ─┐
//! task B ─┼─▶ process[k=2] unit ──┘                     ├─▶ decode ─▶ fetch
//! task C ─────────────────────────────────────────────────┘
//! ```
//!
//! Lock order is downstream to upstream: a unit may call into its upstream
//! while holding its own lock, never the reverse. Registry release hooks,
//! result delivery and progress callbacks all run with the lock dropped.

use crate::logging::signposts_enabled;
use crate::pipeline::error::PipelineError;
use crate::pipeline::scheduler::{StagePermit, StageScheduler};
use crate::pipeline::task::Progress;
use crate::request::Priority;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Result delivered by a work unit to its subscribers.
pub type StageResult<T> = Result<T, PipelineError>;

/// Callback receiving progress updates.
pub(crate) type ProgressSink = Arc<dyn Fn(Progress) + Send + Sync>;

/// Latest progress owed to a subscriber that joined mid-flight.
#[must_use = "the subscriber only sees earlier progress once the replay is delivered"]
pub(crate) struct ProgressReplay {
    progress: Progress,
    sink: ProgressSink,
}

impl ProgressReplay {
    pub fn deliver(self) {
        (self.sink)(self.progress);
    }
}

/// Release hook installed by the owning registry.
pub(crate) type ReleaseHook = Box<dyn FnOnce() + Send>;

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a subscriber: a task handle or a work unit.
///
/// Work units subscribe to their upstream under their own id, so the same
/// id space covers both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Allocates a process-unique id.
    pub fn next() -> Self {
        Self(NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Stage a unit belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Fetch,
    Decode,
    Process,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Fetch => "fetch",
            StageKind::Decode => "decode",
            StageKind::Process => "process",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnitState {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl UnitState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UnitState::Succeeded | UnitState::Failed | UnitState::Cancelled
        )
    }
}

/// Which caches a unit's result may be written to.
///
/// Merged across every end-user subscriber for which the unit is the
/// terminal stage; other subscribers contribute nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitPolicy {
    pub memory: bool,
    pub disk: bool,
}

impl CommitPolicy {
    pub fn none() -> Self {
        Self::default()
    }

    fn merge(&mut self, other: CommitPolicy) {
        self.memory |= other.memory;
        self.disk |= other.disk;
    }
}

/// A subscriber attaching to a unit.
pub(crate) struct Subscription<T> {
    pub id: SubscriberId,
    pub priority: Priority,
    pub sender: oneshot::Sender<StageResult<T>>,
    pub progress: Option<ProgressSink>,
    pub commit: CommitPolicy,
}

impl<T> Subscription<T> {
    pub fn new(
        id: SubscriberId,
        priority: Priority,
        sender: oneshot::Sender<StageResult<T>>,
    ) -> Self {
        Self {
            id,
            priority,
            sender,
            progress: None,
            commit: CommitPolicy::none(),
        }
    }

    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn with_commit(mut self, commit: CommitPolicy) -> Self {
        self.commit = commit;
        self
    }
}

/// The subscriber side of an attachment, as seen by the subscriber.
///
/// Type-erased so tasks and downstream units can hold their upstream
/// regardless of its result type.
pub(crate) trait Dependency: Send + Sync {
    fn update_priority(&self, subscriber: SubscriberId, priority: Priority);

    fn detach(&self, subscriber: SubscriberId);
}

struct Subscriber<T> {
    priority: Priority,
    sender: oneshot::Sender<StageResult<T>>,
    progress: Option<ProgressSink>,
}

struct UnitInner<T> {
    state: UnitState,
    subscribers: HashMap<SubscriberId, Subscriber<T>>,
    priority: Priority,
    progress: Option<Progress>,
    upstream: Option<Arc<dyn Dependency>>,
    release: Option<ReleaseHook>,
    commit: CommitPolicy,
}

/// One shared execution of a stage for a key.
pub struct WorkUnit<T> {
    id: SubscriberId,
    kind: StageKind,
    label: String,
    scheduler: Arc<StageScheduler>,
    cancel: CancellationToken,
    inner: Mutex<UnitInner<T>>,
}

impl<T> WorkUnit<T>
where
    T: Clone + Send + 'static,
{
    pub(crate) fn new(
        kind: StageKind,
        label: impl Into<String>,
        scheduler: Arc<StageScheduler>,
    ) -> Self {
        Self {
            id: SubscriberId::next(),
            kind,
            label: label.into(),
            scheduler,
            cancel: CancellationToken::new(),
            inner: Mutex::new(UnitInner {
                state: UnitState::Pending,
                subscribers: HashMap::new(),
                priority: Priority::FLOOR,
                progress: None,
                upstream: None,
                release: None,
                commit: CommitPolicy::none(),
            }),
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> UnitState {
        self.inner.lock().state
    }

    /// Current effective priority.
    pub fn priority(&self) -> Priority {
        self.inner.lock().priority
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    pub(crate) fn commit_policy(&self) -> CommitPolicy {
        self.inner.lock().commit
    }

    /// Attaches a subscriber.
    ///
    /// Fails, handing the subscription back, if the unit already reached a
    /// terminal state. A late subscriber is owed the latest progress: the
    /// returned [`ProgressReplay`] must be delivered by the caller once it
    /// holds no locks.
    pub(crate) fn try_attach(
        &self,
        subscription: Subscription<T>,
    ) -> Result<Option<ProgressReplay>, Subscription<T>> {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return Err(subscription);
        }

        let Subscription {
            id,
            priority,
            sender,
            progress,
            commit,
        } = subscription;

        inner.commit.merge(commit);
        let replay = inner
            .progress
            .zip(progress.clone())
            .map(|(progress, sink)| ProgressReplay { progress, sink });
        inner.subscribers.insert(
            id,
            Subscriber {
                priority,
                sender,
                progress,
            },
        );
        self.refresh_priority(&mut inner);
        Ok(replay)
    }

    /// Installs the registry's release hook.
    ///
    /// Runs it immediately if the unit already finished.
    pub(crate) fn set_release(&self, release: ReleaseHook) {
        let release = {
            let mut inner = self.inner.lock();
            if !inner.state.is_terminal() {
                inner.release = Some(release);
                return;
            }
            release
        };
        release();
    }

    /// Records the unit's subscription to its upstream unit.
    ///
    /// The upstream is told the current priority, which may have changed
    /// since the subscription was made. If this unit was cancelled in the
    /// meantime the subscription is withdrawn instead.
    pub(crate) fn set_upstream(&self, upstream: Arc<dyn Dependency>) {
        {
            let mut inner = self.inner.lock();
            if !inner.state.is_terminal() {
                upstream.update_priority(self.id, inner.priority);
                inner.upstream = Some(upstream);
                return;
            }
        }
        upstream.detach(self.id);
    }

    fn refresh_priority(&self, inner: &mut UnitInner<T>) {
        let priority = inner
            .subscribers
            .values()
            .map(|s| s.priority)
            .max()
            .unwrap_or(Priority::FLOOR);
        if priority == inner.priority {
            return;
        }

        debug!(
            stage = %self.kind,
            unit = %self.id,
            key = %self.label,
            from = %inner.priority,
            to = %priority,
            "Work unit priority changed"
        );
        inner.priority = priority;
        self.scheduler.reprioritize(self.id, priority);
        if let Some(upstream) = &inner.upstream {
            upstream.update_priority(self.id, priority);
        }
    }

    /// Waits for an execution slot at the unit's current priority.
    ///
    /// Queued under the unit lock so a concurrent priority change lands
    /// either before the read or on the queued entry.
    pub(crate) async fn acquire_slot(&self) -> StagePermit {
        let admission = {
            let inner = self.inner.lock();
            self.scheduler.acquire(self.id, inner.priority)
        };
        admission.await
    }

    /// Moves a pending unit to running. False if it was cancelled.
    pub(crate) fn mark_running(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            UnitState::Pending => {
                inner.state = UnitState::Running;
                true
            }
            UnitState::Running => true,
            _ => false,
        }
    }

    /// Fans progress out to every subscriber. Regressions are dropped.
    pub(crate) fn report_progress(&self, progress: Progress) {
        let sinks: Vec<ProgressSink> = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return;
            }
            if let Some(last) = inner.progress {
                if progress.completed < last.completed {
                    return;
                }
            }
            inner.progress = Some(progress);
            inner
                .subscribers
                .values()
                .filter_map(|s| s.progress.clone())
                .collect()
        };

        for sink in sinks {
            sink(progress);
        }
    }

    /// Delivers the unit's single result.
    ///
    /// Returns false if the unit already finished or was cancelled, in
    /// which case the result is discarded.
    pub(crate) fn complete(&self, result: StageResult<T>) -> bool {
        let (subscribers, release) = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return false;
            }
            inner.state = if result.is_ok() {
                UnitState::Succeeded
            } else {
                UnitState::Failed
            };
            inner.upstream = None;
            let subscribers: Vec<Subscriber<T>> =
                inner.subscribers.drain().map(|(_, s)| s).collect();
            (subscribers, inner.release.take())
        };

        if let Some(release) = release {
            release();
        }

        debug!(
            stage = %self.kind,
            unit = %self.id,
            key = %self.label,
            subscribers = subscribers.len(),
            success = result.is_ok(),
            "Work unit completed"
        );

        for subscriber in subscribers {
            let _ = subscriber.sender.send(result.clone());
        }
        true
    }

    /// Removes a subscriber, cancelling the unit if it was the last one.
    pub(crate) fn detach_subscriber(&self, subscriber: SubscriberId) {
        let (upstream, release) = {
            let mut inner = self.inner.lock();
            if inner.subscribers.remove(&subscriber).is_none() {
                return;
            }
            if inner.state.is_terminal() {
                return;
            }
            if !inner.subscribers.is_empty() {
                self.refresh_priority(&mut inner);
                return;
            }
            inner.state = UnitState::Cancelled;
            (inner.upstream.take(), inner.release.take())
        };

        debug!(
            stage = %self.kind,
            unit = %self.id,
            key = %self.label,
            "Work unit cancelled, no subscribers left"
        );
        self.shut_down(upstream, release);
    }

    /// Cancels the unit regardless of its subscribers.
    ///
    /// Subscribers are dropped without a result.
    pub(crate) fn abort(&self) {
        let (upstream, release) = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return;
            }
            inner.state = UnitState::Cancelled;
            inner.subscribers.clear();
            (inner.upstream.take(), inner.release.take())
        };
        self.shut_down(upstream, release);
    }

    fn shut_down(&self, upstream: Option<Arc<dyn Dependency>>, release: Option<ReleaseHook>) {
        self.cancel.cancel();
        self.scheduler.dequeue(self.id);
        if let Some(upstream) = upstream {
            upstream.detach(self.id);
        }
        if let Some(release) = release {
            release();
        }
    }

    /// Drives `work` on the runtime and delivers its outcome.
    ///
    /// The work future is dropped as soon as the unit is cancelled, which
    /// cancels whatever it was awaiting. A panic inside `work` fails the
    /// unit with [`PipelineError::Internal`].
    pub(crate) fn spawn<F>(self: &Arc<Self>, runtime: &Handle, work: F)
    where
        F: Future<Output = StageResult<T>> + Send + 'static,
    {
        let unit = Arc::clone(self);
        runtime.spawn(async move {
            let started = Instant::now();
            let work = AssertUnwindSafe(work).catch_unwind();
            let outcome = tokio::select! {
                biased;
                _ = unit.cancel.cancelled() => None,
                result = work => Some(result.unwrap_or_else(|panic| unit.panicked(panic.as_ref()))),
            };

            if signposts_enabled() {
                info!(
                    target: "imagepipe::signpost",
                    stage = %unit.kind,
                    key = %unit.label,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    cancelled = outcome.is_none(),
                    "Stage finished"
                );
            }

            if let Some(result) = outcome {
                unit.complete(result);
            }
        });
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl<T> WorkUnit<T> {
    fn panicked(&self, panic: &(dyn Any + Send)) -> StageResult<T> {
        let message = panic_message(panic);
        error!(
            stage = %self.kind,
            unit = %self.id,
            key = %self.label,
            panic = %message,
            "Stage work panicked"
        );
        Err(PipelineError::Internal(format!(
            "{} stage panicked: {}",
            self.kind, message
        )))
    }
}

impl<T> Dependency for WorkUnit<T>
where
    T: Clone + Send + 'static,
{
    fn update_priority(&self, subscriber: SubscriberId, priority: Priority) {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return;
        }
        if let Some(entry) = inner.subscribers.get_mut(&subscriber) {
            entry.priority = priority;
            self.refresh_priority(&mut inner);
        }
    }

    fn detach(&self, subscriber: SubscriberId) {
        self.detach_subscriber(subscriber);
    }
}

impl<T> fmt::Debug for WorkUnit<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("WorkUnit")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("state", &inner.state)
            .field("priority", &inner.priority)
            .field("subscribers", &inner.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    type Unit = WorkUnit<u32>;

    fn unit() -> Arc<Unit> {
        let scheduler = Arc::new(StageScheduler::new("test", 4));
        Arc::new(WorkUnit::new(StageKind::Fetch, "mem://a", scheduler))
    }

    fn subscribe(
        unit: &Unit,
        priority: Priority,
    ) -> (SubscriberId, oneshot::Receiver<StageResult<u32>>) {
        let id = SubscriberId::next();
        let (tx, rx) = oneshot::channel();
        assert!(unit.try_attach(Subscription::new(id, priority, tx)).is_ok());
        (id, rx)
    }

    #[derive(Default)]
    struct RecordingDependency {
        priorities: Mutex<Vec<Priority>>,
        detached: AtomicUsize,
    }

    impl Dependency for RecordingDependency {
        fn update_priority(&self, _subscriber: SubscriberId, priority: Priority) {
            self.priorities.lock().push(priority);
        }

        fn detach(&self, _subscriber: SubscriberId) {
            self.detached.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_priority_is_max_of_subscribers() {
        let unit = unit();
        assert_eq!(unit.priority(), Priority::FLOOR);

        let (low, _rx1) = subscribe(&unit, Priority::Low);
        let (high, _rx2) = subscribe(&unit, Priority::High);
        assert_eq!(unit.priority(), Priority::High);

        unit.detach_subscriber(high);
        assert_eq!(unit.priority(), Priority::Low);

        unit.update_priority(low, Priority::VeryHigh);
        assert_eq!(unit.priority(), Priority::VeryHigh);
    }

    #[test]
    fn test_priority_propagates_upstream() {
        let unit = unit();
        let upstream = Arc::new(RecordingDependency::default());
        let (id, _rx) = subscribe(&unit, Priority::Normal);

        unit.set_upstream(upstream.clone());
        unit.update_priority(id, Priority::VeryHigh);

        assert_eq!(
            *upstream.priorities.lock(),
            vec![Priority::Normal, Priority::VeryHigh]
        );
    }

    #[test]
    fn test_last_detach_cancels_and_detaches_upstream() {
        let unit = unit();
        let upstream = Arc::new(RecordingDependency::default());
        let released = Arc::new(AtomicUsize::new(0));

        let (a, _rx1) = subscribe(&unit, Priority::Normal);
        let (b, _rx2) = subscribe(&unit, Priority::Normal);
        unit.set_upstream(upstream.clone());
        let counter = Arc::clone(&released);
        unit.set_release(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        unit.detach_subscriber(a);
        assert_eq!(unit.state(), UnitState::Pending);
        assert_eq!(upstream.detached.load(Ordering::SeqCst), 0);

        unit.detach_subscriber(b);
        assert_eq!(unit.state(), UnitState::Cancelled);
        assert_eq!(upstream.detached.load(Ordering::SeqCst), 1);
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(unit.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_complete_delivers_to_all_subscribers() {
        let unit = unit();
        let (_a, rx1) = subscribe(&unit, Priority::Normal);
        let (_b, rx2) = subscribe(&unit, Priority::High);

        assert!(unit.complete(Ok(7)));
        assert_eq!(rx1.await.unwrap().unwrap(), 7);
        assert_eq!(rx2.await.unwrap().unwrap(), 7);
        assert_eq!(unit.state(), UnitState::Succeeded);
    }

    #[tokio::test]
    async fn test_detached_subscriber_receives_nothing() {
        let unit = unit();
        let (a, rx1) = subscribe(&unit, Priority::Normal);
        let (_b, rx2) = subscribe(&unit, Priority::Normal);

        unit.detach_subscriber(a);
        unit.complete(Ok(1));

        assert!(rx1.await.is_err());
        assert_eq!(rx2.await.unwrap().unwrap(), 1);
    }

    #[test]
    fn test_complete_after_cancel_is_discarded() {
        let unit = unit();
        let (a, _rx) = subscribe(&unit, Priority::Normal);
        unit.detach_subscriber(a);

        assert!(!unit.complete(Ok(1)));
        assert_eq!(unit.state(), UnitState::Cancelled);
    }

    #[test]
    fn test_attach_to_terminal_unit_fails() {
        let unit = unit();
        let (_a, _rx) = subscribe(&unit, Priority::Normal);
        unit.complete(Err(PipelineError::Cancelled));

        let (tx, _rx2) = oneshot::channel();
        let late = Subscription::new(SubscriberId::next(), Priority::Normal, tx);
        assert!(unit.try_attach(late).is_err());
    }

    #[test]
    fn test_set_upstream_after_cancel_detaches() {
        let unit = unit();
        let (a, _rx) = subscribe(&unit, Priority::Normal);
        unit.detach_subscriber(a);

        let upstream = Arc::new(RecordingDependency::default());
        unit.set_upstream(upstream.clone());
        assert_eq!(upstream.detached.load(Ordering::SeqCst), 1);
        assert!(upstream.priorities.lock().is_empty());
    }

    #[test]
    fn test_progress_is_monotonic_and_replayed() {
        let unit = unit();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink: ProgressSink = Arc::new(move |p: Progress| sink_seen.lock().push(p.completed));

        let (tx, _rx) = oneshot::channel();
        let sub = Subscription::new(SubscriberId::next(), Priority::Normal, tx).with_progress(sink);
        assert!(matches!(unit.try_attach(sub), Ok(None)));

        unit.report_progress(Progress::new(10, Some(100)));
        unit.report_progress(Progress::new(5, Some(100)));
        unit.report_progress(Progress::new(20, Some(100)));
        assert_eq!(*seen.lock(), vec![10, 20]);

        let late_seen = Arc::new(Mutex::new(Vec::new()));
        let late_sink_seen = Arc::clone(&late_seen);
        let late_sink: ProgressSink =
            Arc::new(move |p: Progress| late_sink_seen.lock().push(p.completed));
        let (tx, _rx2) = oneshot::channel();
        let late =
            Subscription::new(SubscriberId::next(), Priority::Normal, tx).with_progress(late_sink);
        let replay = unit.try_attach(late).ok().flatten().expect("late joiner gets a replay");
        // Nothing reaches the sink until the caller delivers the replay
        assert!(late_seen.lock().is_empty());
        replay.deliver();
        assert_eq!(*late_seen.lock(), vec![20]);
    }

    #[test]
    fn test_commit_policy_merges() {
        let unit = unit();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        let memory_only = CommitPolicy {
            memory: true,
            disk: false,
        };
        let disk_only = CommitPolicy {
            memory: false,
            disk: true,
        };

        assert!(unit
            .try_attach(
                Subscription::new(SubscriberId::next(), Priority::Normal, tx1)
                    .with_commit(memory_only)
            )
            .is_ok());
        assert_eq!(unit.commit_policy(), memory_only);

        assert!(unit
            .try_attach(
                Subscription::new(SubscriberId::next(), Priority::Normal, tx2)
                    .with_commit(disk_only)
            )
            .is_ok());
        assert_eq!(
            unit.commit_policy(),
            CommitPolicy {
                memory: true,
                disk: true
            }
        );
    }

    #[tokio::test]
    async fn test_spawned_work_dropped_on_cancel() {
        let unit = unit();
        let (id, rx) = subscribe(&unit, Priority::Normal);
        let dropped = Arc::new(AtomicUsize::new(0));

        struct DropFlag(Arc<AtomicUsize>);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let flag = DropFlag(Arc::clone(&dropped));
        unit.spawn(&Handle::current(), async move {
            let _flag = flag;
            std::future::pending::<StageResult<u32>>().await
        });

        tokio::task::yield_now().await;
        unit.detach_subscriber(id);

        assert!(rx.await.is_err());
        for _ in 0..100 {
            if dropped.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_work_fails_unit() {
        let unit = unit();
        let (_id, rx) = subscribe(&unit, Priority::Normal);
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        unit.set_release(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        fn explode() -> StageResult<u32> {
            panic!("loader exploded")
        }
        unit.spawn(&Handle::current(), async { explode() });

        match rx.await.unwrap() {
            Err(PipelineError::Internal(message)) => {
                assert!(message.contains("loader exploded"))
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(unit.state(), UnitState::Failed);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
