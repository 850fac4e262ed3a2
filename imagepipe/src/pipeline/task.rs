//! End-user task handles.
//!
//! An [`ImageTask`] is the caller's side of one submitted request. It holds
//! the request's own priority and its attachment to the terminal work unit,
//! and owns the completion callback:
//!
//! - the callback fires exactly once, unless the task is cancelled first
//! - cancellation suppresses the callback and detaches from the unit,
//!   which cancels shared work once nobody else needs it
//! - a task abandoned by the pipeline (invalidation, runtime shutdown)
//!   completes with [`PipelineError::Shutdown`]

use crate::pipeline::error::PipelineError;
use crate::pipeline::work_unit::{Dependency, ProgressSink, SubscriberId};
use crate::processing::ImageContainer;
use crate::request::{Locator, Priority};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Identity of a task.
pub type TaskId = SubscriberId;

/// Progress of a request, in bytes fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub completed: u64,
    /// Expected total, when the loader knows it
    pub total: Option<u64>,
}

impl Progress {
    pub fn new(completed: u64, total: Option<u64>) -> Self {
        Self { completed, total }
    }

    /// Completed fraction in 0.0..=1.0, if the total is known.
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(0) => Some(1.0),
            Some(total) => Some((self.completed as f64 / total as f64).min(1.0)),
            None => None,
        }
    }
}

/// Where a result was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheType {
    Memory,
    Disk,
}

/// A successfully loaded image.
#[derive(Debug, Clone)]
pub struct ImageResponse {
    pub image: ImageContainer,
    /// Set when the full result came from a cache rather than being computed
    pub cache_type: Option<CacheType>,
}

impl ImageResponse {
    pub fn new(image: ImageContainer, cache_type: Option<CacheType>) -> Self {
        Self { image, cache_type }
    }
}

/// Outcome delivered to a completion callback.
pub type TaskResult = Result<ImageResponse, PipelineError>;

pub(crate) type CompletionCallback = Box<dyn FnOnce(TaskResult) + Send>;
pub(crate) type ProgressCallback = Box<dyn Fn(Progress) + Send + Sync>;

/// Lifecycle of a task handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Completed,
    Cancelled,
}

struct TaskInner {
    priority: Priority,
    state: TaskState,
    target: Option<Arc<dyn Dependency>>,
}

struct ProgressForwarder {
    last: Mutex<Option<u64>>,
    callback: ProgressCallback,
}

impl ProgressForwarder {
    fn forward(&self, progress: Progress) {
        let mut last = self.last.lock();
        if last.is_some_and(|completed| progress.completed < completed) {
            return;
        }
        *last = Some(progress.completed);
        (self.callback)(progress);
    }
}

struct TaskShared {
    id: TaskId,
    locator: Locator,
    inner: Mutex<TaskInner>,
    completion: Mutex<Option<CompletionCallback>>,
    progress: Option<ProgressForwarder>,
}

impl TaskShared {
    fn on_progress(&self, progress: Progress) {
        if self.inner.lock().state != TaskState::Running {
            return;
        }
        if let Some(forwarder) = &self.progress {
            forwarder.forward(progress);
        }
    }
}

impl Drop for TaskShared {
    fn drop(&mut self) {
        if let Some(callback) = self.completion.get_mut().take() {
            debug!(task = %self.id, "Task dropped before completion");
            callback(Err(PipelineError::Shutdown));
        }
    }
}

/// Handle to a submitted request.
///
/// Cloning yields another handle to the same task. Dropping every handle
/// does not cancel the request.
#[derive(Clone)]
pub struct ImageTask {
    shared: Arc<TaskShared>,
}

impl ImageTask {
    pub(crate) fn new(
        locator: Locator,
        priority: Priority,
        on_progress: Option<ProgressCallback>,
        on_complete: CompletionCallback,
    ) -> Self {
        Self {
            shared: Arc::new(TaskShared {
                id: SubscriberId::next(),
                locator,
                inner: Mutex::new(TaskInner {
                    priority,
                    state: TaskState::Running,
                    target: None,
                }),
                completion: Mutex::new(Some(on_complete)),
                progress: on_progress.map(|callback| ProgressForwarder {
                    last: Mutex::new(None),
                    callback,
                }),
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.shared.id
    }

    pub fn locator(&self) -> &Locator {
        &self.shared.locator
    }

    pub fn priority(&self) -> Priority {
        self.shared.inner.lock().priority
    }

    pub fn state(&self) -> TaskState {
        self.shared.inner.lock().state
    }

    /// Changes the task's priority.
    ///
    /// Shared work it depends on is re-ranked to the maximum priority of all
    /// its subscribers. No effect once the task finished.
    pub fn set_priority(&self, priority: Priority) {
        let mut inner = self.shared.inner.lock();
        if inner.state != TaskState::Running || inner.priority == priority {
            return;
        }
        inner.priority = priority;
        if let Some(target) = &inner.target {
            target.update_priority(self.shared.id, priority);
        }
    }

    /// Cancels the task.
    ///
    /// The completion callback will not be invoked. Work shared with other
    /// tasks keeps running for them. Calling it again, or after completion,
    /// does nothing.
    pub fn cancel(&self) {
        let target = {
            let mut inner = self.shared.inner.lock();
            if inner.state != TaskState::Running {
                return;
            }
            inner.state = TaskState::Cancelled;
            inner.target.take()
        };

        drop(self.shared.completion.lock().take());
        debug!(task = %self.shared.id, locator = %self.shared.locator, "Task cancelled");

        if let Some(target) = target {
            target.detach(self.shared.id);
        }
    }

    /// Progress sink to hand to the terminal unit.
    pub(crate) fn progress_sink(&self) -> Option<ProgressSink> {
        self.shared.progress.as_ref()?;
        let weak: Weak<TaskShared> = Arc::downgrade(&self.shared);
        Some(Arc::new(move |progress: Progress| {
            if let Some(shared) = weak.upgrade() {
                shared.on_progress(progress);
            }
        }))
    }

    /// Records the unit this task is attached to.
    pub(crate) fn attach(&self, target: Arc<dyn Dependency>) {
        {
            let mut inner = self.shared.inner.lock();
            if inner.state == TaskState::Running {
                inner.target = Some(target);
                return;
            }
        }
        target.detach(self.shared.id);
    }

    /// Delivers the task's result. Ignored once the task finished.
    pub(crate) fn finish(&self, result: TaskResult) {
        {
            let mut inner = self.shared.inner.lock();
            if inner.state != TaskState::Running {
                return;
            }
            inner.state = TaskState::Completed;
            inner.target = None;
        }

        let callback = self.shared.completion.lock().take();
        if let Some(callback) = callback {
            callback(result);
        }
    }
}

impl fmt::Debug for ImageTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("ImageTask")
            .field("id", &self.shared.id)
            .field("locator", &self.shared.locator)
            .field("priority", &inner.priority)
            .field("state", &inner.state)
            .finish()
    }
}

/// Cancels a task when dropped, unless disarmed.
pub(crate) struct CancelOnDrop(Option<ImageTask>);

impl CancelOnDrop {
    pub fn new(task: ImageTask) -> Self {
        Self(Some(task))
    }

    pub fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(task) = self.0.take() {
            task.cancel();
        }
    }
}
