//! Named worker threads with cooperative, bounded-latency stop.
//!
//! Every loop in the engine (device polling, setpoint control, recording,
//! experiments, view refresh) runs as a task owned by a [`TaskSupervisor`].
//! A task body receives a [`StopToken`]; the supervisor checks it once per
//! iteration and every throttle sleep wakes as soon as a stop is requested.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
struct StopSignal {
    requested: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
}

/// Cloneable stop flag with an interruptible sleep.
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    signal: Arc<StopSignal>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_stop_requested(&self) -> bool {
        self.signal.requested.load(Ordering::Acquire)
    }

    pub fn request_stop(&self) {
        self.signal.requested.store(true, Ordering::Release);
        let _guard = self.signal.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.signal.wake.notify_all();
    }

    /// Sleeps up to `duration`, returning early once a stop is requested.
    /// Returns whether a stop was requested.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut guard = self.signal.lock.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if self.is_stop_requested() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = self
                .signal
                .wake
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Continuous,
    Once,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    /// Ended because a stop was requested.
    Stopped,
    /// One-shot body returned successfully.
    Completed,
    Failed(String),
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Error returned by a task body.
///
/// Anything implementing `std::error::Error` converts into it, so bodies can
/// use `?` on the engine's own error types.
#[derive(Debug)]
pub struct TaskFailure {
    message: String,
}

impl TaskFailure {
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl<E: std::error::Error> From<E> for TaskFailure {
    fn from(err: E) -> Self {
        Self::msg(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task '{0}' is already running")]
    Duplicate(String),
    #[error("failed to spawn task '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Emitted to the supervisor's listener when something goes wrong in a task.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// A continuous body returned an error; the task keeps running.
    IterationFailed { task: String, error: String },
    /// The task ended in [`TaskStatus::Failed`].
    Terminated { task: String, reason: String },
}

type Listener = Arc<dyn Fn(&TaskEvent) + Send + Sync>;

#[derive(Debug)]
struct TaskShared {
    name: String,
    kind: TaskKind,
    stop: StopToken,
    status: Mutex<TaskStatus>,
    failures: AtomicU64,
    iterations: AtomicU64,
    finished: AtomicBool,
}

impl TaskShared {
    fn status(&self) -> MutexGuard<'_, TaskStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self, status: TaskStatus) {
        *self.status() = status;
        self.finished.store(true, Ordering::Release);
    }
}

/// Shared view of one task. Clones refer to the same thread.
#[derive(Clone)]
pub struct TaskHandle {
    shared: Arc<TaskShared>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.shared.name)
            .field("kind", &self.shared.kind)
            .field("status", &self.status())
            .finish()
    }
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn kind(&self) -> TaskKind {
        self.shared.kind
    }

    pub fn status(&self) -> TaskStatus {
        self.shared.status().clone()
    }

    /// Body errors that did not end the task.
    pub fn failures(&self) -> u64 {
        self.shared.failures.load(Ordering::Relaxed)
    }

    pub fn iterations(&self) -> u64 {
        self.shared.iterations.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::Acquire)
    }

    pub fn request_stop(&self) {
        self.shared.stop.request_stop();
    }

    /// Waits for the thread to exit and returns its final status.
    pub fn join(&self) -> TaskStatus {
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                // Panics are caught inside the thread; this only fires if
                // the bookkeeping itself panicked.
                self.shared
                    .finish(TaskStatus::Failed("task thread panicked".to_string()));
            }
        }
        self.status()
    }
}

/// Owns the set of active tasks. Names are unique among running tasks.
pub struct TaskSupervisor {
    tasks: Mutex<HashMap<String, TaskHandle>>,
    listener: Option<Listener>,
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            listener: None,
        }
    }

    pub fn with_listener(listener: impl Fn(&TaskEvent) + Send + Sync + 'static) -> Self {
        let listener: Listener = Arc::new(listener);
        Self {
            tasks: Mutex::new(HashMap::new()),
            listener: Some(listener),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<String, TaskHandle>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `body` repeatedly, sleeping `period` after each iteration, until
    /// a stop is requested.
    pub fn start_continuous<F>(
        &self,
        name: &str,
        period: Duration,
        mut body: F,
    ) -> Result<TaskHandle, TaskError>
    where
        F: FnMut(&StopToken) -> Result<(), TaskFailure> + Send + 'static,
    {
        let listener = self.listener.clone();
        self.spawn(name, TaskKind::Continuous, move |shared| {
            let stop = &shared.stop;
            while !stop.is_stop_requested() {
                match catch_unwind(AssertUnwindSafe(|| body(stop))) {
                    Ok(Ok(())) => {}
                    Ok(Err(failure)) => {
                        shared.failures.fetch_add(1, Ordering::Relaxed);
                        warn!(task = %shared.name, error = %failure, "Task iteration failed");
                        notify(
                            &listener,
                            TaskEvent::IterationFailed {
                                task: shared.name.clone(),
                                error: failure.to_string(),
                            },
                        );
                    }
                    Err(payload) => return TaskStatus::Failed(panic_message(payload)),
                }
                shared.iterations.fetch_add(1, Ordering::Relaxed);
                if stop.sleep(period) {
                    break;
                }
            }
            TaskStatus::Stopped
        })
    }

    /// Runs `body` exactly once.
    pub fn start_once<F>(&self, name: &str, body: F) -> Result<TaskHandle, TaskError>
    where
        F: FnOnce(&StopToken) -> Result<(), TaskFailure> + Send + 'static,
    {
        self.spawn(name, TaskKind::Once, move |shared| {
            let result = catch_unwind(AssertUnwindSafe(|| body(&shared.stop)));
            shared.iterations.fetch_add(1, Ordering::Relaxed);
            match result {
                Ok(Ok(())) if shared.stop.is_stop_requested() => TaskStatus::Stopped,
                Ok(Ok(())) => TaskStatus::Completed,
                Ok(Err(failure)) => TaskStatus::Failed(failure.to_string()),
                Err(payload) => TaskStatus::Failed(panic_message(payload)),
            }
        })
    }

    fn spawn<F>(&self, name: &str, kind: TaskKind, run: F) -> Result<TaskHandle, TaskError>
    where
        F: FnOnce(&TaskShared) -> TaskStatus + Send + 'static,
    {
        let mut tasks = self.tasks();
        if tasks.get(name).is_some_and(|task| !task.is_finished()) {
            return Err(TaskError::Duplicate(name.to_string()));
        }

        let shared = Arc::new(TaskShared {
            name: name.to_string(),
            kind,
            stop: StopToken::new(),
            status: Mutex::new(TaskStatus::Running),
            failures: AtomicU64::new(0),
            iterations: AtomicU64::new(0),
            finished: AtomicBool::new(false),
        });

        let listener = self.listener.clone();
        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let shared = thread_shared;
                let status = run(&shared);
                match &status {
                    TaskStatus::Failed(reason) => {
                        error!(task = %shared.name, reason = %reason, "Task failed");
                        notify(
                            &listener,
                            TaskEvent::Terminated {
                                task: shared.name.clone(),
                                reason: reason.clone(),
                            },
                        );
                    }
                    other => debug!(task = %shared.name, status = ?other, "Task ended"),
                }
                shared.finish(status);
            })
            .map_err(|source| TaskError::Spawn {
                name: name.to_string(),
                source,
            })?;

        let handle = TaskHandle {
            shared,
            thread: Arc::new(Mutex::new(Some(thread))),
        };
        tasks.insert(name.to_string(), handle.clone());
        info!(task = name, kind = ?kind, "Task started");
        Ok(handle)
    }

    /// Requests a stop and forgets the task. Returns false if no task with
    /// that name was running.
    pub fn stop(&self, name: &str) -> bool {
        match self.tasks().remove(name) {
            Some(task) => {
                task.request_stop();
                info!(task = name, "Task stop requested");
                !task.is_finished()
            }
            None => false,
        }
    }

    /// Signals every tracked task and clears the set without waiting.
    pub fn stop_all(&self) -> Vec<TaskHandle> {
        let drained: Vec<TaskHandle> = self.tasks().drain().map(|(_, task)| task).collect();
        for task in &drained {
            task.request_stop();
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "All tasks signalled to stop");
        }
        drained
    }

    pub fn handle(&self, name: &str) -> Option<TaskHandle> {
        self.tasks().get(name).cloned()
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.tasks().get(name).is_some_and(|task| !task.is_finished())
    }

    pub fn active_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tasks()
            .values()
            .filter(|task| !task.is_finished())
            .map(|task| task.name().to_string())
            .collect();
        names.sort();
        names
    }
}

fn notify(listener: &Option<Listener>, event: TaskEvent) {
    if let Some(listener) = listener {
        listener(&event);
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {msg}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn stop_token_sleep_wakes_on_request() {
        let token = StopToken::new();
        let remote = token.clone();
        let waker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.request_stop();
        });
        let started = Instant::now();
        assert!(token.sleep(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(5));
        waker.join().unwrap();
    }

    #[test]
    fn stop_token_sleep_runs_full_duration_otherwise() {
        let token = StopToken::new();
        let started = Instant::now();
        assert!(!token.sleep(Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn continuous_stop_takes_effect_within_one_period() {
        let supervisor = TaskSupervisor::new();
        let period = Duration::from_millis(500);
        let handle = supervisor
            .start_continuous("poll", period, |_| Ok(()))
            .unwrap();
        wait_until(|| handle.iterations() >= 1);

        let requested = Instant::now();
        assert!(supervisor.stop("poll"));
        assert_eq!(handle.join(), TaskStatus::Stopped);
        assert!(requested.elapsed() < period);
        assert!(!supervisor.is_active("poll"));
    }

    #[test]
    fn duplicate_names_are_rejected_while_running() {
        let supervisor = TaskSupervisor::new();
        let first = supervisor
            .start_continuous("recorder", Duration::from_millis(25), |_| Ok(()))
            .unwrap();
        let second = supervisor.start_continuous("recorder", Duration::from_millis(25), |_| Ok(()));
        assert!(matches!(second, Err(TaskError::Duplicate(name)) if name == "recorder"));

        supervisor.stop("recorder");
        first.join();
        let third = supervisor
            .start_continuous("recorder", Duration::from_millis(25), |_| Ok(()))
            .unwrap();
        supervisor.stop_all();
        third.join();
    }

    #[test]
    fn iteration_errors_are_counted_and_the_loop_continues() {
        let events = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&events);
        let supervisor = TaskSupervisor::with_listener(move |event| {
            if matches!(event, TaskEvent::IterationFailed { .. }) {
                seen.fetch_add(1, Ordering::Relaxed);
            }
        });
        let mut count = 0u32;
        let handle = supervisor
            .start_continuous("flaky", Duration::from_millis(1), move |_| {
                count += 1;
                if count % 2 == 0 {
                    Err(TaskFailure::msg("even iteration"))
                } else {
                    Ok(())
                }
            })
            .unwrap();
        wait_until(|| handle.iterations() >= 6);
        supervisor.stop_all();
        assert_eq!(handle.join(), TaskStatus::Stopped);
        assert!(handle.failures() >= 3);
        assert_eq!(events.load(Ordering::Relaxed) as u64, handle.failures());
    }

    #[test]
    fn panic_terminates_only_that_task() {
        let supervisor = TaskSupervisor::new();
        let healthy = supervisor
            .start_continuous("healthy", Duration::from_millis(1), |_| Ok(()))
            .unwrap();
        let broken = supervisor
            .start_continuous("broken", Duration::from_millis(1), |_| -> Result<(), TaskFailure> {
                panic!("boom")
            })
            .unwrap();

        match broken.join() {
            TaskStatus::Failed(reason) => assert!(reason.contains("boom")),
            other => panic!("unexpected status {other:?}"),
        }
        let before = healthy.iterations();
        wait_until(|| healthy.iterations() > before);
        assert_eq!(healthy.status(), TaskStatus::Running);
        assert_eq!(supervisor.active_names(), vec!["healthy".to_string()]);
        supervisor.stop_all();
        healthy.join();
    }

    #[test]
    fn once_task_captures_its_result() {
        let supervisor = TaskSupervisor::new();
        let ok = supervisor.start_once("ok", |_| Ok(())).unwrap();
        assert_eq!(ok.join(), TaskStatus::Completed);
        assert_eq!(ok.kind(), TaskKind::Once);

        let failed = supervisor
            .start_once("bad", |_| Err(TaskFailure::msg("script error")))
            .unwrap();
        assert_eq!(failed.join(), TaskStatus::Failed("script error".to_string()));
    }

    #[test]
    fn once_task_observing_stop_reports_stopped() {
        let supervisor = TaskSupervisor::new();
        let handle = supervisor
            .start_once("experiment", |stop| {
                stop.sleep(Duration::from_secs(30));
                Ok(())
            })
            .unwrap();
        supervisor.stop("experiment");
        assert_eq!(handle.join(), TaskStatus::Stopped);
    }
}
