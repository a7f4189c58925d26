//! Wires the rig, setpoint exchange, recorder and experiment runner into the
//! standard task set and exposes the operator actions.

use crate::bus::BusError;
use crate::control_loop::{ControlConfig, ControlLoop, ControlStats, TASK_PERIOD};
use crate::device::Device;
use crate::experiment::{list_experiments, ExperimentRunner, ExperimentScript, ScriptError};
use crate::limits::{Command, CommandLimits, CommandViolation};
use crate::recorder::{Recorder, RecorderError};
use crate::rig::Rig;
use crate::supervisor::{TaskError, TaskFailure, TaskHandle, TaskSupervisor};
use crate::sync::{Authority, SetpointExchange, Setpoints};
use crate::view::{DevicePoll, RecordingInfo, RigSnapshot, View};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

pub const TASK_POLL_MUT: &str = "poll:mut";
pub const TASK_POLL_LOAD: &str = "poll:load";
pub const TASK_POLL_TORQUE: &str = "poll:torque";
pub const TASK_CONTROL: &str = "control";
pub const TASK_RECORDER: &str = "recorder";
pub const TASK_EXPERIMENT: &str = "experiment";
pub const TASK_VIEW: &str = "view";

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error(transparent)]
    Recorder(#[from] RecorderError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("setpoint rejected: {}", .0.as_str())]
    Rejected(CommandViolation),
    #[error("an experiment holds setpoint authority")]
    AuthorityHeld,
    #[error("experiment already running")]
    ExperimentRunning,
    #[error("no experiment selected")]
    NoExperimentSelected,
}

/// Notable operator-level events, for journals and metrics.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    RecordingStarted { path: PathBuf },
    RecordingStopped { path: PathBuf, rows: u64 },
    ExperimentStarted { name: String },
    ExperimentFinished { name: String, outcome: String },
    CommandRejected { source: &'static str, reason: &'static str },
}

pub type EventSink = Box<dyn Fn(&ControllerEvent) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub control: ControlConfig,
    pub poll_period: Duration,
    pub recordings_dir: PathBuf,
    pub experiments_dir: PathBuf,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            control: ControlConfig::default(),
            poll_period: TASK_PERIOD,
            recordings_dir: PathBuf::from("experimental_results"),
            experiments_dir: PathBuf::from("experiments"),
        }
    }
}

#[derive(Default)]
struct RecordingState {
    path: Option<PathBuf>,
    rows: Arc<AtomicU64>,
}

struct Inner {
    rig: Arc<Rig>,
    exchange: Arc<SetpointExchange>,
    supervisor: TaskSupervisor,
    config: ControllerConfig,
    control_stats: Mutex<Option<Arc<ControlStats>>>,
    recording: Mutex<RecordingState>,
    experiment: Mutex<Option<String>>,
    events: Option<EventSink>,
}

impl Inner {
    fn emit(&self, event: ControllerEvent) {
        if let Some(events) = &self.events {
            events(&event);
        }
    }

    fn limits(&self) -> &CommandLimits {
        &self.config.control.limits
    }

    fn set_manual(&self, setpoints: Setpoints, source: &'static str) -> Result<(), ControllerError> {
        let command = Command::new(setpoints)
            .validate(self.limits())
            .map_err(|violation| {
                warn!(source, reason = violation.as_str(), "Manual setpoint rejected");
                self.emit(ControllerEvent::CommandRejected {
                    source,
                    reason: violation.as_str(),
                });
                ControllerError::Rejected(violation)
            })?;
        if self.exchange.set_manual(command.setpoints()) {
            Ok(())
        } else {
            Err(ControllerError::AuthorityHeld)
        }
    }

    fn snapshot(&self) -> RigSnapshot {
        let recording = if self.supervisor.is_active(TASK_RECORDER) {
            let state = lock(&self.recording);
            state.path.clone().map(|path| RecordingInfo {
                path,
                rows: state.rows.load(Ordering::Relaxed),
            })
        } else {
            None
        };
        let control = lock(&self.control_stats)
            .as_ref()
            .map(|stats| stats.snapshot())
            .unwrap_or_default();

        RigSnapshot {
            status: self.rig.status(),
            setpoints: self.exchange.active(),
            authority: self.exchange.authority(),
            recording,
            experiment: lock(&self.experiment).clone(),
            tasks: self.supervisor.active_names(),
            polls: self
                .rig
                .devices()
                .into_iter()
                .map(|device| DevicePoll {
                    device: device.name(),
                    counts: device.poll_counts(),
                })
                .collect(),
            control,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The presenter: owns the rig and every task that touches it.
///
/// Clones share the same rig and tasks.
#[derive(Clone)]
pub struct DynoController {
    inner: Arc<Inner>,
}

impl DynoController {
    pub fn new(rig: Arc<Rig>, config: ControllerConfig) -> Self {
        Self::with_supervisor(rig, config, TaskSupervisor::new(), None)
    }

    pub fn with_supervisor(
        rig: Arc<Rig>,
        config: ControllerConfig,
        supervisor: TaskSupervisor,
        events: Option<EventSink>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                rig,
                exchange: Arc::new(SetpointExchange::new()),
                supervisor,
                config,
                control_stats: Mutex::new(None),
                recording: Mutex::new(RecordingState::default()),
                experiment: Mutex::new(None),
                events,
            }),
        }
    }

    pub fn rig(&self) -> &Arc<Rig> {
        &self.inner.rig
    }

    pub fn supervisor(&self) -> &TaskSupervisor {
        &self.inner.supervisor
    }

    pub fn authority(&self) -> Authority {
        self.inner.exchange.authority()
    }

    /// Starts the three poll tasks and the control task.
    pub fn start_monitoring(&self) -> Result<(), ControllerError> {
        let period = self.inner.config.poll_period;
        let supervisor = &self.inner.supervisor;

        let rig = Arc::clone(&self.inner.rig);
        supervisor.start_continuous(TASK_POLL_MUT, period, move |_| {
            rig.mut_motor().update_status()?;
            Ok(())
        })?;
        let rig = Arc::clone(&self.inner.rig);
        supervisor.start_continuous(TASK_POLL_LOAD, period, move |_| {
            rig.load_motor().update_status()?;
            Ok(())
        })?;
        let rig = Arc::clone(&self.inner.rig);
        supervisor.start_continuous(TASK_POLL_TORQUE, period, move |_| {
            rig.transducer().update_status()?;
            Ok(())
        })?;

        let mut control = ControlLoop::new(
            Arc::clone(&self.inner.rig),
            Arc::clone(&self.inner.exchange),
            self.inner.config.control.clone(),
        );
        *lock(&self.inner.control_stats) = Some(control.stats());
        supervisor.start_continuous(TASK_CONTROL, control.period(), move |_| {
            control.cycle()?;
            Ok(())
        })?;

        info!(poll_period_ms = period.as_millis() as u64, "Monitoring started");
        Ok(())
    }

    /// Operator setpoints. Rejected outside the command limits or while an
    /// experiment holds authority.
    pub fn set_manual_setpoints(&self, setpoints: Setpoints) -> Result<(), ControllerError> {
        self.inner.set_manual(setpoints, "operator")
    }

    pub fn is_recording(&self) -> bool {
        self.inner.supervisor.is_active(TASK_RECORDER)
    }

    /// Opens a new telemetry log and starts the `recorder` task.
    pub fn start_recording(&self) -> Result<PathBuf, ControllerError> {
        // Held until the task is registered so that only one log is ever opened.
        let mut state = lock(&self.inner.recording);
        if self.is_recording() {
            return Err(TaskError::Duplicate(TASK_RECORDER.to_string()).into());
        }
        let mut recorder = Recorder::new(&self.inner.config.recordings_dir);
        let path = recorder.open(&self.inner.rig.status())?;
        let rows = Arc::new(AtomicU64::new(0));

        let rig = Arc::clone(&self.inner.rig);
        let counter = Arc::clone(&rows);
        self.inner.supervisor.start_continuous(
            TASK_RECORDER,
            self.inner.config.poll_period,
            move |_| -> Result<(), TaskFailure> {
                recorder.record(&rig.status())?;
                counter.store(recorder.rows(), Ordering::Relaxed);
                Ok(())
            },
        )?;

        *state = RecordingState {
            path: Some(path.clone()),
            rows,
        };
        drop(state);
        self.inner
            .emit(ControllerEvent::RecordingStarted { path: path.clone() });
        Ok(path)
    }

    /// Stops the `recorder` task and waits for the log to be closed.
    pub fn stop_recording(&self) -> bool {
        let Some(handle) = self.inner.supervisor.handle(TASK_RECORDER) else {
            return false;
        };
        let was_running = self.inner.supervisor.stop(TASK_RECORDER);
        handle.join();
        if was_running {
            let state = lock(&self.inner.recording);
            if let Some(path) = state.path.clone() {
                self.inner.emit(ControllerEvent::RecordingStopped {
                    path,
                    rows: state.rows.load(Ordering::Relaxed),
                });
            }
        }
        was_running
    }

    pub fn list_experiments(&self) -> Result<Vec<String>, ControllerError> {
        Ok(list_experiments(&self.inner.config.experiments_dir)?)
    }

    pub fn running_experiment(&self) -> Option<String> {
        lock(&self.inner.experiment).clone()
    }

    /// Loads `name` from the experiments directory and runs it as the
    /// one-shot `experiment` task. Recording is started if it is not
    /// already running. Manual control resumes, zeroed, when it ends.
    pub fn start_experiment(&self, name: &str) -> Result<TaskHandle, ControllerError> {
        let inner = &self.inner;
        if inner.supervisor.is_active(TASK_EXPERIMENT) {
            return Err(ControllerError::ExperimentRunning);
        }
        let script = ExperimentScript::from_path(&inner.config.experiments_dir.join(name))?;

        if !inner.exchange.claim_experiment() {
            return Err(ControllerError::ExperimentRunning);
        }
        if !self.is_recording() {
            if let Err(e) = self.start_recording() {
                inner.exchange.release_to_manual();
                return Err(e);
            }
        }
        *lock(&inner.experiment) = Some(script.name.clone());

        inner.emit(ControllerEvent::ExperimentStarted {
            name: script.name.clone(),
        });
        let task_inner = Arc::clone(inner);
        let mut runner = ExperimentRunner::new(script);
        let started = inner.supervisor.start_once(TASK_EXPERIMENT, move |stop| {
            let result = runner.run(&*task_inner.exchange, stop);
            task_inner.exchange.release_to_manual();
            *lock(&task_inner.experiment) = None;

            let name = runner.script().name.clone();
            let outcome = match &result {
                Ok(state) => format!("{state:?}").to_lowercase(),
                Err(e) => e.to_string(),
            };
            task_inner.emit(ControllerEvent::ExperimentFinished { name, outcome });
            result?;
            Ok(())
        });

        match started {
            Ok(handle) => Ok(handle),
            Err(e) => {
                inner.exchange.release_to_manual();
                *lock(&inner.experiment) = None;
                Err(e.into())
            }
        }
    }

    /// Starts the experiment the view has selected.
    pub fn start_selected_experiment(&self, view: &dyn View) -> Result<TaskHandle, ControllerError> {
        let name = view
            .selected_experiment()
            .ok_or(ControllerError::NoExperimentSelected)?;
        self.start_experiment(&name)
    }

    /// Stops the running experiment and waits for it to zero both setpoints
    /// and hand authority back to manual control.
    pub fn stop_experiment(&self) -> bool {
        let Some(handle) = self.inner.supervisor.handle(TASK_EXPERIMENT) else {
            return false;
        };
        let was_running = self.inner.supervisor.stop(TASK_EXPERIMENT);
        handle.join();
        was_running
    }

    /// Stops every task, returns authority to manual control and commands
    /// both motors to zero.
    pub fn stop_all(&self) {
        let recording = self.is_recording();
        for handle in self.inner.supervisor.stop_all() {
            handle.join();
        }
        self.inner.exchange.release_to_manual();
        *lock(&self.inner.experiment) = None;
        if recording {
            let state = lock(&self.inner.recording);
            if let Some(path) = state.path.clone() {
                self.inner.emit(ControllerEvent::RecordingStopped {
                    path,
                    rows: state.rows.load(Ordering::Relaxed),
                });
            }
        }
        if let Err(e) = self.inner.rig.apply(Setpoints::ZERO) {
            warn!(error = %e, "Failed to zero setpoints on stop");
        }
        info!("All tasks stopped");
    }

    pub fn snapshot(&self) -> RigSnapshot {
        self.inner.snapshot()
    }

    /// Renders the rig to `view` every `refresh` and forwards changes of
    /// the view's setpoints to manual control.
    pub fn attach_view(
        &self,
        view: Arc<dyn View>,
        refresh: Duration,
    ) -> Result<TaskHandle, ControllerError> {
        let inner = Arc::clone(&self.inner);
        let mut forwarded: Option<Setpoints> = None;
        let handle = self.inner.supervisor.start_continuous(TASK_VIEW, refresh, move |_| {
            let desired = view.setpoints();
            if forwarded != Some(desired) {
                forwarded = Some(desired);
                match inner.set_manual(desired, "view") {
                    Ok(()) | Err(ControllerError::Rejected(_)) => {}
                    Err(e) => info!(reason = %e, "View setpoints ignored"),
                }
            }
            view.render(&inner.snapshot());
            Ok(())
        })?;
        Ok(handle)
    }

    /// Stops everything and closes the bus.
    pub fn shutdown(&self) -> Result<(), ControllerError> {
        self.stop_all();
        self.inner.rig.close()?;
        info!("Controller shut down");
        Ok(())
    }
}
