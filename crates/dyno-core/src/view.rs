//! The operator-facing contract: whatever displays the rig and collects
//! setpoints implements [`View`].

use crate::control_loop::ExecutionStats;
use crate::device::PollCounts;
use crate::rig::RigStatus;
use crate::sync::{Authority, Setpoints};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

/// 30 FPS.
pub const VIEW_REFRESH: std::time::Duration = std::time::Duration::from_millis(33);

#[derive(Debug, Clone, Serialize)]
pub struct RecordingInfo {
    pub path: PathBuf,
    pub rows: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DevicePoll {
    pub device: &'static str,
    #[serde(flatten)]
    pub counts: PollCounts,
}

/// Everything a view renders in one refresh.
#[derive(Debug, Clone, Serialize)]
pub struct RigSnapshot {
    #[serde(flatten)]
    pub status: RigStatus,
    pub setpoints: Setpoints,
    pub authority: Authority,
    pub recording: Option<RecordingInfo>,
    pub experiment: Option<String>,
    pub tasks: Vec<String>,
    pub polls: Vec<DevicePoll>,
    pub control: ExecutionStats,
}

/// Operator actions that are not plain setpoint changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorCommand {
    StartRecording,
    StopRecording,
    StartExperiment,
    StopExperiment,
    StopAll,
}

impl OperatorCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartRecording => "start_recording",
            Self::StopRecording => "stop_recording",
            Self::StartExperiment => "start_experiment",
            Self::StopExperiment => "stop_experiment",
            Self::StopAll => "stop_all",
        }
    }
}

pub trait View: Send + Sync {
    /// Setpoints currently chosen by the operator.
    fn setpoints(&self) -> Setpoints;

    /// Experiment file name chosen by the operator, if any.
    fn selected_experiment(&self) -> Option<String>;

    fn render(&self, snapshot: &RigSnapshot);
}

#[derive(Debug, Default)]
struct HeadlessState {
    setpoints: Setpoints,
    selected: Option<String>,
    last: Option<RigSnapshot>,
    renders: u64,
}

/// In-process view without a display, driven from code.
#[derive(Debug, Default)]
pub struct HeadlessView {
    state: Mutex<HeadlessState>,
}

impl HeadlessView {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, HeadlessState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_setpoints(&self, setpoints: Setpoints) {
        self.state().setpoints = setpoints;
    }

    pub fn select_experiment(&self, name: Option<String>) {
        self.state().selected = name;
    }

    pub fn last_snapshot(&self) -> Option<RigSnapshot> {
        self.state().last.clone()
    }

    pub fn render_count(&self) -> u64 {
        self.state().renders
    }
}

impl View for HeadlessView {
    fn setpoints(&self) -> Setpoints {
        self.state().setpoints
    }

    fn selected_experiment(&self) -> Option<String> {
        self.state().selected.clone()
    }

    fn render(&self, snapshot: &RigSnapshot) {
        let mut state = self.state();
        state.last = Some(snapshot.clone());
        state.renders += 1;
    }
}
