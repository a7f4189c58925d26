//! Scripted ramp/hold experiments.
//!
//! A script is a JSON document `{"steps": [...]}`. Each step drives the
//! motor under test (`MUT`) and the load motor (`load_motor`) at once,
//! either ramping linearly over 100 sub-steps or holding a fixed value.

use crate::bus::BusError;
use crate::rig::Rig;
use crate::supervisor::StopToken;
use crate::sync::SetpointExchange;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const RAMP_SUBSTEPS: u32 = 100;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("experiment is not a JSON object with a 'steps' list: {0}")]
    Document(#[source] serde_json::Error),
    #[error("step {index}: {reason}")]
    Step { index: usize, reason: String },
    #[error("step {index}: duration {duration} must be finite and non-negative")]
    InvalidDuration { index: usize, duration: f64 },
}

/// Device property a target drives. Only `current` on the motor under test
/// and `rpm` on the load motor are ever commanded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Property {
    Current,
    Rpm,
    Other(String),
}

impl Property {
    fn parse(raw: &str) -> Self {
        match raw {
            "current" => Self::Current,
            "rpm" => Self::Rpm,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Current => f.write_str("current"),
            Self::Rpm => f.write_str("rpm"),
            Self::Other(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RampTarget {
    pub property: Property,
    pub start: f64,
    pub end: f64,
}

impl RampTarget {
    pub fn value_at(&self, substep: u32) -> f64 {
        ramp_value(self.start, self.end, substep)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HoldTarget {
    pub property: Property,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExperimentStep {
    Ramp {
        duration: Duration,
        mut_motor: RampTarget,
        load_motor: RampTarget,
    },
    Hold {
        duration: Duration,
        mut_motor: HoldTarget,
        load_motor: HoldTarget,
    },
}

impl ExperimentStep {
    pub fn duration(&self) -> Duration {
        match self {
            Self::Ramp { duration, .. } | Self::Hold { duration, .. } => *duration,
        }
    }

    fn action(&self) -> &'static str {
        match self {
            Self::Ramp { .. } => "ramp",
            Self::Hold { .. } => "hold",
        }
    }
}

/// Value commanded at ramp sub-step `substep` (0-based). The last sub-step
/// stops one increment short of `end`.
pub fn ramp_value(start: f64, end: f64, substep: u32) -> f64 {
    start + f64::from(substep) * (end - start) / f64::from(RAMP_SUBSTEPS)
}

#[derive(Deserialize)]
struct RawScript {
    steps: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum RawStep {
    Ramp {
        duration: f64,
        #[serde(rename = "MUT")]
        mut_motor: RawRamp,
        load_motor: RawRamp,
    },
    Hold {
        duration: f64,
        #[serde(rename = "MUT")]
        mut_motor: RawHold,
        load_motor: RawHold,
    },
}

#[derive(Deserialize)]
struct RawRamp {
    property: String,
    start: f64,
    end: f64,
}

#[derive(Deserialize)]
struct RawHold {
    property: String,
    value: f64,
}

fn parse_duration(index: usize, seconds: f64) -> Result<Duration, ScriptError> {
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(ScriptError::InvalidDuration {
            index,
            duration: seconds,
        });
    }
    Ok(Duration::from_secs_f64(seconds))
}

fn check_property(index: usize, device: &str, property: &Property, supported: &Property) {
    if property != supported {
        warn!(
            step = index,
            device,
            property = %property,
            "Unsupported experiment property will be ignored"
        );
    }
}

fn parse_step(index: usize, value: serde_json::Value) -> Result<ExperimentStep, ScriptError> {
    let raw: RawStep = serde_json::from_value(value).map_err(|e| ScriptError::Step {
        index,
        reason: e.to_string(),
    })?;

    let step = match raw {
        RawStep::Ramp {
            duration,
            mut_motor,
            load_motor,
        } => ExperimentStep::Ramp {
            duration: parse_duration(index, duration)?,
            mut_motor: RampTarget {
                property: Property::parse(&mut_motor.property),
                start: mut_motor.start,
                end: mut_motor.end,
            },
            load_motor: RampTarget {
                property: Property::parse(&load_motor.property),
                start: load_motor.start,
                end: load_motor.end,
            },
        },
        RawStep::Hold {
            duration,
            mut_motor,
            load_motor,
        } => ExperimentStep::Hold {
            duration: parse_duration(index, duration)?,
            mut_motor: HoldTarget {
                property: Property::parse(&mut_motor.property),
                value: mut_motor.value,
            },
            load_motor: HoldTarget {
                property: Property::parse(&load_motor.property),
                value: load_motor.value,
            },
        },
    };

    let (mut_property, load_property) = match &step {
        ExperimentStep::Ramp {
            mut_motor,
            load_motor,
            ..
        } => (&mut_motor.property, &load_motor.property),
        ExperimentStep::Hold {
            mut_motor,
            load_motor,
            ..
        } => (&mut_motor.property, &load_motor.property),
    };
    check_property(index, "MUT", mut_property, &Property::Current);
    check_property(index, "load_motor", load_property, &Property::Rpm);

    Ok(step)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentScript {
    pub name: String,
    pub steps: Vec<ExperimentStep>,
}

impl ExperimentScript {
    pub fn from_json_str(name: &str, json: &str) -> Result<Self, ScriptError> {
        let raw: RawScript = serde_json::from_str(json).map_err(ScriptError::Document)?;
        let steps = raw
            .steps
            .into_iter()
            .enumerate()
            .map(|(index, value)| parse_step(index, value))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            name: name.to_string(),
            steps,
        })
    }

    pub fn from_path(path: &Path) -> Result<Self, ScriptError> {
        let json = std::fs::read_to_string(path).map_err(|source| ScriptError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::from_json_str(&name, &json)
    }

    pub fn total_duration(&self) -> Duration {
        self.steps.iter().map(ExperimentStep::duration).sum()
    }
}

/// Names of the regular files in `dir`, sorted.
pub fn list_experiments(dir: &Path) -> Result<Vec<String>, ScriptError> {
    let io_err = |source: std::io::Error| ScriptError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if path.is_file() {
            if let Some(name) = path.file_name() {
                names.push(name.to_string_lossy().into_owned());
            }
        }
    }
    names.sort();
    Ok(names)
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("experiment no longer holds setpoint authority")]
    AuthorityLost,
}

/// Where an experiment sends its setpoints.
pub trait SetpointSink: Send + Sync {
    fn set_mut_current(&self, amps: f64) -> Result<(), SinkError>;
    fn set_load_rpm(&self, rpm: f64) -> Result<(), SinkError>;
}

/// Commands the devices directly.
impl SetpointSink for Rig {
    fn set_mut_current(&self, amps: f64) -> Result<(), SinkError> {
        Ok(self.mut_motor().set_current(amps)?)
    }

    fn set_load_rpm(&self, rpm: f64) -> Result<(), SinkError> {
        Ok(self.load_motor().set_rpm(rpm)?)
    }
}

/// Writes the experiment side of the exchange; the control task forwards
/// it to the devices.
impl SetpointSink for SetpointExchange {
    fn set_mut_current(&self, amps: f64) -> Result<(), SinkError> {
        if self.set_scripted_current(amps) {
            Ok(())
        } else {
            Err(SinkError::AuthorityLost)
        }
    }

    fn set_load_rpm(&self, rpm: f64) -> Result<(), SinkError> {
        if self.set_scripted_rpm(rpm) {
            Ok(())
        } else {
            Err(SinkError::AuthorityLost)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Stopped,
    Failed,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("experiment '{0}' has already been run")]
    AlreadyStarted(String),
    #[error("experiment '{name}' aborted at step {step}: {source}")]
    Sink {
        name: String,
        step: usize,
        #[source]
        source: SinkError,
    },
}

pub struct ExperimentRunner {
    script: ExperimentScript,
    state: RunState,
}

impl ExperimentRunner {
    pub fn new(script: ExperimentScript) -> Self {
        Self {
            script,
            state: RunState::Idle,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn script(&self) -> &ExperimentScript {
        &self.script
    }

    /// Executes every step in order, then zeroes both setpoints. Returns
    /// the terminal state, `Completed` or `Stopped`.
    pub fn run(&mut self, sink: &dyn SetpointSink, stop: &StopToken) -> Result<RunState, RunError> {
        if self.state != RunState::Idle {
            return Err(RunError::AlreadyStarted(self.script.name.clone()));
        }
        self.state = RunState::Running;
        info!(
            experiment = %self.script.name,
            steps = self.script.steps.len(),
            "Experiment started"
        );

        let outcome = self.execute(sink, stop);

        let reset = sink
            .set_mut_current(0.0)
            .and_then(|()| sink.set_load_rpm(0.0));
        if let Err(e) = &reset {
            warn!(experiment = %self.script.name, error = %e, "Failed to zero setpoints");
        }

        match outcome {
            Ok(state) => {
                self.state = state;
                info!(experiment = %self.script.name, state = ?state, "Experiment finished");
                Ok(state)
            }
            Err(e) => {
                self.state = RunState::Failed;
                Err(e)
            }
        }
    }

    fn execute(&self, sink: &dyn SetpointSink, stop: &StopToken) -> Result<RunState, RunError> {
        for (index, step) in self.script.steps.iter().enumerate() {
            if stop.is_stop_requested() {
                return Ok(RunState::Stopped);
            }
            debug!(
                experiment = %self.script.name,
                step = index,
                action = step.action(),
                duration_s = step.duration().as_secs_f64(),
                "Executing step"
            );
            let wrap = |source: SinkError| RunError::Sink {
                name: self.script.name.clone(),
                step: index,
                source,
            };

            match step {
                ExperimentStep::Ramp {
                    duration,
                    mut_motor,
                    load_motor,
                } => {
                    let substep = *duration / RAMP_SUBSTEPS;
                    for i in 0..RAMP_SUBSTEPS {
                        if stop.is_stop_requested() {
                            return Ok(RunState::Stopped);
                        }
                        apply(
                            sink,
                            (&mut_motor.property, mut_motor.value_at(i)),
                            (&load_motor.property, load_motor.value_at(i)),
                        )
                        .map_err(wrap)?;
                        if stop.sleep(substep) {
                            return Ok(RunState::Stopped);
                        }
                    }
                }
                ExperimentStep::Hold {
                    duration,
                    mut_motor,
                    load_motor,
                } => {
                    apply(
                        sink,
                        (&mut_motor.property, mut_motor.value),
                        (&load_motor.property, load_motor.value),
                    )
                    .map_err(wrap)?;
                    if stop.sleep(*duration) {
                        return Ok(RunState::Stopped);
                    }
                }
            }
        }
        Ok(RunState::Completed)
    }
}

fn apply(
    sink: &dyn SetpointSink,
    (mut_property, amps): (&Property, f64),
    (load_property, rpm): (&Property, f64),
) -> Result<(), SinkError> {
    if *mut_property == Property::Current {
        sink.set_mut_current(amps)?;
    }
    if *load_property == Property::Rpm {
        sink.set_load_rpm(rpm)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Instant;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Cmd {
        Current(f64),
        Rpm(f64),
    }

    #[derive(Default)]
    struct RecordingSink {
        commands: Mutex<Vec<(Instant, Cmd)>>,
    }

    impl RecordingSink {
        fn commands(&self) -> Vec<Cmd> {
            self.commands.lock().unwrap().iter().map(|(_, c)| *c).collect()
        }
    }

    impl SetpointSink for RecordingSink {
        fn set_mut_current(&self, amps: f64) -> Result<(), SinkError> {
            self.commands
                .lock()
                .unwrap()
                .push((Instant::now(), Cmd::Current(amps)));
            Ok(())
        }

        fn set_load_rpm(&self, rpm: f64) -> Result<(), SinkError> {
            self.commands.lock().unwrap().push((Instant::now(), Cmd::Rpm(rpm)));
            Ok(())
        }
    }

    const HOLD_THEN_RAMP: &str = r#"{
        "steps": [
            {"action": "hold", "duration": 0.02,
             "MUT": {"property": "current", "value": 2.0},
             "load_motor": {"property": "rpm", "value": 300}},
            {"action": "ramp", "duration": 0.1,
             "MUT": {"property": "current", "start": 0, "end": 100},
             "load_motor": {"property": "rpm", "start": 1000, "end": 0}}
        ]
    }"#;

    #[test]
    fn ramp_endpoints() {
        assert_eq!(ramp_value(0.0, 100.0, 0), 0.0);
        assert_eq!(ramp_value(0.0, 100.0, RAMP_SUBSTEPS - 1), 99.0);
        assert_eq!(ramp_value(1000.0, 0.0, 50), 500.0);
    }

    #[test]
    fn parses_steps_in_order() {
        let script = ExperimentScript::from_json_str("demo.json", HOLD_THEN_RAMP).unwrap();
        assert_eq!(script.steps.len(), 2);
        assert!(matches!(script.steps[0], ExperimentStep::Hold { .. }));
        assert!(matches!(script.steps[1], ExperimentStep::Ramp { .. }));
        assert!((script.total_duration().as_secs_f64() - 0.12).abs() < 1e-6);
    }

    #[test]
    fn malformed_step_names_its_index() {
        let json = r#"{"steps": [
            {"action": "hold", "duration": 1,
             "MUT": {"property": "current", "value": 1},
             "load_motor": {"property": "rpm", "value": 1}},
            {"action": "hold", "duration": 1,
             "MUT": {"property": "current"},
             "load_motor": {"property": "rpm", "value": 1}}
        ]}"#;
        match ExperimentScript::from_json_str("bad", json) {
            Err(ScriptError::Step { index, reason }) => {
                assert_eq!(index, 1);
                assert!(reason.contains("value"), "{reason}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_action_and_bad_duration_are_rejected() {
        let unknown = r#"{"steps": [{"action": "spin", "duration": 1,
            "MUT": {"property": "current", "value": 1},
            "load_motor": {"property": "rpm", "value": 1}}]}"#;
        assert!(matches!(
            ExperimentScript::from_json_str("x", unknown),
            Err(ScriptError::Step { index: 0, .. })
        ));

        let negative = r#"{"steps": [{"action": "hold", "duration": -1,
            "MUT": {"property": "current", "value": 1},
            "load_motor": {"property": "rpm", "value": 1}}]}"#;
        assert!(matches!(
            ExperimentScript::from_json_str("x", negative),
            Err(ScriptError::InvalidDuration { index: 0, .. })
        ));

        assert!(matches!(
            ExperimentScript::from_json_str("x", r#"{"stages": []}"#),
            Err(ScriptError::Document(_))
        ));
    }

    #[test]
    fn hold_applies_once_per_device_and_sleeps_full_duration() {
        let json = r#"{"steps": [{"action": "hold", "duration": 0.05,
            "MUT": {"property": "current", "value": 4.0},
            "load_motor": {"property": "rpm", "value": 750}}]}"#;
        let sink = RecordingSink::default();
        let mut runner = ExperimentRunner::new(ExperimentScript::from_json_str("h", json).unwrap());

        let started = Instant::now();
        assert_eq!(runner.run(&sink, &StopToken::new()).unwrap(), RunState::Completed);
        assert!(started.elapsed() >= Duration::from_millis(50));

        assert_eq!(
            sink.commands(),
            vec![Cmd::Current(4.0), Cmd::Rpm(750.0), Cmd::Current(0.0), Cmd::Rpm(0.0)]
        );
        let commands = sink.commands.lock().unwrap();
        assert!(commands[2].0.duration_since(commands[1].0) >= Duration::from_millis(50));
    }

    #[test]
    fn ramp_issues_one_hundred_substeps() {
        let json = r#"{"steps": [{"action": "ramp", "duration": 0.05,
            "MUT": {"property": "current", "start": 0, "end": 100},
            "load_motor": {"property": "rpm", "start": 0, "end": 1000}}]}"#;
        let sink = RecordingSink::default();
        let mut runner = ExperimentRunner::new(ExperimentScript::from_json_str("r", json).unwrap());
        runner.run(&sink, &StopToken::new()).unwrap();

        let currents: Vec<f64> = sink
            .commands()
            .into_iter()
            .filter_map(|c| match c {
                Cmd::Current(v) => Some(v),
                Cmd::Rpm(_) => None,
            })
            .collect();
        assert_eq!(currents.len(), 101);
        assert_eq!(currents[0], 0.0);
        assert_eq!(currents[99], 99.0);
        assert_eq!(currents[100], 0.0);
    }

    #[test]
    fn unsupported_properties_are_not_commanded() {
        let json = r#"{"steps": [{"action": "hold", "duration": 0,
            "MUT": {"property": "rpm", "value": 10},
            "load_motor": {"property": "current", "value": 3}}]}"#;
        let sink = RecordingSink::default();
        let mut runner = ExperimentRunner::new(ExperimentScript::from_json_str("u", json).unwrap());
        runner.run(&sink, &StopToken::new()).unwrap();
        assert_eq!(sink.commands(), vec![Cmd::Current(0.0), Cmd::Rpm(0.0)]);
    }

    #[test]
    fn second_run_is_rejected() {
        let sink = RecordingSink::default();
        let script = ExperimentScript::from_json_str("s", r#"{"steps": []}"#).unwrap();
        let mut runner = ExperimentRunner::new(script);
        assert_eq!(runner.run(&sink, &StopToken::new()).unwrap(), RunState::Completed);
        assert!(matches!(
            runner.run(&sink, &StopToken::new()),
            Err(RunError::AlreadyStarted(_))
        ));
    }

    #[test]
    fn stop_interrupts_a_long_ramp_and_zeroes_setpoints() {
        let json = r#"{"steps": [{"action": "ramp", "duration": 30,
            "MUT": {"property": "current", "start": 0, "end": 10},
            "load_motor": {"property": "rpm", "start": 0, "end": 1000}}]}"#;
        let sink = RecordingSink::default();
        let stop = StopToken::new();
        let remote = stop.clone();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            remote.request_stop();
        });

        let started = Instant::now();
        let mut runner = ExperimentRunner::new(ExperimentScript::from_json_str("long", json).unwrap());
        assert_eq!(runner.run(&sink, &stop).unwrap(), RunState::Stopped);
        assert!(started.elapsed() < Duration::from_secs(5));
        stopper.join().unwrap();

        let commands = sink.commands();
        assert_eq!(&commands[commands.len() - 2..], &[Cmd::Current(0.0), Cmd::Rpm(0.0)]);
    }

    #[test]
    fn exchange_sink_requires_experiment_authority() {
        let exchange = SetpointExchange::new();
        assert!(matches!(
            exchange.set_mut_current(1.0),
            Err(SinkError::AuthorityLost)
        ));
        assert!(exchange.claim_experiment());
        exchange.set_load_rpm(250.0).unwrap();
        assert_eq!(exchange.active().load_rpm, 250.0);
    }

    #[test]
    fn lists_every_file_but_not_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.json"), "{}").unwrap();
        std::fs::write(dir.path().join("a.json"), "{}").unwrap();
        std::fs::write(dir.path().join("sweep"), "{}").unwrap();
        std::fs::create_dir(dir.path().join("archive")).unwrap();
        assert_eq!(
            list_experiments(dir.path()).unwrap(),
            vec!["a.json".to_string(), "b.json".to_string(), "sweep".to_string()]
        );
    }

    #[cfg(feature = "simulation")]
    #[test]
    fn hold_then_ramp_leaves_both_devices_at_zero() {
        use crate::bus_sim::SimulatedBus;
        use crate::calibration::CalibrationTable;
        use std::sync::Arc;

        let bus = Arc::new(SimulatedBus::with_seed(8));
        let rig = Rig::new(bus.clone(), CalibrationTable::default());
        let mut runner =
            ExperimentRunner::new(ExperimentScript::from_json_str("demo", HOLD_THEN_RAMP).unwrap());

        assert_eq!(runner.run(&rig, &StopToken::new()).unwrap(), RunState::Completed);
        assert_eq!(runner.state(), RunState::Completed);
        assert_eq!(
            bus.last_sent("VESC_Command_AbsCurrent_V1").unwrap()["Command_Current_V1"],
            0.0
        );
        assert_eq!(
            bus.last_sent("VESC_Command_RPM_V2").unwrap()["Command_RPM_V2"],
            0.0
        );
    }
}
