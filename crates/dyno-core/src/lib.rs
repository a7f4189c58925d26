pub mod bus;
#[cfg(feature = "simulation")]
pub mod bus_sim;
pub mod calibration;
pub mod codec;
pub mod control_loop;
pub mod controller;
pub mod device;
pub mod experiment;
pub mod limits;
pub mod recorder;
pub mod rig;
pub mod supervisor;
pub mod sync;
pub mod tags;
pub mod view;

pub use bus::{BusClient, BusError, FrameBus, LoopbackTransport, Transport};
#[cfg(feature = "simulation")]
pub use bus_sim::SimulatedBus;
pub use calibration::{CalibrationEntry, CalibrationError, CalibrationTable};
pub use codec::{
    vesc_table, CodecError, Fields, Frame, MessageSpec, SignalDatabase, SignalSpec, SignalTable,
    SignalWidth,
};
pub use control_loop::{ControlConfig, ControlLoop, ExecutionStats, TASK_PERIOD};
pub use controller::{ControllerConfig, ControllerError, ControllerEvent, DynoController};
pub use device::{Device, Motor, MotorRole, PollCounts, TorqueTransducer};
pub use experiment::{ExperimentRunner, ExperimentScript, RunState, ScriptError, SetpointSink};
pub use limits::{Command, CommandLimits, CommandViolation, Unvalidated, Validated};
pub use recorder::{Recorder, RecorderError};
pub use rig::{Rig, RigStatus};
pub use supervisor::{StopToken, TaskError, TaskFailure, TaskHandle, TaskStatus, TaskSupervisor};
pub use sync::{Authority, DeviceStatus, SetpointExchange, Setpoints, StatusCell};
pub use view::{HeadlessView, OperatorCommand, RigSnapshot, View, VIEW_REFRESH};
