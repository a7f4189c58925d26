//! Motor controllers and the torque transducer.
//!
//! Each device owns its [`StatusCell`] and is its only writer: a successful
//! poll publishes a complete calibrated snapshot, a timeout leaves the
//! previous snapshot in place.

use crate::bus::{BusClient, BusError};
use crate::calibration::CalibrationTable;
use crate::codec::Fields;
use crate::sync::{DeviceStatus, StatusCell};
use crate::tags;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

pub const MOTOR_STATUS_TIMEOUT: Duration = Duration::from_millis(21);
pub const TORQUE_STATUS_TIMEOUT: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct PollCounts {
    pub fresh: u64,
    pub timeouts: u64,
}

#[derive(Debug, Default)]
struct PollStats {
    fresh: AtomicU64,
    timeouts: AtomicU64,
}

impl PollStats {
    fn counts(&self) -> PollCounts {
        PollCounts {
            fresh: self.fresh.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Something with a status message that can be polled.
pub trait Device: Send + Sync {
    fn name(&self) -> &'static str;

    /// Flush, wait for the status message, publish on success.
    /// Returns whether fresh data arrived.
    fn update_status(&self) -> Result<bool, BusError>;

    fn status(&self) -> Arc<DeviceStatus>;

    fn poll_counts(&self) -> PollCounts;
}

struct StatusPoller {
    message: String,
    timeout: Duration,
    cell: StatusCell,
    stats: PollStats,
}

impl StatusPoller {
    fn new(message: String, keys: &[String], timeout: Duration) -> Self {
        Self {
            message,
            timeout,
            cell: StatusCell::new(DeviceStatus::zeroed(keys.iter().cloned())),
            stats: PollStats::default(),
        }
    }

    fn poll(&self, bus: &dyn BusClient, calibration: &CalibrationTable) -> Result<bool, BusError> {
        bus.flush_input()?;
        match bus.expect(&self.message, self.timeout)? {
            Some(fields) => {
                self.publish(&fields, calibration);
                self.stats.fresh.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            None => {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                trace!(message = %self.message, "No status within timeout");
                Ok(false)
            }
        }
    }

    fn publish(&self, fields: &Fields, calibration: &CalibrationTable) {
        let next = self
            .cell
            .snapshot()
            .updated(fields, |key, raw| calibration.decode(key, raw));
        self.cell.publish(next);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MotorRole {
    /// VESC 1
    UnderTest,
    /// VESC 2, the brake
    Load,
}

impl MotorRole {
    pub fn vesc_id(self) -> u8 {
        match self {
            Self::UnderTest => 1,
            Self::Load => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnderTest => "mut",
            Self::Load => "load_motor",
        }
    }
}

pub struct Motor {
    role: MotorRole,
    bus: Arc<dyn BusClient>,
    calibration: Arc<CalibrationTable>,
    poller: StatusPoller,
    rpm_status_key: String,
    rpm_command: (String, String),
    current_command: (String, String),
    brake_command: (String, String),
}

impl Motor {
    pub fn new(bus: Arc<dyn BusClient>, role: MotorRole, calibration: Arc<CalibrationTable>) -> Self {
        let id = role.vesc_id();
        let keys = tags::status_signals(id);
        Self {
            role,
            bus,
            calibration,
            poller: StatusPoller::new(tags::status_message(id), &keys, MOTOR_STATUS_TIMEOUT),
            rpm_status_key: keys[0].clone(),
            rpm_command: tags::rpm_command(id),
            current_command: tags::current_command(id),
            brake_command: tags::brake_current_command(id),
        }
    }

    pub fn role(&self) -> MotorRole {
        self.role
    }

    /// Speed command. Inverse-calibrated against the RPM status entry when
    /// one exists; truncated to whole RPM.
    pub fn set_rpm(&self, rpm: f64) -> Result<(), BusError> {
        let raw = self.calibration.encode(&self.rpm_status_key, rpm).trunc();
        self.send(&self.rpm_command, raw)
    }

    /// Current command in amps, sent uncalibrated.
    pub fn set_current(&self, amps: f64) -> Result<(), BusError> {
        self.send(&self.current_command, amps)
    }

    /// Brake current command in amps, sent uncalibrated.
    pub fn set_brake_current(&self, amps: f64) -> Result<(), BusError> {
        self.send(&self.brake_command, amps)
    }

    fn send(&self, (message, signal): &(String, String), value: f64) -> Result<(), BusError> {
        let fields: Fields = [(signal.clone(), value)].into_iter().collect();
        self.bus.send(message, &fields)
    }
}

impl Device for Motor {
    fn name(&self) -> &'static str {
        self.role.as_str()
    }

    fn update_status(&self) -> Result<bool, BusError> {
        self.poller.poll(self.bus.as_ref(), &self.calibration)
    }

    fn status(&self) -> Arc<DeviceStatus> {
        self.poller.cell.snapshot()
    }

    fn poll_counts(&self) -> PollCounts {
        self.poller.stats.counts()
    }
}

pub struct TorqueTransducer {
    bus: Arc<dyn BusClient>,
    calibration: Arc<CalibrationTable>,
    poller: StatusPoller,
}

impl TorqueTransducer {
    pub fn new(bus: Arc<dyn BusClient>, calibration: Arc<CalibrationTable>) -> Self {
        Self {
            bus,
            calibration,
            poller: StatusPoller::new(
                tags::TORQUE_STATUS_MESSAGE.to_string(),
                &[tags::TORQUE.key.to_string()],
                TORQUE_STATUS_TIMEOUT,
            ),
        }
    }
}

impl Device for TorqueTransducer {
    fn name(&self) -> &'static str {
        "torque"
    }

    fn update_status(&self) -> Result<bool, BusError> {
        self.poller.poll(self.bus.as_ref(), &self.calibration)
    }

    fn status(&self) -> Arc<DeviceStatus> {
        self.poller.cell.snapshot()
    }

    fn poll_counts(&self) -> PollCounts {
        self.poller.stats.counts()
    }
}
