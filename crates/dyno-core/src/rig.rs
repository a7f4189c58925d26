use crate::bus::{BusClient, BusError};
use crate::calibration::CalibrationTable;
use crate::device::{Device, Motor, MotorRole, TorqueTransducer};
use crate::sync::{DeviceStatus, Setpoints};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Point-in-time view of every device's latest snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct RigStatus {
    #[serde(rename = "mut")]
    pub mut_motor: Arc<DeviceStatus>,
    pub load_motor: Arc<DeviceStatus>,
    pub torque: Arc<DeviceStatus>,
}

impl RigStatus {
    fn parts(&self) -> [&DeviceStatus; 3] {
        [&self.mut_motor, &self.load_motor, &self.torque]
    }

    /// Motor-under-test, load motor, then transducer keys.
    pub fn columns(&self) -> Vec<&str> {
        self.parts()
            .into_iter()
            .flat_map(|status| status.keys().iter().map(String::as_str))
            .collect()
    }

    /// Values in [`RigStatus::columns`] order.
    pub fn row(&self) -> Vec<f64> {
        self.parts()
            .into_iter()
            .flat_map(|status| status.values().iter().copied())
            .collect()
    }
}

/// The two motors and the torque transducer on one shared bus.
pub struct Rig {
    bus: Arc<dyn BusClient>,
    mut_motor: Motor,
    load_motor: Motor,
    torque: TorqueTransducer,
}

impl Rig {
    pub fn new(bus: Arc<dyn BusClient>, calibration: CalibrationTable) -> Self {
        let calibration = Arc::new(calibration);
        info!(calibrated_signals = calibration.len(), "Rig assembled");
        Self {
            mut_motor: Motor::new(Arc::clone(&bus), MotorRole::UnderTest, Arc::clone(&calibration)),
            load_motor: Motor::new(Arc::clone(&bus), MotorRole::Load, Arc::clone(&calibration)),
            torque: TorqueTransducer::new(Arc::clone(&bus), calibration),
            bus,
        }
    }

    pub fn mut_motor(&self) -> &Motor {
        &self.mut_motor
    }

    pub fn load_motor(&self) -> &Motor {
        &self.load_motor
    }

    pub fn transducer(&self) -> &TorqueTransducer {
        &self.torque
    }

    pub fn devices(&self) -> [&dyn Device; 3] {
        [&self.mut_motor, &self.load_motor, &self.torque]
    }

    pub fn status(&self) -> RigStatus {
        RigStatus {
            mut_motor: self.mut_motor.status(),
            load_motor: self.load_motor.status(),
            torque: self.torque.status(),
        }
    }

    /// Current on the motor under test, speed on the load motor.
    pub fn apply(&self, setpoints: Setpoints) -> Result<(), BusError> {
        self.mut_motor.set_current(setpoints.mut_current_a)?;
        self.load_motor.set_rpm(setpoints.load_rpm)
    }

    pub fn close(&self) -> Result<(), BusError> {
        self.bus.close()
    }
}

#[cfg(all(test, feature = "simulation"))]
mod tests {
    use super::*;
    use crate::bus_sim::SimulatedBus;

    #[test]
    fn columns_follow_device_order() {
        let rig = Rig::new(Arc::new(SimulatedBus::with_seed(5)), CalibrationTable::default());
        let status = rig.status();
        assert_eq!(
            status.columns(),
            vec![
                "Status_RPM_V1",
                "Status_TotalCurrent_V1",
                "Status_DutyCycle_V1",
                "Status_RPM_V2",
                "Status_TotalCurrent_V2",
                "Status_DutyCycle_V2",
                "TorqueValue",
            ]
        );
        assert_eq!(status.row().len(), 7);
    }

    #[test]
    fn status_serializes_each_device_under_its_own_key() {
        let rig = Rig::new(Arc::new(SimulatedBus::with_seed(5)), CalibrationTable::default());
        let json = serde_json::to_value(rig.status()).unwrap();
        assert_eq!(json["mut"]["Status_RPM_V1"], 0.0);
        assert_eq!(json["load_motor"]["Status_DutyCycle_V2"], 0.0);
        assert_eq!(json["torque"]["TorqueValue"], 0.0);
    }

    #[test]
    fn apply_commands_both_motors() {
        let bus = Arc::new(SimulatedBus::with_seed(5));
        let rig = Rig::new(bus.clone(), CalibrationTable::default());
        rig.apply(Setpoints {
            mut_current_a: 2.0,
            load_rpm: 500.0,
        })
        .unwrap();

        assert_eq!(
            bus.last_sent("VESC_Command_AbsCurrent_V1").unwrap()["Command_Current_V1"],
            2.0
        );
        assert_eq!(
            bus.last_sent("VESC_Command_RPM_V2").unwrap()["Command_RPM_V2"],
            500.0
        );
    }

    #[test]
    fn polling_updates_every_device() {
        let rig = Rig::new(Arc::new(SimulatedBus::with_seed(11)), CalibrationTable::default());
        for device in rig.devices() {
            assert!(device.update_status().unwrap());
            assert_eq!(device.poll_counts().fresh, 1);
        }
    }
}
