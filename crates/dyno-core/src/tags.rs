//! Bus message and signal names shared by the devices, the recorder and the
//! metrics exporter.

#[derive(Debug, Clone, Copy)]
pub struct Tag {
    pub key: &'static str,
    pub metric: &'static str,
    pub help: &'static str,
}

pub const MUT_RPM: Tag = Tag {
    key: "Status_RPM_V1",
    metric: "vdyno_mut_speed_rpm",
    help: "Motor-under-test speed in RPM",
};

pub const MUT_CURRENT: Tag = Tag {
    key: "Status_TotalCurrent_V1",
    metric: "vdyno_mut_current_amps",
    help: "Motor-under-test total current in amps",
};

pub const MUT_DUTY: Tag = Tag {
    key: "Status_DutyCycle_V1",
    metric: "vdyno_mut_duty_cycle",
    help: "Motor-under-test duty cycle",
};

pub const LOAD_RPM: Tag = Tag {
    key: "Status_RPM_V2",
    metric: "vdyno_load_speed_rpm",
    help: "Load motor speed in RPM",
};

pub const LOAD_CURRENT: Tag = Tag {
    key: "Status_TotalCurrent_V2",
    metric: "vdyno_load_current_amps",
    help: "Load motor total current in amps",
};

pub const LOAD_DUTY: Tag = Tag {
    key: "Status_DutyCycle_V2",
    metric: "vdyno_load_duty_cycle",
    help: "Load motor duty cycle",
};

pub const TORQUE: Tag = Tag {
    key: "TorqueValue",
    metric: "vdyno_torque",
    help: "Torque transducer reading",
};

/// Every status signal, in telemetry column order.
pub const STATUS_TAGS: &[Tag] = &[
    MUT_RPM,
    MUT_CURRENT,
    MUT_DUTY,
    LOAD_RPM,
    LOAD_CURRENT,
    LOAD_DUTY,
    TORQUE,
];

pub const TORQUE_STATUS_MESSAGE: &str = "TEENSY_Status";

pub fn status_message(vesc: u8) -> String {
    format!("VESC_Status1_V{vesc}")
}

pub fn status_signals(vesc: u8) -> [String; 3] {
    [
        format!("Status_RPM_V{vesc}"),
        format!("Status_TotalCurrent_V{vesc}"),
        format!("Status_DutyCycle_V{vesc}"),
    ]
}

pub fn rpm_command(vesc: u8) -> (String, String) {
    (
        format!("VESC_Command_RPM_V{vesc}"),
        format!("Command_RPM_V{vesc}"),
    )
}

pub fn current_command(vesc: u8) -> (String, String) {
    (
        format!("VESC_Command_AbsCurrent_V{vesc}"),
        format!("Command_Current_V{vesc}"),
    )
}

pub fn brake_current_command(vesc: u8) -> (String, String) {
    (
        format!("VESC_Command_AbsBrakeCurrent_V{vesc}"),
        format!("Command_BrakeCurrent_V{vesc}"),
    )
}
