use dyno_core::{OperatorCommand, RigSnapshot};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub const fn v1() -> Self {
        Self { major: 1, minor: 0 }
    }

    /// Messages without a version are treated as v1.
    pub fn is_supported(&self) -> bool {
        self.major == 1 || (self.major == 0 && self.minor == 0)
    }
}

/// Periodic rig status pushed to the client.
#[derive(Debug, Serialize)]
pub struct StatusMsg<'a> {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub protocol_version: ProtocolVersion,
    pub sequence: u64,
    pub elapsed_s: f64,
    pub unix_us: i64,
    pub selected_experiment: Option<&'a str>,
    #[serde(flatten)]
    pub snapshot: &'a RigSnapshot,
}

#[derive(Debug, Deserialize)]
pub struct HelloMsg {
    #[serde(default)]
    pub protocol_version: ProtocolVersion,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SetpointsMsg {
    #[serde(default)]
    pub protocol_version: ProtocolVersion,
    #[serde(default)]
    pub sequence: u64,
    pub mut_current_a: f64,
    pub load_rpm: f64,
}

#[derive(Debug, Deserialize)]
pub struct SelectExperimentMsg {
    #[serde(default)]
    pub protocol_version: ProtocolVersion,
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CommandMsg {
    #[serde(default)]
    pub protocol_version: ProtocolVersion,
    pub command: OperatorCommand,
}

#[derive(Debug)]
pub enum IncomingMessage {
    Hello(HelloMsg),
    Setpoints(SetpointsMsg),
    SelectExperiment(SelectExperimentMsg),
    Command(CommandMsg),
}

impl IncomingMessage {
    pub fn parse(line: &str) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(line).ok()?;
        let msg_type = value.get("type")?.as_str()?;
        match msg_type {
            "hello" => serde_json::from_value(value).ok().map(IncomingMessage::Hello),
            "setpoints" => serde_json::from_value(value)
                .ok()
                .map(IncomingMessage::Setpoints),
            "select_experiment" => serde_json::from_value(value)
                .ok()
                .map(IncomingMessage::SelectExperiment),
            "command" => serde_json::from_value(value)
                .ok()
                .map(IncomingMessage::Command),
            _ => None,
        }
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        match self {
            Self::Hello(m) => m.protocol_version,
            Self::Setpoints(m) => m.protocol_version,
            Self::SelectExperiment(m) => m.protocol_version,
            Self::Command(m) => m.protocol_version,
        }
    }
}
