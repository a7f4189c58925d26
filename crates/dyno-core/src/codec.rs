//! Named-message codec.
//!
//! A [`SignalDatabase`] turns a message name plus named field values into a
//! bus frame and back. [`SignalTable`] is a table-driven implementation that
//! packs integer signals big-endian at fixed byte offsets, which covers the
//! VESC status/command set and the torque transducer frame.

use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Named field values of one bus message.
pub type Fields = BTreeMap<String, f64>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u32,
    pub extended: bool,
    pub data: Vec<u8>,
}

#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("unknown message {0}")]
    UnknownMessage(String),
    #[error("message {message} is missing signal {signal}")]
    MissingSignal { message: String, signal: String },
    #[error("signal {signal} value {value} does not fit its {width}-byte encoding")]
    OutOfRange {
        signal: String,
        value: f64,
        width: usize,
    },
    #[error("frame {id:#x} carries {len} bytes, message {message} needs {needed}")]
    ShortFrame {
        id: u32,
        message: String,
        len: usize,
        needed: usize,
    },
}

impl CodecError {
    /// The message the error concerns, when it is known.
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::UnknownMessage(message)
            | Self::MissingSignal { message, .. }
            | Self::ShortFrame { message, .. } => Some(message),
            Self::OutOfRange { .. } => None,
        }
    }
}

/// Encode/decode capability for named messages.
pub trait SignalDatabase: Send + Sync {
    fn encode(&self, message: &str, fields: &Fields) -> Result<Frame, CodecError>;

    /// `Ok(None)` for frames the database does not describe.
    fn decode(&self, frame: &Frame) -> Result<Option<(String, Fields)>, CodecError>;
}

/// Byte width of an integer signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalWidth {
    One,
    Two,
    Four,
}

impl SignalWidth {
    pub fn from_bytes(bytes: usize) -> Option<Self> {
        match bytes {
            1 => Some(Self::One),
            2 => Some(Self::Two),
            4 => Some(Self::Four),
            _ => None,
        }
    }

    pub fn bytes(self) -> usize {
        match self {
            Self::One => 1,
            Self::Two => 2,
            Self::Four => 4,
        }
    }

    fn bits(self) -> u32 {
        (self.bytes() * 8) as u32
    }
}

#[derive(Debug, Clone)]
pub struct SignalSpec {
    pub name: String,
    pub start: usize,
    pub width: SignalWidth,
    pub signed: bool,
    /// Physical value = wire value * factor.
    pub factor: f64,
}

impl SignalSpec {
    pub fn new(
        name: impl Into<String>,
        start: usize,
        width: SignalWidth,
        signed: bool,
        factor: f64,
    ) -> Self {
        Self {
            name: name.into(),
            start,
            width,
            signed,
            factor,
        }
    }

    fn end(&self) -> usize {
        self.start + self.width.bytes()
    }

    fn wire_range(&self) -> (i64, i64) {
        let bits = self.width.bits();
        if self.signed {
            (-(1i64 << (bits - 1)), (1i64 << (bits - 1)) - 1)
        } else {
            (0, (1i64 << bits) - 1)
        }
    }

    fn pack(&self, value: f64, data: &mut [u8]) -> Result<(), CodecError> {
        let wire = (value / self.factor).round();
        let (min, max) = self.wire_range();
        if !wire.is_finite() || wire < min as f64 || wire > max as f64 {
            return Err(CodecError::OutOfRange {
                signal: self.name.clone(),
                value,
                width: self.width.bytes(),
            });
        }
        let wire = wire as i64;
        for (i, byte) in data[self.start..self.end()].iter_mut().enumerate() {
            let shift = 8 * (self.width.bytes() - 1 - i);
            *byte = ((wire >> shift) & 0xFF) as u8;
        }
        Ok(())
    }

    fn unpack(&self, data: &[u8]) -> f64 {
        let mut wire: i64 = 0;
        for byte in &data[self.start..self.end()] {
            wire = (wire << 8) | i64::from(*byte);
        }
        if self.signed {
            let bits = self.width.bits();
            let sign = 1i64 << (bits - 1);
            if wire & sign != 0 {
                wire -= 1i64 << bits;
            }
        }
        wire as f64 * self.factor
    }
}

#[derive(Debug, Clone)]
pub struct MessageSpec {
    pub name: String,
    pub id: u32,
    pub extended: bool,
    pub length: usize,
    pub signals: Vec<SignalSpec>,
}

impl MessageSpec {
    pub fn new(name: impl Into<String>, id: u32, extended: bool, length: usize) -> Self {
        Self {
            name: name.into(),
            id,
            extended,
            length,
            signals: Vec::new(),
        }
    }

    pub fn signal(mut self, signal: SignalSpec) -> Self {
        self.length = self.length.max(signal.end());
        self.signals.push(signal);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct SignalTable {
    messages: HashMap<String, MessageSpec>,
    by_id: HashMap<(u32, bool), String>,
}

impl SignalTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_message(mut self, message: MessageSpec) -> Self {
        self.by_id
            .insert((message.id, message.extended), message.name.clone());
        self.messages.insert(message.name.clone(), message);
        self
    }

    pub fn message(&self, name: &str) -> Option<&MessageSpec> {
        self.messages.get(name)
    }
}

impl SignalDatabase for SignalTable {
    fn encode(&self, message: &str, fields: &Fields) -> Result<Frame, CodecError> {
        let spec = self
            .messages
            .get(message)
            .ok_or_else(|| CodecError::UnknownMessage(message.to_string()))?;

        let mut data = vec![0u8; spec.length];
        for signal in &spec.signals {
            let value = fields
                .get(&signal.name)
                .ok_or_else(|| CodecError::MissingSignal {
                    message: message.to_string(),
                    signal: signal.name.clone(),
                })?;
            signal.pack(*value, &mut data)?;
        }

        Ok(Frame {
            id: spec.id,
            extended: spec.extended,
            data,
        })
    }

    fn decode(&self, frame: &Frame) -> Result<Option<(String, Fields)>, CodecError> {
        let Some(name) = self.by_id.get(&(frame.id, frame.extended)) else {
            return Ok(None);
        };
        let Some(spec) = self.messages.get(name) else {
            return Ok(None);
        };

        let needed = spec.signals.iter().map(SignalSpec::end).max().unwrap_or(0);
        if frame.data.len() < needed {
            return Err(CodecError::ShortFrame {
                id: frame.id,
                message: spec.name.clone(),
                len: frame.data.len(),
                needed,
            });
        }

        let fields = spec
            .signals
            .iter()
            .map(|signal| (signal.name.clone(), signal.unpack(&frame.data)))
            .collect();
        Ok(Some((spec.name.clone(), fields)))
    }
}

const VESC_CMD_SET_CURRENT: u32 = 1;
const VESC_CMD_SET_CURRENT_BRAKE: u32 = 2;
const VESC_CMD_SET_RPM: u32 = 3;
const VESC_STATUS_1: u32 = 9;
const TEENSY_STATUS_ID: u32 = 25;

fn vesc_id(packet: u32, controller: u8) -> u32 {
    (packet << 8) | u32::from(controller)
}

/// Message set for two VESC controllers (ids 1 and 2) and the Teensy torque
/// transducer.
pub fn vesc_table() -> SignalTable {
    let mut table = SignalTable::new();
    for n in 1u8..=2 {
        table = table
            .with_message(
                MessageSpec::new(format!("VESC_Status1_V{n}"), vesc_id(VESC_STATUS_1, n), true, 8)
                    .signal(SignalSpec::new(format!("Status_RPM_V{n}"), 0, SignalWidth::Four, true, 1.0))
                    .signal(SignalSpec::new(format!("Status_TotalCurrent_V{n}"), 4, SignalWidth::Two, true, 0.1))
                    .signal(SignalSpec::new(format!("Status_DutyCycle_V{n}"), 6, SignalWidth::Two, true, 0.001)),
            )
            .with_message(
                MessageSpec::new(
                    format!("VESC_Command_AbsCurrent_V{n}"),
                    vesc_id(VESC_CMD_SET_CURRENT, n),
                    true,
                    4,
                )
                .signal(SignalSpec::new(format!("Command_Current_V{n}"), 0, SignalWidth::Four, true, 0.001)),
            )
            .with_message(
                MessageSpec::new(
                    format!("VESC_Command_AbsBrakeCurrent_V{n}"),
                    vesc_id(VESC_CMD_SET_CURRENT_BRAKE, n),
                    true,
                    4,
                )
                .signal(SignalSpec::new(format!("Command_BrakeCurrent_V{n}"), 0, SignalWidth::Four, true, 0.001)),
            )
            .with_message(
                MessageSpec::new(
                    format!("VESC_Command_RPM_V{n}"),
                    vesc_id(VESC_CMD_SET_RPM, n),
                    true,
                    4,
                )
                .signal(SignalSpec::new(format!("Command_RPM_V{n}"), 0, SignalWidth::Four, true, 1.0)),
            );
    }
    table.with_message(
        MessageSpec::new("TEENSY_Status", TEENSY_STATUS_ID, false, 2)
            .signal(SignalSpec::new("TorqueValue", 0, SignalWidth::Two, false, 1.0)),
    )
}
