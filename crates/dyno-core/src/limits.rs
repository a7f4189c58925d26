use crate::sync::Setpoints;
use std::marker::PhantomData;

#[derive(Debug, Clone, Copy)]
pub struct Unvalidated;

#[derive(Debug, Clone, Copy)]
pub struct Validated;

#[derive(Debug, Clone, Copy)]
pub struct Command<State = Unvalidated> {
    setpoints: Setpoints,
    _state: PhantomData<State>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommandLimits {
    pub max_abs_current_a: f64,
    pub max_abs_rpm: f64,
}

impl Default for CommandLimits {
    fn default() -> Self {
        Self {
            max_abs_current_a: 60.0,
            max_abs_rpm: 10_000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CommandViolation {
    NonFiniteCurrent { requested: f64 },
    NonFiniteRpm { requested: f64 },
    CurrentOutOfRange { requested: f64, limit: f64 },
    RpmOutOfRange { requested: f64, limit: f64 },
}

impl CommandViolation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NonFiniteCurrent { .. } => "non_finite_current",
            Self::NonFiniteRpm { .. } => "non_finite_rpm",
            Self::CurrentOutOfRange { .. } => "current_out_of_range",
            Self::RpmOutOfRange { .. } => "rpm_out_of_range",
        }
    }
}

impl Command<Unvalidated> {
    pub fn new(setpoints: Setpoints) -> Self {
        Self {
            setpoints,
            _state: PhantomData,
        }
    }

    pub fn validate(self, limits: &CommandLimits) -> Result<Command<Validated>, CommandViolation> {
        let Setpoints {
            mut_current_a,
            load_rpm,
        } = self.setpoints;

        if !mut_current_a.is_finite() {
            return Err(CommandViolation::NonFiniteCurrent {
                requested: mut_current_a,
            });
        }
        if !load_rpm.is_finite() {
            return Err(CommandViolation::NonFiniteRpm {
                requested: load_rpm,
            });
        }
        if mut_current_a.abs() > limits.max_abs_current_a {
            return Err(CommandViolation::CurrentOutOfRange {
                requested: mut_current_a,
                limit: limits.max_abs_current_a,
            });
        }
        if load_rpm.abs() > limits.max_abs_rpm {
            return Err(CommandViolation::RpmOutOfRange {
                requested: load_rpm,
                limit: limits.max_abs_rpm,
            });
        }

        Ok(Command {
            setpoints: self.setpoints,
            _state: PhantomData,
        })
    }
}

impl Command<Validated> {
    pub fn setpoints(&self) -> Setpoints {
        self.setpoints
    }
}
