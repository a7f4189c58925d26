use crate::bus::BusError;
use crate::limits::{Command, CommandLimits, CommandViolation};
use crate::rig::Rig;
use crate::sync::{SetpointExchange, Setpoints};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// 40 Hz, shared by the poll, control and recorder tasks.
pub const TASK_PERIOD: Duration = Duration::from_millis(25);

#[derive(Clone, Debug)]
pub struct ControlConfig {
    pub period: Duration,
    pub limits: CommandLimits,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            period: TASK_PERIOD,
            limits: CommandLimits::default(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ControlStats {
    cycles_executed: AtomicU64,
    rejections: AtomicU64,
    max_cycle_us: AtomicU64,
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, serde::Serialize)]
pub struct ExecutionStats {
    pub cycles_executed: u64,
    pub rejections: u64,
    pub max_cycle_us: u64,
}

impl ControlStats {
    pub fn snapshot(&self) -> ExecutionStats {
        ExecutionStats {
            cycles_executed: self.cycles_executed.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            max_cycle_us: self.max_cycle_us.load(Ordering::Relaxed),
        }
    }
}

/// Pushes the active setpoints to the rig. The only writer of setpoint
/// commands to the bus.
pub struct ControlLoop {
    rig: Arc<Rig>,
    exchange: Arc<SetpointExchange>,
    config: ControlConfig,
    stats: Arc<ControlStats>,
    last_accepted: Setpoints,
    last_violation: Option<CommandViolation>,
}

impl ControlLoop {
    pub fn new(rig: Arc<Rig>, exchange: Arc<SetpointExchange>, config: ControlConfig) -> Self {
        info!(
            period_ms = config.period.as_millis() as u64,
            max_abs_current_a = config.limits.max_abs_current_a,
            max_abs_rpm = config.limits.max_abs_rpm,
            "Control loop configured"
        );
        Self {
            rig,
            exchange,
            config,
            stats: Arc::new(ControlStats::default()),
            last_accepted: Setpoints::ZERO,
            last_violation: None,
        }
    }

    pub fn stats(&self) -> Arc<ControlStats> {
        Arc::clone(&self.stats)
    }

    pub fn period(&self) -> Duration {
        self.config.period
    }

    /// One control iteration. Setpoints outside the limits are counted and
    /// the last accepted value is sent instead. Returns what was sent.
    pub fn cycle(&mut self) -> Result<Setpoints, BusError> {
        let started = Instant::now();
        let requested = self.exchange.active();

        match Command::new(requested).validate(&self.config.limits) {
            Ok(command) => {
                self.last_accepted = command.setpoints();
                self.last_violation = None;
            }
            Err(violation) => {
                self.stats.rejections.fetch_add(1, Ordering::Relaxed);
                if self.last_violation != Some(violation) {
                    warn!(
                        reason = violation.as_str(),
                        mut_current_a = requested.mut_current_a,
                        load_rpm = requested.load_rpm,
                        "Setpoint rejected, holding last accepted value"
                    );
                }
                self.last_violation = Some(violation);
            }
        }

        let output = self.last_accepted;
        self.rig.apply(output)?;

        let elapsed_us = started.elapsed().as_micros() as u64;
        self.stats.max_cycle_us.fetch_max(elapsed_us, Ordering::Relaxed);
        self.stats.cycles_executed.fetch_add(1, Ordering::Relaxed);
        Ok(output)
    }
}
