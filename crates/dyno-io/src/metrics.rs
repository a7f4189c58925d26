//! Prometheus metrics for the dyno rig.
//!
//! One gauge per status signal (named after its [`tags::Tag`]), the active
//! setpoints and authority, plus counters for poll timeouts, task failures,
//! command rejections and recorded rows.

use dyno_core::supervisor::TaskEvent;
use dyno_core::sync::Authority;
use dyno_core::{tags, RigSnapshot};
use prometheus::{
    Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use std::thread;
use tiny_http::{Header, Response, Server};
use tracing::{error, info, warn};

pub struct DynoMetrics {
    registry: Registry,
    status: Vec<(tags::Tag, Gauge)>,
    setpoint_current: Gauge,
    setpoint_rpm: Gauge,
    authority: IntGauge,
    recording: IntGauge,
    recorder_rows: IntGauge,
    poll_fresh: IntCounterVec,
    poll_timeouts: IntCounterVec,
    control_cycles: IntCounter,
    control_max_cycle_us: IntGauge,
    command_rejections: IntCounterVec,
    task_failures: IntCounterVec,
    bridge_connected: IntGauge,
    bridge_rejected: IntCounter,
}

fn register<M>(registry: &Registry, metric: M) -> prometheus::Result<M>
where
    M: prometheus::core::Collector + Clone + 'static,
{
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

impl DynoMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let r = &registry;

        let status = tags::STATUS_TAGS
            .iter()
            .map(|tag| Ok((*tag, register(r, Gauge::new(tag.metric, tag.help)?)?)))
            .collect::<prometheus::Result<Vec<_>>>()?;

        Ok(Self {
            status,
            setpoint_current: register(
                r,
                Gauge::new("vdyno_setpoint_mut_current_amps", "Active motor-under-test current setpoint")?,
            )?,
            setpoint_rpm: register(
                r,
                Gauge::new("vdyno_setpoint_load_rpm", "Active load motor speed setpoint")?,
            )?,
            authority: register(
                r,
                IntGauge::new(
                    "vdyno_setpoint_authority",
                    "Setpoint authority (0=manual, 1=experiment)",
                )?,
            )?,
            recording: register(
                r,
                IntGauge::new("vdyno_recording", "Telemetry recording active (1=yes)")?,
            )?,
            recorder_rows: register(
                r,
                IntGauge::new("vdyno_recorder_rows", "Rows written to the current telemetry log")?,
            )?,
            poll_fresh: register(
                r,
                IntCounterVec::new(
                    Opts::new("vdyno_poll_fresh_total", "Status polls that returned data"),
                    &["device"],
                )?,
            )?,
            poll_timeouts: register(
                r,
                IntCounterVec::new(
                    Opts::new("vdyno_poll_timeouts_total", "Status polls that timed out"),
                    &["device"],
                )?,
            )?,
            control_cycles: register(
                r,
                IntCounter::new("vdyno_control_cycles_total", "Setpoint control cycles executed")?,
            )?,
            control_max_cycle_us: register(
                r,
                IntGauge::new(
                    "vdyno_control_max_cycle_us",
                    "Longest setpoint control cycle in microseconds",
                )?,
            )?,
            command_rejections: register(
                r,
                IntCounterVec::new(
                    Opts::new(
                        "vdyno_command_rejections_total",
                        "Setpoints rejected by the command limits",
                    ),
                    &["source"],
                )?,
            )?,
            task_failures: register(
                r,
                IntCounterVec::new(
                    Opts::new("vdyno_task_failures_total", "Task iteration errors and crashes"),
                    &["task", "kind"],
                )?,
            )?,
            bridge_connected: register(
                r,
                IntGauge::new(
                    "vdyno_bridge_connected",
                    "Remote view client connection status (1=connected)",
                )?,
            )?,
            bridge_rejected: register(
                r,
                IntCounter::new(
                    "vdyno_bridge_messages_rejected_total",
                    "Remote view messages dropped as invalid",
                )?,
            )?,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Copies a controller snapshot into the gauges and advances the
    /// cumulative counters.
    pub fn observe(&self, snapshot: &RigSnapshot) {
        let status = &snapshot.status;
        for (tag, gauge) in &self.status {
            let value = [&status.mut_motor, &status.load_motor, &status.torque]
                .into_iter()
                .find_map(|device| device.get(tag.key));
            if let Some(value) = value {
                gauge.set(value);
            }
        }

        self.setpoint_current.set(snapshot.setpoints.mut_current_a);
        self.setpoint_rpm.set(snapshot.setpoints.load_rpm);
        self.authority.set(match snapshot.authority {
            Authority::Manual => 0,
            Authority::Experiment => 1,
        });

        match &snapshot.recording {
            Some(recording) => {
                self.recording.set(1);
                self.recorder_rows.set(recording.rows as i64);
            }
            None => self.recording.set(0),
        }

        for poll in &snapshot.polls {
            advance(&self.poll_fresh.with_label_values(&[poll.device]), poll.counts.fresh);
            advance(
                &self.poll_timeouts.with_label_values(&[poll.device]),
                poll.counts.timeouts,
            );
        }

        advance(&self.control_cycles, snapshot.control.cycles_executed);
        advance(
            &self.command_rejections.with_label_values(&["control"]),
            snapshot.control.rejections,
        );
        self.control_max_cycle_us
            .set(snapshot.control.max_cycle_us as i64);
    }

    pub fn record_task_event(&self, event: &TaskEvent) {
        let (task, kind) = match event {
            TaskEvent::IterationFailed { task, .. } => (task.as_str(), "iteration"),
            TaskEvent::Terminated { task, .. } => (task.as_str(), "terminated"),
        };
        self.task_failures.with_label_values(&[task, kind]).inc();
    }

    pub fn record_rejection(&self, source: &str) {
        self.command_rejections.with_label_values(&[source]).inc();
    }

    pub fn set_bridge_connected(&self, connected: bool) {
        self.bridge_connected.set(i64::from(connected));
    }

    pub fn bridge_message_rejected(&self) {
        self.bridge_rejected.inc();
    }

    /// Ready once the control task has run at least one cycle.
    pub fn is_ready(&self) -> bool {
        self.control_cycles.get() > 0
    }

    pub fn encode(&self) -> prometheus::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

/// Counters mirror cumulative totals kept elsewhere; add the difference.
fn advance(counter: &IntCounter, total: u64) {
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}

/// Serves `/metrics`, `/health` and `/ready` on `bind_addr`.
pub fn serve_metrics(bind_addr: String, metrics: Arc<DynoMetrics>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let server = match Server::http(&bind_addr) {
            Ok(s) => s,
            Err(e) => {
                error!(addr = %bind_addr, error = %e, "Failed to start metrics server");
                return;
            }
        };

        info!("Metrics server listening on http://{}/metrics", bind_addr);

        for request in server.incoming_requests() {
            let response = match request.url() {
                "/metrics" => match metrics.encode() {
                    Ok(buffer) => {
                        let mut response = Response::from_data(buffer);
                        if let Ok(header) = Header::from_bytes(
                            &b"Content-Type"[..],
                            &b"text/plain; version=0.0.4"[..],
                        ) {
                            response = response.with_header(header);
                        }
                        response
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to encode metrics");
                        Response::from_string("Internal Server Error").with_status_code(500)
                    }
                },
                "/health" => Response::from_string("OK"),
                "/ready" if metrics.is_ready() => Response::from_string("Ready"),
                "/ready" => Response::from_string("Not Ready").with_status_code(503),
                _ => Response::from_string("Not Found").with_status_code(404),
            };
            let _ = request.respond(response);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dyno_core::{
        CalibrationTable, ControllerConfig, Device, DynoController, Rig, SimulatedBus,
    };
    use std::sync::Arc;

    #[test]
    fn every_status_signal_has_a_gauge() {
        let metrics = DynoMetrics::new().unwrap();
        let text = String::from_utf8(metrics.encode().unwrap()).unwrap();
        for tag in tags::STATUS_TAGS {
            assert!(text.contains(tag.metric), "missing {}", tag.metric);
        }
    }

    #[test]
    fn observe_copies_snapshot_values() {
        let rig = Arc::new(Rig::new(
            Arc::new(SimulatedBus::with_seed(4)),
            CalibrationTable::default(),
        ));
        for device in rig.devices() {
            device.update_status().unwrap();
        }
        let controller = DynoController::new(Arc::clone(&rig), ControllerConfig::default());
        let snapshot = controller.snapshot();

        let metrics = DynoMetrics::new().unwrap();
        metrics.observe(&snapshot);
        metrics.observe(&snapshot);

        let (_, torque) = metrics
            .status
            .iter()
            .find(|(tag, _)| tag.key == tags::TORQUE.key)
            .unwrap();
        assert_eq!(Some(torque.get()), snapshot.status.torque.get(tags::TORQUE.key));
        assert_eq!(metrics.poll_fresh.with_label_values(&["torque"]).get(), 1);
        assert!(!metrics.is_ready());
    }

    #[test]
    fn task_events_are_counted_by_kind() {
        let metrics = DynoMetrics::new().unwrap();
        metrics.record_task_event(&TaskEvent::IterationFailed {
            task: "poll:mut".to_string(),
            error: "bus closed".to_string(),
        });
        metrics.record_rejection("operator");
        assert_eq!(
            metrics
                .task_failures
                .with_label_values(&["poll:mut", "iteration"])
                .get(),
            1
        );
        assert_eq!(
            metrics.command_rejections.with_label_values(&["operator"]).get(),
            1
        );
    }
}
