use dyno_core::{DynoController, TaskError, TaskHandle};
use dyno_io::metrics::{serve_metrics, DynoMetrics};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::info;

pub const TASK_METRICS: &str = "metrics";
const METRICS_REFRESH: Duration = Duration::from_millis(200);

pub fn start_metrics_server(
    addr: &Option<String>,
    metrics: &Arc<DynoMetrics>,
) -> Option<thread::JoinHandle<()>> {
    addr.as_ref().map(|addr| {
        info!(addr = %addr, "Starting metrics server");
        serve_metrics(addr.clone(), Arc::clone(metrics))
    })
}

/// Copies controller snapshots into the metrics as a supervised task.
pub fn start_metrics_updater(
    controller: &DynoController,
    metrics: Arc<DynoMetrics>,
) -> Result<TaskHandle, TaskError> {
    let source = controller.clone();
    controller
        .supervisor()
        .start_continuous(TASK_METRICS, METRICS_REFRESH, move |_| {
            metrics.observe(&source.snapshot());
            Ok(())
        })
}
