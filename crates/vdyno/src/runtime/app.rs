use crate::infra::journal::{EventJournal, JournalEventType};
use crate::runtime::config::RuntimeConfig;
use crate::runtime::logging::init_tracing;
use crate::runtime::telemetry;
use dyno_core::controller::{ControllerEvent, EventSink};
use dyno_core::supervisor::TaskEvent;
use dyno_core::{
    CalibrationError, CalibrationTable, CommandLimits, ControlConfig, ControllerConfig,
    ControllerError, DynoController, OperatorCommand, Rig, SimulatedBus, TaskError,
    TaskSupervisor, View, VIEW_REFRESH,
};
use dyno_io::bridge::{Bridge, BridgeConfig, BridgeError, RemoteView};
use dyno_io::metrics::DynoMetrics;
use std::path::PathBuf;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

pub const TASK_BRIDGE: &str = "bridge";
const MAIN_TICK: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("no hardware bus adapter is available; run with --sim")]
    NoBus,
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error(transparent)]
    Controller(#[from] ControllerError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error("failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("failed to open journal {}: {source}", path.display())]
    Journal {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Parses argv, runs, and returns the process exit code.
pub fn run_from_args() -> i32 {
    let config = match RuntimeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("vdyno: {e} (try --help)");
            return 2;
        }
    };
    if config.show_help {
        RuntimeConfig::print_help();
        return 0;
    }

    let _log_guard = init_tracing(config.json_logs, config.log_dir.as_deref());
    match run(config) {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "vdyno failed");
            1
        }
    }
}

fn journal_write(
    journal: &Option<Arc<EventJournal>>,
    write: impl FnOnce(&EventJournal) -> std::io::Result<()>,
) {
    if let Some(journal) = journal {
        if let Err(e) = write(journal) {
            warn!(error = %e, "Failed to write journal entry");
        }
    }
}

pub fn run(config: RuntimeConfig) -> Result<(), RuntimeError> {
    if !config.sim {
        return Err(RuntimeError::NoBus);
    }

    let metrics = Arc::new(DynoMetrics::new()?);
    let _metrics_server = telemetry::start_metrics_server(&config.metrics_addr, &metrics);

    let journal = match &config.journal_path {
        Some(path) => Some(Arc::new(EventJournal::open(path).map_err(|source| {
            RuntimeError::Journal {
                path: path.clone(),
                source,
            }
        })?)),
        None => None,
    };
    journal_write(&journal, |j| {
        j.log(
            JournalEventType::SystemStart,
            serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "seed": config.seed,
                "bridge_enabled": config.bridge_enabled,
                "metrics_enabled": config.metrics_addr.is_some(),
            }),
        )
    });

    let calibration = match &config.calibration_path {
        Some(path) => CalibrationTable::load(path)?,
        None => CalibrationTable::default(),
    };
    info!(entries = calibration.len(), "Calibration loaded");

    let bus = Arc::new(match config.seed {
        Some(seed) => SimulatedBus::with_seed(seed),
        None => SimulatedBus::new(),
    });
    info!(seed = ?config.seed, "Using simulated bus");
    let rig = Arc::new(Rig::new(bus, calibration));

    let supervisor = {
        let metrics = Arc::clone(&metrics);
        let journal = journal.clone();
        TaskSupervisor::with_listener(move |event: &TaskEvent| {
            metrics.record_task_event(event);
            journal_write(&journal, |j| j.record_task_event(event));
        })
    };
    let events: EventSink = {
        let metrics = Arc::clone(&metrics);
        let journal = journal.clone();
        Box::new(move |event: &ControllerEvent| {
            if let ControllerEvent::CommandRejected { source, .. } = event {
                metrics.record_rejection(source);
            }
            journal_write(&journal, |j| j.record_controller_event(event));
        })
    };

    let controller_config = ControllerConfig {
        control: ControlConfig {
            limits: CommandLimits {
                max_abs_current_a: config.max_current_a,
                max_abs_rpm: config.max_rpm,
            },
            ..ControlConfig::default()
        },
        recordings_dir: config.recordings_dir.clone(),
        experiments_dir: config.experiments_dir.clone(),
        ..ControllerConfig::default()
    };
    info!(
        max_current_a = config.max_current_a,
        max_rpm = config.max_rpm,
        experiments = %config.experiments_dir.display(),
        recordings = %config.recordings_dir.display(),
        "Starting controller"
    );
    let controller =
        DynoController::with_supervisor(rig, controller_config, supervisor, Some(events));

    let outcome = serve(&controller, &config, &metrics);

    if let Err(e) = controller.shutdown() {
        warn!(error = %e, "Bus did not close cleanly");
    }
    journal_write(&journal, |j| {
        j.log(
            JournalEventType::SystemShutdown,
            serde_json::json!({ "error": outcome.as_ref().err().map(|e| e.to_string()) }),
        )
    });
    info!("vdyno stopped");
    outcome
}

/// Starts every task and dispatches remote commands until the run ends.
fn serve(
    controller: &DynoController,
    config: &RuntimeConfig,
    metrics: &Arc<DynoMetrics>,
) -> Result<(), RuntimeError> {
    controller.start_monitoring()?;
    telemetry::start_metrics_updater(controller, Arc::clone(metrics))?;

    let remote = if config.bridge_enabled {
        let bridge = Bridge::bind(BridgeConfig {
            bind_addr: config.bind_addr.clone(),
            require_handshake: config.bridge_require_handshake,
            ..BridgeConfig::default()
        })?
        .with_metrics(Arc::clone(metrics));
        let (view, commands) = RemoteView::new();
        controller.attach_view(view.clone(), VIEW_REFRESH)?;

        let bridge_view = Arc::clone(&view);
        controller.supervisor().start_once(TASK_BRIDGE, move |stop| {
            bridge.run(bridge_view, stop);
            Ok(())
        })?;
        Some((view, commands))
    } else {
        info!("Bridge disabled");
        None
    };

    if config.record {
        let path = controller.start_recording()?;
        info!(path = %path.display(), "Recording started");
    }
    if let Some(name) = &config.experiment {
        controller.start_experiment(name)?;
    }

    let deadline = config
        .run_seconds
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    info!(run_seconds = ?config.run_seconds, "vdyno running");

    loop {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            info!("Run time elapsed");
            return Ok(());
        }
        match &remote {
            Some((view, commands)) => match commands.recv_timeout(MAIN_TICK) {
                Ok(OperatorCommand::StopAll) => {
                    info!("Stop-all requested by remote view");
                    return Ok(());
                }
                Ok(command) => dispatch(controller, &**view, command),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Ok(()),
            },
            None => thread::sleep(MAIN_TICK),
        }
    }
}

fn dispatch(controller: &DynoController, view: &dyn View, command: OperatorCommand) {
    let result = match command {
        OperatorCommand::StartRecording => controller.start_recording().map(|path| {
            info!(path = %path.display(), "Recording started");
        }),
        OperatorCommand::StopRecording => {
            if !controller.stop_recording() {
                info!("No recording to stop");
            }
            Ok(())
        }
        OperatorCommand::StartExperiment => controller
            .start_selected_experiment(view)
            .map(|handle| info!(task = handle.name(), "Experiment started")),
        OperatorCommand::StopExperiment => {
            if !controller.stop_experiment() {
                info!("No experiment to stop");
            }
            Ok(())
        }
        OperatorCommand::StopAll => {
            controller.stop_all();
            Ok(())
        }
    };
    if let Err(e) = result {
        warn!(command = command.as_str(), error = %e, "Operator command failed");
    }
}
