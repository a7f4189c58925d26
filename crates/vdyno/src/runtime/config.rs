use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} requires a value")]
    MissingValue(String),
    #[error("invalid value {value:?} for {flag}")]
    InvalidValue { flag: String, value: String },
    #[error("unknown option {0}")]
    UnknownOption(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub show_help: bool,
    pub sim: bool,
    pub seed: Option<u64>,
    pub calibration_path: Option<PathBuf>,
    pub experiments_dir: PathBuf,
    pub recordings_dir: PathBuf,
    pub bind_addr: String,
    pub bridge_enabled: bool,
    pub bridge_require_handshake: bool,
    pub run_seconds: Option<u64>,
    pub json_logs: bool,
    pub log_dir: Option<PathBuf>,
    pub metrics_addr: Option<String>,
    pub journal_path: Option<PathBuf>,
    pub max_current_a: f64,
    pub max_rpm: f64,
    pub record: bool,
    pub experiment: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            show_help: false,
            sim: false,
            seed: None,
            calibration_path: None,
            experiments_dir: PathBuf::from("experiments"),
            recordings_dir: PathBuf::from("experimental_results"),
            bind_addr: "127.0.0.1:7000".to_string(),
            bridge_enabled: true,
            bridge_require_handshake: false,
            run_seconds: None,
            json_logs: false,
            log_dir: None,
            metrics_addr: None,
            journal_path: None,
            max_current_a: 60.0,
            max_rpm: 10_000.0,
            record: false,
            experiment: None,
        }
    }
}

struct Args<'a> {
    args: &'a [String],
    pos: usize,
}

impl<'a> Args<'a> {
    fn value(&mut self, flag: &str) -> Result<&'a str, ConfigError> {
        self.pos += 1;
        self.args
            .get(self.pos)
            .map(String::as_str)
            .ok_or_else(|| ConfigError::MissingValue(flag.to_string()))
    }

    fn parsed<T: std::str::FromStr>(&mut self, flag: &str) -> Result<T, ConfigError> {
        let raw = self.value(flag)?;
        raw.parse().map_err(|_| ConfigError::InvalidValue {
            flag: flag.to_string(),
            value: raw.to_string(),
        })
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let args: Vec<String> = std::env::args().collect();
        Self::from_args(&args)
    }

    /// Parses `args`, where `args[0]` is the program name.
    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        let mut cfg = RuntimeConfig::default();
        let mut it = Args { args, pos: 1 };
        while let Some(flag) = args.get(it.pos) {
            let flag = flag.as_str();
            match flag {
                "--sim" => cfg.sim = true,
                "--seed" => {
                    cfg.seed = Some(it.parsed(flag)?);
                    cfg.sim = true;
                }
                "--calibration" => cfg.calibration_path = Some(PathBuf::from(it.value(flag)?)),
                "--experiments" => cfg.experiments_dir = PathBuf::from(it.value(flag)?),
                "--recordings" => cfg.recordings_dir = PathBuf::from(it.value(flag)?),
                "--bind" => cfg.bind_addr = it.value(flag)?.to_string(),
                "--no-bridge" => cfg.bridge_enabled = false,
                "--require-handshake" => cfg.bridge_require_handshake = true,
                "--run-seconds" => cfg.run_seconds = Some(it.parsed(flag)?),
                "--json-logs" => cfg.json_logs = true,
                "--log-dir" => cfg.log_dir = Some(PathBuf::from(it.value(flag)?)),
                "--metrics-addr" => cfg.metrics_addr = Some(it.value(flag)?.to_string()),
                "--journal" => cfg.journal_path = Some(PathBuf::from(it.value(flag)?)),
                "--max-current" => cfg.max_current_a = positive(flag, it.parsed(flag)?)?,
                "--max-rpm" => cfg.max_rpm = positive(flag, it.parsed(flag)?)?,
                "--record" => cfg.record = true,
                "--experiment" => cfg.experiment = Some(it.value(flag)?.to_string()),
                "--help" | "-h" => {
                    cfg.show_help = true;
                    break;
                }
                other => return Err(ConfigError::UnknownOption(other.to_string())),
            }
            it.pos += 1;
        }
        Ok(cfg)
    }

    pub fn print_help() {
        println!(
            r#"vdyno - Virtual dynamometer control and telemetry engine

USAGE:
    vdyno [OPTIONS]

OPTIONS:
    --sim                   Run against the simulated bus
    --seed <N>              Seed for the simulated bus (implies --sim)
    --calibration <PATH>    Calibration CSV (name,factor,offset)
    --experiments <DIR>     Experiment script directory [default: experiments]
    --recordings <DIR>      Telemetry log directory [default: experimental_results]
    --bind <ADDR>           Remote view TCP bind address [default: 127.0.0.1:7000]
    --no-bridge             Disable the remote view bridge
    --require-handshake     Require a hello before accepting remote input
    --run-seconds <SECS>    Run for a fixed duration then exit
    --json-logs             Output logs in JSON format
    --log-dir <DIR>         Also write logs to a daily rolling file in DIR
    --metrics-addr <ADDR>   Enable Prometheus metrics server on address (e.g., 0.0.0.0:9090)
    --journal <PATH>        Append operational events to a JSONL journal
    --max-current <AMPS>    Largest accepted current setpoint magnitude [default: 60]
    --max-rpm <RPM>         Largest accepted speed setpoint magnitude [default: 10000]
    --record                Start recording telemetry at startup
    --experiment <NAME>     Run an experiment script at startup
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log filter (e.g., RUST_LOG=debug,dyno_core=trace)

EXAMPLES:
    # Simulated rig with metrics
    vdyno --sim --metrics-addr 0.0.0.0:9090

    # Unattended experiment run
    vdyno --sim --no-bridge --experiment sweep.json --run-seconds 30 --journal journal.jsonl
"#
        );
    }
}

fn positive(flag: &str, value: f64) -> Result<f64, ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(ConfigError::InvalidValue {
            flag: flag.to_string(),
            value: value.to_string(),
        })
    }
}
