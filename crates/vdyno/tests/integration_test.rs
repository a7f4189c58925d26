use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::process::{Child, Command, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};

const SWEEP: &str = r#"{
    "steps": [
        {"action": "hold", "duration": 30,
         "MUT": {"property": "current", "value": 1.5},
         "load_motor": {"property": "rpm", "value": 600}}
    ]
}"#;

struct VdynoProcess {
    child: Child,
    addr: String,
    dir: tempfile::TempDir,
}

impl VdynoProcess {
    fn start() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let experiments = dir.path().join("experiments");
        std::fs::create_dir_all(&experiments).unwrap();
        std::fs::write(experiments.join("sweep.json"), SWEEP).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0")
            .expect("Failed to bind ephemeral port for integration test");
        let bind_addr = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
        drop(listener);

        let child = Command::new(env!("CARGO_BIN_EXE_vdyno"))
            .arg("--seed")
            .arg("3")
            .arg("--bind")
            .arg(&bind_addr)
            .arg("--experiments")
            .arg(&experiments)
            .arg("--recordings")
            .arg(dir.path().join("results"))
            .arg("--journal")
            .arg(dir.path().join("journal.jsonl"))
            .spawn()
            .expect("Failed to start vdyno");

        Self {
            child,
            addr: bind_addr,
            dir,
        }
    }

    fn connect(&self) -> (TcpStream, BufReader<TcpStream>) {
        let start = Instant::now();
        let stream = loop {
            match TcpStream::connect(&self.addr) {
                Ok(stream) => break stream,
                Err(e) => {
                    assert!(start.elapsed() < Duration::from_secs(10), "connect: {e}");
                    thread::sleep(Duration::from_millis(50));
                }
            }
        };
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        (stream, reader)
    }

    fn wait_exit(&mut self, timeout: Duration) -> ExitStatus {
        let start = Instant::now();
        loop {
            if let Some(status) = self.child.try_wait().unwrap() {
                return status;
            }
            assert!(start.elapsed() < timeout, "vdyno did not exit");
            thread::sleep(Duration::from_millis(50));
        }
    }

    fn journal(&self) -> Vec<serde_json::Value> {
        read_journal(&self.dir.path().join("journal.jsonl"))
    }
}

impl Drop for VdynoProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn read_journal(path: &Path) -> Vec<serde_json::Value> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

/// Reads status lines until `pred` holds for one of them.
fn wait_for_status(
    reader: &mut BufReader<TcpStream>,
    mut pred: impl FnMut(&serde_json::Value) -> bool,
) -> serde_json::Value {
    let start = Instant::now();
    let mut line = String::new();
    while start.elapsed() < Duration::from_secs(10) {
        line.clear();
        reader.read_line(&mut line).unwrap();
        let status: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(status["type"], "status");
        if pred(&status) {
            return status;
        }
    }
    panic!("expected status never arrived");
}

#[test]
fn remote_setpoints_are_applied() {
    let vdyno = VdynoProcess::start();
    let (mut stream, mut reader) = vdyno.connect();

    let first = wait_for_status(&mut reader, |_| true);
    assert_eq!(first["authority"], "manual");
    assert!(first["mut"]["Status_RPM_V1"].is_number());

    writeln!(
        stream,
        "{}",
        serde_json::json!({
            "type": "setpoints",
            "protocol_version": {"major": 1, "minor": 0},
            "sequence": 1,
            "mut_current_a": 2.0,
            "load_rpm": 750.0
        })
    )
    .unwrap();

    let status = wait_for_status(&mut reader, |s| s["setpoints"]["load_rpm"] == 750.0);
    assert_eq!(status["setpoints"]["mut_current_a"], 2.0);
}

#[test]
fn out_of_range_setpoints_are_rejected_and_journaled() {
    let vdyno = VdynoProcess::start();
    let (mut stream, mut reader) = vdyno.connect();
    wait_for_status(&mut reader, |_| true);

    writeln!(
        stream,
        r#"{{"type":"setpoints","sequence":1,"mut_current_a":900,"load_rpm":0}}"#
    )
    .unwrap();

    let start = Instant::now();
    while !vdyno
        .journal()
        .iter()
        .any(|e| e["event_type"] == "command_rejected")
    {
        assert!(start.elapsed() < Duration::from_secs(10), "rejection not journaled");
        thread::sleep(Duration::from_millis(50));
    }
    let status = wait_for_status(&mut reader, |_| true);
    assert_eq!(status["setpoints"]["mut_current_a"], 0.0);
}

#[test]
fn remote_commands_run_an_experiment_and_stop_all_exits() {
    let mut vdyno = VdynoProcess::start();
    let (mut stream, mut reader) = vdyno.connect();
    wait_for_status(&mut reader, |_| true);

    writeln!(stream, r#"{{"type":"hello","client_id":"integration"}}"#).unwrap();
    writeln!(stream, r#"{{"type":"select_experiment","name":"sweep.json"}}"#).unwrap();
    writeln!(stream, r#"{{"type":"command","command":"start_experiment"}}"#).unwrap();

    let status = wait_for_status(&mut reader, |s| s["experiment"] == "sweep.json");
    assert_eq!(status["selected_experiment"], "sweep.json");
    let status = wait_for_status(&mut reader, |s| s["setpoints"]["load_rpm"] == 600.0);
    assert_eq!(status["authority"], "experiment");
    assert!(status["recording"].is_object());

    writeln!(stream, r#"{{"type":"command","command":"stop_all"}}"#).unwrap();
    let exit = vdyno.wait_exit(Duration::from_secs(10));
    assert!(exit.success());

    let kinds: Vec<String> = vdyno
        .journal()
        .iter()
        .map(|e| e["event_type"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(kinds.first().map(String::as_str), Some("system_start"));
    assert!(kinds.iter().any(|k| k == "experiment_started"));
    assert!(kinds.iter().any(|k| k == "recording_started"));
    assert_eq!(kinds.last().map(String::as_str), Some("system_shutdown"));

    let results: Vec<_> = std::fs::read_dir(vdyno.dir.path().join("results"))
        .unwrap()
        .collect();
    assert_eq!(results.len(), 1);
}

#[test]
fn without_a_bus_backend_startup_fails() {
    let status = Command::new(env!("CARGO_BIN_EXE_vdyno"))
        .args(["--no-bridge", "--run-seconds", "1"])
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(1));

    let status = Command::new(env!("CARGO_BIN_EXE_vdyno"))
        .arg("--bogus")
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(2));
}

#[test]
fn timed_headless_run_exits_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let journal = dir.path().join("journal.jsonl");
    let status = Command::new(env!("CARGO_BIN_EXE_vdyno"))
        .args(["--sim", "--no-bridge", "--record", "--run-seconds", "1"])
        .arg("--recordings")
        .arg(dir.path().join("results"))
        .arg("--journal")
        .arg(&journal)
        .status()
        .unwrap();
    assert!(status.success());

    let entries = read_journal(&journal);
    assert!(entries.iter().any(|e| e["event_type"] == "recording_stopped"));
    let csv = std::fs::read_dir(dir.path().join("results"))
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    assert!(std::fs::read_to_string(csv).unwrap().lines().count() > 1);
}
