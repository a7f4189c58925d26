use crate::rig::RigStatus;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("recorder is not open")]
    NotOpen,
    #[error("failed to create {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write telemetry row: {0}")]
    Csv(#[from] csv::Error),
}

/// Telemetry log: one CSV per session, one row per tick.
pub struct Recorder {
    dir: PathBuf,
    writer: Option<csv::Writer<File>>,
    path: Option<PathBuf>,
    rows: u64,
}

impl Recorder {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            writer: None,
            path: None,
            rows: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    /// Path of the current (or last) session file.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Creates `<dir>/YYYY-MM-DD_HH-MM-SS.csv` and writes the header taken
    /// from `status`. An existing file is never overwritten; a `_N` suffix
    /// is added instead.
    pub fn open(&mut self, status: &RigStatus) -> Result<PathBuf, RecorderError> {
        self.close()?;
        std::fs::create_dir_all(&self.dir).map_err(|source| RecorderError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let stamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
        let (path, file) = create_unique(&self.dir, &stamp)?;

        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(status.columns())?;
        writer.flush().map_err(|source| RecorderError::Io {
            path: path.clone(),
            source,
        })?;

        info!(path = %path.display(), "Recording started");
        self.writer = Some(writer);
        self.path = Some(path.clone());
        self.rows = 0;
        Ok(path)
    }

    /// Appends the snapshot values in header order.
    pub fn record(&mut self, status: &RigStatus) -> Result<(), RecorderError> {
        let writer = self.writer.as_mut().ok_or(RecorderError::NotOpen)?;
        writer.write_record(status.row().iter().map(|v| v.to_string()))?;
        self.rows += 1;
        Ok(())
    }

    /// Flushes and releases the file. Safe to call when already closed.
    pub fn close(&mut self) -> Result<(), RecorderError> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        let flushed = writer.flush();
        info!(
            path = %self.path.as_deref().unwrap_or(Path::new("")).display(),
            rows = self.rows,
            "Recording stopped"
        );
        flushed.map_err(|source| RecorderError::Io {
            path: self.path.clone().unwrap_or_default(),
            source,
        })
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Failed to close telemetry log");
        }
    }
}

fn create_unique(dir: &Path, stamp: &str) -> Result<(PathBuf, File), RecorderError> {
    let mut suffix = 0u32;
    loop {
        let name = if suffix == 0 {
            format!("{stamp}.csv")
        } else {
            format!("{stamp}_{suffix}.csv")
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => suffix += 1,
            Err(source) => return Err(RecorderError::Io { path, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Fields;
    use crate::sync::DeviceStatus;
    use std::sync::Arc;

    fn status(rpm: f64, torque: f64) -> RigStatus {
        let motor = |id: u8, rpm: f64| {
            let keys = crate::tags::status_signals(id);
            let fields: Fields = [(keys[0].clone(), rpm)].into_iter().collect();
            Arc::new(DeviceStatus::zeroed(keys.clone()).updated(&fields, |_, v| v))
        };
        let torque_fields: Fields = [("TorqueValue".to_string(), torque)].into_iter().collect();
        RigStatus {
            mut_motor: motor(1, rpm),
            load_motor: motor(2, rpm / 2.0),
            torque: Arc::new(DeviceStatus::zeroed(["TorqueValue"]).updated(&torque_fields, |_, v| v)),
        }
    }

    #[test]
    fn record_before_open_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = Recorder::new(dir.path());
        assert!(matches!(
            recorder.record(&status(1.0, 1.0)),
            Err(RecorderError::NotOpen)
        ));
    }

    #[test]
    fn writes_header_and_rows_in_column_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = Recorder::new(dir.path().join("experimental_results"));
        let path = recorder.open(&status(0.0, 0.0)).unwrap();
        recorder.record(&status(1200.0, 3.5)).unwrap();
        recorder.record(&status(1300.0, 4.0)).unwrap();
        assert_eq!(recorder.rows(), 2);
        recorder.close().unwrap();
        recorder.close().unwrap();

        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with(".csv"));
        assert_eq!(name.len(), "YYYY-MM-DD_HH-MM-SS.csv".len());

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "Status_RPM_V1,Status_TotalCurrent_V1,Status_DutyCycle_V1,\
             Status_RPM_V2,Status_TotalCurrent_V2,Status_DutyCycle_V2,TorqueValue"
        );
        assert_eq!(lines[1], "1200,0,0,600,0,0,3.5");
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn never_overwrites_an_existing_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = Recorder::new(dir.path());
        let mut second = Recorder::new(dir.path());
        let a = first.open(&status(0.0, 0.0)).unwrap();
        let b = second.open(&status(0.0, 0.0)).unwrap();
        assert_ne!(a, b);
        assert!(a.exists() && b.exists());
    }

    #[test]
    fn drop_flushes_buffered_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let mut recorder = Recorder::new(dir.path());
            let path = recorder.open(&status(0.0, 0.0)).unwrap();
            recorder.record(&status(5.0, 1.0)).unwrap();
            path
        };
        let text = std::fs::read_to_string(path).unwrap();
        assert_eq!(text.lines().count(), 2);
    }
}
