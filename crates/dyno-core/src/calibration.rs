//! Per-signal linear calibration.
//!
//! Every calibrated signal maps a raw bus value to physical units with
//! `physical = raw * factor + offset`. Signals without an entry pass through
//! unscaled so that uncalibrated fields still reach the status snapshot.

use serde::Deserialize;
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationEntry {
    factor: f64,
    offset: f64,
}

impl CalibrationEntry {
    /// Returns `None` for a zero or non-finite factor.
    pub fn new(factor: f64, offset: f64) -> Option<Self> {
        if factor == 0.0 || !factor.is_finite() || !offset.is_finite() {
            return None;
        }
        Some(Self { factor, offset })
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    pub fn decode(&self, raw: f64) -> f64 {
        raw * self.factor + self.offset
    }

    pub fn encode(&self, physical: f64) -> f64 {
        (physical - self.offset) / self.factor
    }
}

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("failed to read calibration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{origin}: unreadable calibration header: {source}")]
    Header {
        origin: String,
        #[source]
        source: csv::Error,
    },
    #[error("{origin}:{line}: malformed calibration row: {source}")]
    Row {
        origin: String,
        line: u64,
        #[source]
        source: csv::Error,
    },
    #[error("{origin}:{line}: calibration row has an empty signal name")]
    EmptyName { origin: String, line: u64 },
    #[error("{origin}:{line}: signal {name} has an invalid factor {factor} (must be finite and non-zero)")]
    InvalidFactor {
        origin: String,
        line: u64,
        name: String,
        factor: f64,
    },
    #[error("{origin}:{line}: signal {name} has a non-finite offset {offset}")]
    InvalidOffset {
        origin: String,
        line: u64,
        name: String,
        offset: f64,
    },
}

#[derive(Debug, Deserialize)]
struct CalibrationRow {
    name: String,
    factor: f64,
    offset: f64,
}

/// Immutable calibration lookup, keyed by signal name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationTable {
    entries: HashMap<String, CalibrationEntry>,
}

impl CalibrationTable {
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, CalibrationEntry)>,
        S: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(name, entry)| (name.into(), entry))
                .collect(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, CalibrationError> {
        let file = std::fs::File::open(path).map_err(|source| CalibrationError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_reader(file, &path.display().to_string())
    }

    /// Parses `name,factor,offset` CSV. `origin` names the source in errors.
    pub fn from_reader<R: Read>(reader: R, origin: &str) -> Result<Self, CalibrationError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = reader
            .headers()
            .map_err(|source| CalibrationError::Header {
                origin: origin.to_string(),
                source,
            })?
            .clone();

        let mut entries = HashMap::new();
        for result in reader.records() {
            let record = result.map_err(|source| CalibrationError::Row {
                origin: origin.to_string(),
                line: source.position().map(|p| p.line()).unwrap_or(0),
                source,
            })?;
            let line = record.position().map(|p| p.line()).unwrap_or(0);
            let row: CalibrationRow =
                record
                    .deserialize(Some(&headers))
                    .map_err(|source| CalibrationError::Row {
                        origin: origin.to_string(),
                        line,
                        source,
                    })?;

            if row.name.is_empty() {
                return Err(CalibrationError::EmptyName {
                    origin: origin.to_string(),
                    line,
                });
            }
            if !row.offset.is_finite() {
                return Err(CalibrationError::InvalidOffset {
                    origin: origin.to_string(),
                    line,
                    name: row.name,
                    offset: row.offset,
                });
            }
            let entry = CalibrationEntry::new(row.factor, row.offset).ok_or_else(|| {
                CalibrationError::InvalidFactor {
                    origin: origin.to_string(),
                    line,
                    name: row.name.clone(),
                    factor: row.factor,
                }
            })?;
            entries.insert(row.name, entry);
        }

        Ok(Self { entries })
    }

    pub fn get(&self, signal: &str) -> Option<&CalibrationEntry> {
        self.entries.get(signal)
    }

    pub fn contains(&self, signal: &str) -> bool {
        self.entries.contains_key(signal)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Raw bus value to physical units.
    pub fn decode(&self, signal: &str, raw: f64) -> f64 {
        match self.entries.get(signal) {
            Some(entry) => entry.decode(raw),
            None => raw,
        }
    }

    /// Physical units to raw bus value.
    pub fn encode(&self, signal: &str, physical: f64) -> f64 {
        match self.entries.get(signal) {
            Some(entry) => entry.encode(physical),
            None => physical,
        }
    }
}
