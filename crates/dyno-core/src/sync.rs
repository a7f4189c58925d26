use crate::codec::Fields;
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

/// Latest calibrated telemetry of one device.
///
/// The key set and order are fixed when the device is built; every snapshot
/// derived from it carries the same columns.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStatus {
    keys: Arc<[String]>,
    values: Vec<f64>,
}

impl DeviceStatus {
    pub fn zeroed<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys: Arc<[String]> = keys.into_iter().map(Into::into).collect();
        let values = vec![0.0; keys.len()];
        Self { keys, values }
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.keys
            .iter()
            .position(|k| k == key)
            .map(|idx| self.values[idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.keys
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().copied())
    }

    /// New snapshot with the decoded `fields` mapped through `scale`. Keys
    /// absent from `fields` keep their previous value; unknown fields are
    /// ignored so the shape never changes.
    pub fn updated(&self, fields: &Fields, scale: impl Fn(&str, f64) -> f64) -> Self {
        let values = self
            .keys
            .iter()
            .zip(&self.values)
            .map(|(key, previous)| match fields.get(key) {
                Some(raw) => scale(key, *raw),
                None => *previous,
            })
            .collect();
        Self {
            keys: Arc::clone(&self.keys),
            values,
        }
    }
}

impl Serialize for DeviceStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.keys.len()))?;
        for (key, value) in self.iter() {
            map.serialize_entry(key, &value)?;
        }
        map.end()
    }
}

/// Single-writer, many-reader holder of a [`DeviceStatus`].
///
/// Readers get an `Arc` to a complete snapshot; the writer swaps in a new
/// one under a short write lock, so a half-updated status is never visible.
#[derive(Debug)]
pub struct StatusCell {
    current: RwLock<Arc<DeviceStatus>>,
}

impl StatusCell {
    pub fn new(initial: DeviceStatus) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    pub fn snapshot(&self) -> Arc<DeviceStatus> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn publish(&self, status: DeviceStatus) {
        let status = Arc::new(status);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = status;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Setpoints {
    pub mut_current_a: f64,
    pub load_rpm: f64,
}

impl Setpoints {
    pub const ZERO: Setpoints = Setpoints {
        mut_current_a: 0.0,
        load_rpm: 0.0,
    };
}

/// Who currently owns the rig's setpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Authority {
    #[default]
    Manual,
    Experiment,
}

#[derive(Debug, Default)]
struct ExchangeState {
    authority: Authority,
    manual: Setpoints,
    scripted: Setpoints,
}

/// Desired setpoints from the operator and from a running experiment.
///
/// Only the active authority's values are handed to the control task, so
/// manual input and a script never command the devices at the same time.
#[derive(Debug, Default)]
pub struct SetpointExchange {
    state: Mutex<ExchangeState>,
}

impl SetpointExchange {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ExchangeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Called by the control task every cycle
    pub fn active(&self) -> Setpoints {
        let state = self.lock();
        match state.authority {
            Authority::Manual => state.manual,
            Authority::Experiment => state.scripted,
        }
    }

    pub fn authority(&self) -> Authority {
        self.lock().authority
    }

    /// Operator input; ignored while an experiment holds authority.
    pub fn set_manual(&self, setpoints: Setpoints) -> bool {
        let mut state = self.lock();
        if state.authority != Authority::Manual {
            return false;
        }
        state.manual = setpoints;
        true
    }

    pub fn manual(&self) -> Setpoints {
        self.lock().manual
    }

    /// Hands authority to an experiment, starting from zero setpoints.
    /// Returns false if an experiment already holds it.
    pub fn claim_experiment(&self) -> bool {
        let mut state = self.lock();
        if state.authority == Authority::Experiment {
            return false;
        }
        state.authority = Authority::Experiment;
        state.scripted = Setpoints::ZERO;
        true
    }

    pub fn set_scripted_current(&self, amps: f64) -> bool {
        let mut state = self.lock();
        if state.authority != Authority::Experiment {
            return false;
        }
        state.scripted.mut_current_a = amps;
        true
    }

    pub fn set_scripted_rpm(&self, rpm: f64) -> bool {
        let mut state = self.lock();
        if state.authority != Authority::Experiment {
            return false;
        }
        state.scripted.load_rpm = rpm;
        true
    }

    /// Returns authority to the operator with every setpoint at zero.
    pub fn release_to_manual(&self) {
        let mut state = self.lock();
        state.authority = Authority::Manual;
        state.manual = Setpoints::ZERO;
        state.scripted = Setpoints::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, f64)]) -> Fields {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn updated_keeps_shape_and_previous_values() {
        let status = DeviceStatus::zeroed(["a", "b", "c"]);
        let next = status.updated(&fields(&[("b", 2.0), ("zzz", 9.0)]), |_, v| v * 10.0);
        assert_eq!(next.keys(), status.keys());
        assert_eq!(next.values(), &[0.0, 20.0, 0.0]);
        assert_eq!(next.get("zzz"), None);
    }

    #[test]
    fn status_serializes_in_key_order() {
        let status = DeviceStatus::zeroed(["z", "a"]).updated(&fields(&[("z", 1.0)]), |_, v| v);
        assert_eq!(serde_json::to_string(&status).unwrap(), r#"{"z":1.0,"a":0.0}"#);
    }

    #[test]
    fn readers_keep_their_snapshot_across_publish() {
        let cell = StatusCell::new(DeviceStatus::zeroed(["x"]));
        let before = cell.snapshot();
        cell.publish(before.updated(&fields(&[("x", 5.0)]), |_, v| v));
        assert_eq!(before.get("x"), Some(0.0));
        assert_eq!(cell.snapshot().get("x"), Some(5.0));
    }

    #[test]
    fn concurrent_readers_never_see_torn_snapshots() {
        let cell = Arc::new(StatusCell::new(DeviceStatus::zeroed(["a", "b"])));
        let writer = {
            let cell = Arc::clone(&cell);
            std::thread::spawn(move || {
                for i in 0..2000 {
                    let v = f64::from(i);
                    let next = cell.snapshot().updated(&fields(&[("a", v), ("b", v)]), |_, v| v);
                    cell.publish(next);
                }
            })
        };
        for _ in 0..2000 {
            let snap = cell.snapshot();
            assert_eq!(snap.get("a"), snap.get("b"));
        }
        writer.join().unwrap();
    }

    #[test]
    fn manual_input_is_ignored_while_experiment_holds_authority() {
        let exchange = SetpointExchange::new();
        assert!(exchange.set_manual(Setpoints {
            mut_current_a: 3.0,
            load_rpm: 200.0
        }));
        assert_eq!(exchange.active().mut_current_a, 3.0);

        assert!(exchange.claim_experiment());
        assert!(!exchange.claim_experiment());
        assert_eq!(exchange.active(), Setpoints::ZERO);
        assert!(!exchange.set_manual(Setpoints {
            mut_current_a: 9.0,
            load_rpm: 900.0
        }));
        assert!(exchange.set_scripted_rpm(450.0));
        assert_eq!(exchange.active().load_rpm, 450.0);

        exchange.release_to_manual();
        assert_eq!(exchange.authority(), Authority::Manual);
        assert_eq!(exchange.active(), Setpoints::ZERO);
        assert!(!exchange.set_scripted_current(1.0));
    }
}
