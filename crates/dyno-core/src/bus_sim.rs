use crate::bus::{BusClient, BusError};
use crate::codec::Fields;
use crate::tags;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Default)]
struct Walk {
    mut_rpm: f64,
    mut_current: f64,
    load_rpm: f64,
    load_current: f64,
    torque: f64,
}

/// Hardware-free bus. Status requests always answer immediately with the
/// next step of a pseudo-random walk; commands are recorded, not acted on.
pub struct SimulatedBus {
    rng: Mutex<ChaCha8Rng>,
    walk: Mutex<Walk>,
    sent: Mutex<HashMap<String, Fields>>,
    closed: AtomicBool,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::from_rng(ChaCha8Rng::from_entropy())
    }

    /// Reproducible walk for tests.
    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(ChaCha8Rng::seed_from_u64(seed))
    }

    fn from_rng(rng: ChaCha8Rng) -> Self {
        info!("Simulated bus opened");
        Self {
            rng: Mutex::new(rng),
            walk: Mutex::new(Walk::default()),
            sent: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Fields of the most recent `message` sent to the bus.
    pub fn last_sent(&self, message: &str) -> Option<Fields> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(message)
            .cloned()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.is_closed() {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }

    fn step(&self, message: &str) -> Option<Fields> {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let mut walk = self.walk.lock().unwrap_or_else(PoisonError::into_inner);
        let mut jitter = |span: i32| f64::from(rng.gen_range(-span..=span));

        let fields: Vec<(&str, f64)> = match message {
            "VESC_Status1_V1" => {
                walk.mut_rpm += jitter(100);
                walk.mut_current += jitter(1);
                vec![
                    (tags::MUT_RPM.key, walk.mut_rpm),
                    (tags::MUT_CURRENT.key, walk.mut_current),
                    (tags::MUT_DUTY.key, walk.mut_current * walk.mut_rpm),
                ]
            }
            "VESC_Status1_V2" => {
                walk.load_rpm = walk.mut_rpm + jitter(100);
                walk.load_current = walk.mut_current + jitter(1);
                vec![
                    (tags::LOAD_RPM.key, walk.load_rpm),
                    (tags::LOAD_CURRENT.key, walk.load_current),
                    (tags::LOAD_DUTY.key, walk.load_current * walk.load_rpm),
                ]
            }
            tags::TORQUE_STATUS_MESSAGE => {
                walk.torque += jitter(100);
                vec![(tags::TORQUE.key, walk.torque)]
            }
            _ => return None,
        };

        Some(
            fields
                .into_iter()
                .map(|(key, value)| (key.to_string(), value))
                .collect(),
        )
    }
}

impl Default for SimulatedBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BusClient for SimulatedBus {
    fn send(&self, message: &str, fields: &Fields) -> Result<(), BusError> {
        self.ensure_open()?;
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(message.to_string(), fields.clone());
        Ok(())
    }

    fn flush_input(&self) -> Result<(), BusError> {
        self.ensure_open()
    }

    fn expect(&self, message: &str, _timeout: Duration) -> Result<Option<Fields>, BusError> {
        self.ensure_open()?;
        Ok(self.step(message))
    }

    fn close(&self) -> Result<(), BusError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("Simulated bus closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_requests_never_time_out() {
        let bus = SimulatedBus::with_seed(7);
        for message in ["VESC_Status1_V1", "VESC_Status1_V2", "TEENSY_Status"] {
            for _ in 0..10 {
                assert!(bus.expect(message, Duration::ZERO).unwrap().is_some());
            }
        }
    }

    #[test]
    fn walk_moves_in_bounded_steps() {
        let bus = SimulatedBus::with_seed(42);
        let mut last = 0.0;
        for _ in 0..100 {
            let fields = bus.expect("VESC_Status1_V1", Duration::ZERO).unwrap().unwrap();
            let rpm = fields["Status_RPM_V1"];
            assert!((rpm - last).abs() <= 100.0);
            let duty = fields["Status_DutyCycle_V1"];
            assert_eq!(duty, fields["Status_TotalCurrent_V1"] * rpm);
            last = rpm;
        }
    }

    #[test]
    fn load_motor_tracks_motor_under_test() {
        let bus = SimulatedBus::with_seed(3);
        let mut_fields = bus.expect("VESC_Status1_V1", Duration::ZERO).unwrap().unwrap();
        let load_fields = bus.expect("VESC_Status1_V2", Duration::ZERO).unwrap().unwrap();
        assert!((load_fields["Status_RPM_V2"] - mut_fields["Status_RPM_V1"]).abs() <= 100.0);
    }

    #[test]
    fn same_seed_gives_same_walk() {
        let a = SimulatedBus::with_seed(99);
        let b = SimulatedBus::with_seed(99);
        for _ in 0..20 {
            assert_eq!(
                a.expect("TEENSY_Status", Duration::ZERO).unwrap(),
                b.expect("TEENSY_Status", Duration::ZERO).unwrap()
            );
        }
    }

    #[test]
    fn records_commands_and_rejects_use_after_close() {
        let bus = SimulatedBus::with_seed(1);
        let fields: Fields = [("Command_RPM_V2".to_string(), 500.0)].into_iter().collect();
        bus.send("VESC_Command_RPM_V2", &fields).unwrap();
        assert_eq!(bus.last_sent("VESC_Command_RPM_V2"), Some(fields.clone()));
        assert_eq!(bus.expect("Unknown", Duration::ZERO).unwrap(), None);

        bus.close().unwrap();
        assert!(bus.is_closed());
        assert!(matches!(
            bus.send("VESC_Command_RPM_V2", &fields),
            Err(BusError::Closed)
        ));
        assert!(matches!(
            bus.expect("VESC_Status1_V1", Duration::ZERO),
            Err(BusError::Closed)
        ));
    }
}
