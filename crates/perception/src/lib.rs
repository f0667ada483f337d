use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::Serialize;

/// The fixed set of PPE categories the detector reports on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum PpeKind {
    Helmet,
    Gloves,
    Goggles,
    Jacket,
}

impl PpeKind {
    pub const ALL: [PpeKind; 4] = [
        PpeKind::Helmet,
        PpeKind::Gloves,
        PpeKind::Goggles,
        PpeKind::Jacket,
    ];

    /// Fold a raw detector label into a category. Case-insensitive, and
    /// tolerant of the synonym sets the detection models actually emit
    /// ("hard_hat", "kask", "vest", the common "googles" misspelling).
    pub fn from_label(label: &str) -> Option<PpeKind> {
        match label.trim().to_ascii_lowercase().as_str() {
            "helmet" | "kask" | "hard_hat" => Some(PpeKind::Helmet),
            "gloves" | "glove" => Some(PpeKind::Gloves),
            "goggles" | "googles" => Some(PpeKind::Goggles),
            "jacket" | "vest" | "safety vest" => Some(PpeKind::Jacket),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PpeKind::Helmet => "helmet",
            PpeKind::Gloves => "gloves",
            PpeKind::Goggles => "goggles",
            PpeKind::Jacket => "jacket",
        }
    }
}

/// Presence flags for every PPE category. Always fully populated; a category
/// the detector did not report is `false`, never absent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PpeFlags {
    pub helmet: bool,
    pub gloves: bool,
    pub goggles: bool,
    pub jacket: bool,
}

impl PpeFlags {
    pub fn get(&self, kind: PpeKind) -> bool {
        match kind {
            PpeKind::Helmet => self.helmet,
            PpeKind::Gloves => self.gloves,
            PpeKind::Goggles => self.goggles,
            PpeKind::Jacket => self.jacket,
        }
    }

    pub fn set(&mut self, kind: PpeKind, present: bool) {
        match kind {
            PpeKind::Helmet => self.helmet = present,
            PpeKind::Gloves => self.gloves = present,
            PpeKind::Goggles => self.goggles = present,
            PpeKind::Jacket => self.jacket = present,
        }
    }

    pub fn all_present() -> Self {
        Self {
            helmet: true,
            gloves: true,
            goggles: true,
            jacket: true,
        }
    }

    /// Build flags from raw detector labels, folding synonyms and case.
    pub fn from_labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut flags = PpeFlags::default();
        for label in labels {
            if let Some(kind) = PpeKind::from_label(label.as_ref()) {
                flags.set(kind, true);
            }
        }
        flags
    }
}

/// Normalized per-frame input to the decision engine. Immutable once built.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PerceptionSnapshot {
    /// Monotonically non-decreasing within a stream session.
    pub frame_index: u64,
    pub person_present: bool,
    pub ppe: PpeFlags,
    /// `None` when the temperature sensor is unavailable.
    pub temperature_c: Option<f64>,
}

impl PerceptionSnapshot {
    pub fn new(
        frame_index: u64,
        person_present: bool,
        ppe: PpeFlags,
        temperature_c: Option<f64>,
    ) -> Self {
        Self {
            frame_index,
            person_present,
            ppe,
            temperature_c,
        }
    }

    /// Assemble a snapshot straight from detector output. `labels` is the raw
    /// per-frame label list; person detection rides in the same list.
    pub fn from_labels<I, S>(frame_index: u64, labels: I, temperature_c: Option<f64>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut person_present = false;
        let mut ppe = PpeFlags::default();
        for label in labels {
            let label = label.as_ref();
            if label.trim().eq_ignore_ascii_case("person") {
                person_present = true;
            } else if let Some(kind) = PpeKind::from_label(label) {
                ppe.set(kind, true);
            }
        }
        Self {
            frame_index,
            person_present,
            ppe,
            temperature_c,
        }
    }
}

/// A temperature source. A real driver returns `None` on fault instead of a
/// plausible fake value.
pub trait TemperatureSensor {
    fn read_temperature(&mut self) -> Option<f64>;
}

#[derive(Clone, Copy, Debug)]
pub enum SensorFault {
    None,
    Stuck { value: f64 },
    Bias { value: f64 },
    DropoutEvery { n: u64 },
}

/// Simulated workstation temperature: a seeded uniform draw over
/// `base_c..base_c + swing_c` plus Gaussian noise, with injectable faults.
#[derive(Clone, Debug)]
pub struct SimulatedSensor {
    pub base_c: f64,
    pub swing_c: f64,
    pub noise_std: f64,
    pub fault: SensorFault,
    rng: StdRng,
    step_count: u64,
}

impl SimulatedSensor {
    pub fn new(seed: u64) -> Self {
        Self {
            base_c: 30.0,
            swing_c: 20.0,
            noise_std: 0.25,
            fault: SensorFault::None,
            rng: StdRng::seed_from_u64(seed),
            step_count: 0,
        }
    }
}

impl TemperatureSensor for SimulatedSensor {
    fn read_temperature(&mut self) -> Option<f64> {
        self.step_count += 1;

        let mut v = match self.fault {
            SensorFault::None => self.base_c + self.rng.gen::<f64>() * self.swing_c,
            SensorFault::Stuck { value } => value,
            SensorFault::Bias { value } => self.base_c + self.rng.gen::<f64>() * self.swing_c + value,
            SensorFault::DropoutEvery { n } => {
                if n > 0 && self.step_count % n == 0 {
                    return None;
                }
                self.base_c + self.rng.gen::<f64>() * self.swing_c
            }
        };

        if self.noise_std > 0.0 {
            let normal = Normal::new(0.0, self.noise_std).unwrap();
            v += normal.sample(&mut self.rng);
        }

        Some(v)
    }
}

/// Latest-wins handoff from the perception worker to the decision loop.
///
/// Bounded to depth 1: when the producer outruns the consumer, the queued
/// older snapshot is discarded in favor of the newer one, so delivered
/// snapshots always arrive in `frame_index` order.
pub fn snapshot_channel() -> (SnapshotSender, SnapshotReceiver) {
    let (tx, rx) = bounded(1);
    (
        SnapshotSender {
            tx,
            drain: rx.clone(),
        },
        SnapshotReceiver { rx },
    )
}

pub struct SnapshotSender {
    tx: Sender<PerceptionSnapshot>,
    drain: Receiver<PerceptionSnapshot>,
}

impl SnapshotSender {
    /// Publish a snapshot, superseding an undelivered older one if present.
    /// A disconnected consumer (session ended) is not an error.
    pub fn publish(&self, snapshot: PerceptionSnapshot) {
        let mut pending = snapshot;
        loop {
            match self.tx.try_send(pending) {
                Ok(()) => return,
                Err(TrySendError::Full(snap)) => {
                    let _ = self.drain.try_recv();
                    pending = snap;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

pub struct SnapshotReceiver {
    rx: Receiver<PerceptionSnapshot>,
}

impl SnapshotReceiver {
    /// Block until the next snapshot; `None` once the producer is gone.
    pub fn recv(&self) -> Option<PerceptionSnapshot> {
        self.rx.recv().ok()
    }

    pub fn try_recv(&self) -> Option<PerceptionSnapshot> {
        self.rx.try_recv().ok()
    }
}
