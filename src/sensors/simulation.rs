use std::str::FromStr;

use anyhow::Result;
use rand::Rng;

use crate::db::models::{Device, GateState, Nutrient, Readings, ThresholdSettings};

/// Pull toward `max * tendency` for the first device of a user.
pub const PRIMARY_TENDENCY: f64 = 0.95;
/// Pull toward `max * tendency` for every other device.
pub const SECONDARY_TENDENCY: f64 = 0.85;
/// Fraction of the remaining distance covered per drift step.
const DRIFT_RATE: f64 = 0.1;
/// Per-tick nitrogen change caused by the gate, before nutrient scaling.
const GATE_STEP: f64 = 0.8;
/// Newly paired devices start near this fraction of each max threshold.
const INITIAL_FRACTION: f64 = 0.85;

/// How readings evolve between ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulationPolicy {
    /// Drift toward a fraction of the max threshold with ±1 noise.
    Drift,
    /// Rise while the gate is open, fall while closed, with ±0.5 noise.
    GateEffect,
}

impl FromStr for SimulationPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "drift" => Ok(Self::Drift),
            "gate_effect" => Ok(Self::GateEffect),
            other => Err(anyhow::anyhow!("unknown simulation policy: {other:?}")),
        }
    }
}

/// Clamp a reading into `[0, 100]`. NaN maps to 0.
#[inline]
pub fn clamp_reading(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

/// Scale applied to the gate step per nutrient.
fn gate_coefficient(nutrient: Nutrient) -> f64 {
    match nutrient {
        Nutrient::Nitrogen => 1.0,
        Nutrient::Phosphorus => 0.7,
        Nutrient::Potassium => 0.5,
    }
}

/// Readings for a newly paired device: 85% of each max, ±5.
pub fn initial_readings<R: Rng>(thresholds: &ThresholdSettings, rng: &mut R) -> Readings {
    Readings::from_fn(|n| {
        let noise = (rng.random::<f64>() - 0.5) * 10.0;
        clamp_reading(thresholds.band(n).max * INITIAL_FRACTION + noise)
    })
}

/// Move each reading 10% of the way toward `max * tendency`, plus noise in `[-1, 1]`.
pub fn drift_step<R: Rng>(
    readings: &Readings,
    thresholds: &ThresholdSettings,
    tendency: f64,
    rng: &mut R,
) -> Readings {
    Readings::from_fn(|n| {
        let current = readings.get(n);
        let target = thresholds.band(n).max * tendency;
        let noise = rng.random_range(-1.0..=1.0);
        clamp_reading(current + (target - current) * DRIFT_RATE + noise)
    })
}

/// Nudge each reading by the gate effect, plus noise in `[-0.5, 0.5]`.
///
/// An unknown gate counts as closed.
pub fn gate_effect_step<R: Rng>(
    readings: &Readings,
    gate: Option<GateState>,
    rng: &mut R,
) -> Readings {
    let effect = match gate {
        Some(GateState::Open) => GATE_STEP,
        Some(GateState::Closed) | None => -GATE_STEP,
    };
    Readings::from_fn(|n| {
        let noise = rng.random_range(-0.5..=0.5);
        clamp_reading(readings.get(n) + effect * gate_coefficient(n) + noise)
    })
}

/// Advance every device one tick.
///
/// `thresholds[i]` belongs to `devices[i]`; the first device is the primary
/// one for drift tendency.
pub fn step_devices<R: Rng>(
    devices: &[Device],
    thresholds: &[ThresholdSettings],
    policy: SimulationPolicy,
    rng: &mut R,
) -> Vec<Device> {
    devices
        .iter()
        .zip(thresholds)
        .enumerate()
        .map(|(index, (device, t))| {
            let readings = match policy {
                SimulationPolicy::Drift => {
                    let tendency = if index == 0 { PRIMARY_TENDENCY } else { SECONDARY_TENDENCY };
                    drift_step(&device.readings, t, tendency, rng)
                }
                SimulationPolicy::GateEffect => {
                    gate_effect_step(&device.readings, device.nitrogen_gate, rng)
                }
            };
            Device { readings, ..device.clone() }
        })
        .collect()
}
