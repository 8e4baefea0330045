//! Sensor signal model.
//!
//! Stateless computations for thermal drift, tool wear, vibration, power
//! draw and measurement jitter. Every random draw comes from the caller's
//! generator so a seeded run replays exactly.

use crate::error::{ConfigError, SignalError};
use heapless::Vec;
use rand::Rng;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

/// Upper bound on metrics a single reading carries.
pub const MAX_METRICS: usize = 8;

// Milling emits the widest set: temperature, power, rpm, feed, vibration.
const_assert!(MAX_METRICS >= 5);

const VIBRATION_POWER_FACTOR: f64 = 0.1;
const VIBRATION_NOISE_MAX: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MachineType {
    Saw,
    Milling,
    Lathe,
}

impl MachineType {
    pub fn as_str(self) -> &'static str {
        match self {
            MachineType::Saw => "Saw",
            MachineType::Milling => "Milling",
            MachineType::Lathe => "Lathe",
        }
    }
}

impl core::str::FromStr for MachineType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Saw" | "saw" => Ok(MachineType::Saw),
            "Milling" | "milling" => Ok(MachineType::Milling),
            "Lathe" | "lathe" => Ok(MachineType::Lathe),
            other => Err(ConfigError::UnknownMachineType(other.to_string())),
        }
    }
}

impl core::fmt::Display for MachineType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Temperature,
    Power,
    BladeSpeed,
    MaterialFeed,
    RpmSpindle,
    FeedRate,
    VibrationLevel,
    CutDepth,
}

impl Metric {
    pub fn as_str(self) -> &'static str {
        match self {
            Metric::Temperature => "temperature",
            Metric::Power => "power",
            Metric::BladeSpeed => "blade_speed",
            Metric::MaterialFeed => "material_feed",
            Metric::RpmSpindle => "rpm_spindle",
            Metric::FeedRate => "feed_rate",
            Metric::VibrationLevel => "vibration_level",
            Metric::CutDepth => "cut_depth",
        }
    }
}

/// Ordered metric set of one reading. Serializes as a JSON object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metrics {
    values: Vec<(Metric, f64), MAX_METRICS>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces an existing value or appends a new one.
    pub fn set(&mut self, metric: Metric, value: f64) {
        if let Some(slot) = self.values.iter_mut().find(|(m, _)| *m == metric) {
            slot.1 = value;
            return;
        }
        // Capacity covers every Metric variant.
        let _ = self.values.push((metric, value));
    }

    pub fn get(&self, metric: Metric) -> Option<f64> {
        self.values.iter().find(|(m, _)| *m == metric).map(|(_, v)| *v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Metric, f64)> + '_ {
        self.values.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Serialize for Metrics {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (metric, value) in &self.values {
            map.serialize_entry(metric.as_str(), value)?;
        }
        map.end()
    }
}

/// Per-type physical constants.
#[derive(Debug, Clone, PartialEq)]
pub struct PhysicsConstants {
    pub ambient_temp_c: f64,
    /// Asymptote approached while processing.
    pub processing_temp_c: f64,
    pub heat_tau_s: f64,
    pub cool_tau_s: f64,
    /// Wear accrued per processing second with a quality-1.0 tool.
    pub wear_rate: f64,
    /// Wear level at which the machine raises its alert flag.
    pub wear_warning: f64,
    pub vibration_wear_coeff: f64,
    /// Symmetric jitter applied to raw actuation metrics, as a fraction of nominal.
    pub jitter_fraction: f64,
}

impl Default for PhysicsConstants {
    fn default() -> Self {
        Self {
            ambient_temp_c: 20.0,
            processing_temp_c: 40.0,
            heat_tau_s: 240.0,
            cool_tau_s: 480.0,
            wear_rate: 1.0e-4,
            wear_warning: 0.8,
            vibration_wear_coeff: 0.2,
            jitter_fraction: 0.02,
        }
    }
}

impl PhysicsConstants {
    /// Reference constants for a machine type.
    pub fn for_type(machine_type: MachineType) -> Self {
        let base = Self::default();
        match machine_type {
            MachineType::Saw => Self {
                processing_temp_c: 32.0,
                heat_tau_s: 180.0,
                wear_rate: 1.5e-4,
                ..base
            },
            MachineType::Milling => Self {
                processing_temp_c: 45.0,
                heat_tau_s: 300.0,
                ..base
            },
            MachineType::Lathe => Self {
                processing_temp_c: 38.0,
                wear_rate: 0.8e-4,
                ..base
            },
        }
    }

    pub fn validate(&self) -> Result<(), SignalError> {
        for tau in [self.heat_tau_s, self.cool_tau_s] {
            if !(tau.is_finite() && tau > 0.0) {
                return Err(SignalError::InvalidTimeConstant(tau));
            }
        }
        let checks = [
            ("ambient_temp_c", self.ambient_temp_c, self.ambient_temp_c.is_finite(), "must be finite"),
            (
                "processing_temp_c",
                self.processing_temp_c,
                self.processing_temp_c.is_finite() && self.processing_temp_c >= self.ambient_temp_c,
                "must be finite and not below ambient",
            ),
            ("wear_rate", self.wear_rate, self.wear_rate.is_finite() && self.wear_rate >= 0.0, "must be finite and >= 0"),
            (
                "wear_warning",
                self.wear_warning,
                self.wear_warning.is_finite() && self.wear_warning > 0.0,
                "must be finite and > 0",
            ),
            (
                "vibration_wear_coeff",
                self.vibration_wear_coeff,
                self.vibration_wear_coeff.is_finite() && self.vibration_wear_coeff >= 0.0,
                "must be finite and >= 0",
            ),
            (
                "jitter_fraction",
                self.jitter_fraction,
                self.jitter_fraction.is_finite() && (0.0..1.0).contains(&self.jitter_fraction),
                "must be in [0, 1)",
            ),
        ];
        for (name, value, ok, reason) in checks {
            if !ok {
                return Err(SignalError::InvalidConstant { name, value, reason });
            }
        }
        Ok(())
    }
}

/// Thermal regime a machine is in during a time step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Load {
    Idle,
    Processing,
}

/// Nominal actuation setpoints drawn once per machine per run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Baseline {
    /// Blade speed for saws, spindle rpm otherwise.
    pub primary: f64,
    /// Material feed, feed rate or cut depth depending on type.
    pub secondary: f64,
}

impl Baseline {
    pub fn draw<R: Rng + ?Sized>(machine_type: MachineType, rng: &mut R) -> Self {
        let ((p_lo, p_hi), (s_lo, s_hi)) = match machine_type {
            MachineType::Milling => ((2500.0, 3500.0), (250.0, 350.0)),
            MachineType::Lathe => ((1200.0, 2000.0), (1.0, 3.0)),
            MachineType::Saw => ((1600.0, 2000.0), (0.8, 1.2)),
        };
        Self {
            primary: uniform(rng, p_lo, p_hi),
            secondary: uniform(rng, s_lo, s_hi),
        }
    }
}

/// Accumulated physical state of one machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhysicalState {
    pub temperature_c: f64,
    pub wear: f64,
}

impl PhysicalState {
    pub fn at_ambient(constants: &PhysicsConstants) -> Self {
        Self {
            temperature_c: constants.ambient_temp_c,
            wear: 0.0,
        }
    }

    /// Steps temperature and wear forward by `dt_s` seconds under `load`.
    pub fn advance(
        &mut self,
        constants: &PhysicsConstants,
        dt_s: f64,
        load: Load,
        tool_quality: f64,
    ) -> Result<(), SignalError> {
        let (target, tau) = match load {
            Load::Processing => (constants.processing_temp_c, constants.heat_tau_s),
            Load::Idle => (constants.ambient_temp_c, constants.cool_tau_s),
        };
        self.temperature_c = thermal_step(self.temperature_c, target, tau, dt_s)?;
        if load == Load::Processing {
            self.wear += wear_increment(constants.wear_rate, dt_s, tool_quality)?;
        }
        Ok(())
    }
}

fn check_dt(dt_s: f64) -> Result<(), SignalError> {
    if dt_s.is_finite() && dt_s >= 0.0 {
        Ok(())
    } else {
        Err(SignalError::InvalidDuration(dt_s))
    }
}

/// Exponential approach of `temp` toward `target` over `dt_s`.
pub fn thermal_step(temp: f64, target: f64, tau_s: f64, dt_s: f64) -> Result<f64, SignalError> {
    check_dt(dt_s)?;
    if !(tau_s.is_finite() && tau_s > 0.0) {
        return Err(SignalError::InvalidTimeConstant(tau_s));
    }
    Ok(temp + (target - temp) * (1.0 - (-dt_s / tau_s).exp()))
}

pub fn wear_increment(wear_rate: f64, dt_s: f64, tool_quality: f64) -> Result<f64, SignalError> {
    check_dt(dt_s)?;
    if !(tool_quality.is_finite() && tool_quality > 0.0) {
        return Err(SignalError::InvalidToolQuality(tool_quality));
    }
    Ok((wear_rate * dt_s / tool_quality).max(0.0))
}

/// Uniform draw over `[lo, hi]`; degenerate ranges collapse to `lo`.
pub fn uniform<R: Rng + ?Sized>(rng: &mut R, lo: f64, hi: f64) -> f64 {
    if hi > lo {
        rng.random_range(lo..=hi)
    } else {
        lo
    }
}

/// `nominal` perturbed by up to `±fraction` of itself.
pub fn jitter<R: Rng + ?Sized>(nominal: f64, fraction: f64, rng: &mut R) -> f64 {
    let spread = (nominal * fraction).abs();
    nominal + uniform(rng, -spread, spread)
}

pub fn power(machine_type: MachineType, primary: f64, secondary: f64) -> f64 {
    match machine_type {
        MachineType::Milling => primary * secondary * 1e-4,
        MachineType::Lathe => primary * secondary * 1e-3,
        MachineType::Saw => primary * secondary * 5e-4,
    }
}

/// Vibration amplitude; wear widens the spread of the random component.
pub fn vibration<R: Rng + ?Sized>(power: f64, wear: f64, wear_coeff: f64, rng: &mut R) -> f64 {
    let base = VIBRATION_POWER_FACTOR * power + uniform(rng, 0.0, VIBRATION_NOISE_MAX);
    base * (1.0 + wear.max(0.0) * wear_coeff)
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Computes one reading from the machine's current state.
pub fn sample<R: Rng + ?Sized>(
    machine_type: MachineType,
    baseline: &Baseline,
    constants: &PhysicsConstants,
    state: &PhysicalState,
    rng: &mut R,
) -> Metrics {
    let primary = jitter(baseline.primary, constants.jitter_fraction, rng);
    let secondary = jitter(baseline.secondary, constants.jitter_fraction, rng);
    let power = power(machine_type, primary, secondary);

    let mut metrics = Metrics::new();
    metrics.set(Metric::Temperature, round2(state.temperature_c));
    metrics.set(Metric::Power, round2(power));
    match machine_type {
        MachineType::Saw => {
            metrics.set(Metric::BladeSpeed, round2(primary));
            metrics.set(Metric::MaterialFeed, round2(secondary));
        }
        MachineType::Milling => {
            let vib = vibration(power, state.wear, constants.vibration_wear_coeff, rng);
            metrics.set(Metric::RpmSpindle, round2(primary));
            metrics.set(Metric::FeedRate, round2(secondary));
            metrics.set(Metric::VibrationLevel, round2(vib));
        }
        MachineType::Lathe => {
            metrics.set(Metric::RpmSpindle, round2(primary));
            metrics.set(Metric::CutDepth, round2(secondary));
        }
    }
    metrics
}
