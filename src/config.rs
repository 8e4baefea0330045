//! Simulation configuration.
//!
//! Every field has a default reproducing the reference plant: one saw
//! feeding two mills and a lathe. A TOML file may override any subset.
//! The whole configuration is validated once, before any machine exists.

use crate::error::ConfigError;
use crate::piece::{OperationKind, RouteStep, RoutingPlan, Tool};
use crate::signal::{MachineType, PhysicsConstants};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

const DEFAULT_TIME_MULTIPLIER: f64 = 8.0;
const DEFAULT_PIECE_COUNT: usize = 10;
const DEFAULT_SAMPLE_INTERVAL_S: f64 = 3.0;
const DEFAULT_ARRIVAL_INTERVAL_S: f64 = 120.0;
const DEFAULT_SEED: u64 = 42;

/// Longest simulated span any single configured duration may cover (about 31 years).
pub const MAX_SIM_SECONDS: f64 = 1.0e9;
pub const MIN_TIME_MULTIPLIER: f64 = 1.0e-3;
pub const MAX_TIME_MULTIPLIER: f64 = 1.0e6;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Simulated seconds per real second.
    pub time_multiplier: f64,
    pub piece_count: usize,
    /// Simulated seconds between piece injections.
    pub arrival_interval_s: f64,
    pub seed: u64,
    /// Simulated start time. Defaults to the wall clock at startup.
    pub epoch: Option<DateTime<Utc>>,
    /// Sensor tick cadence in simulated seconds.
    pub sample_interval_s: f64,
    pub setup_seconds: SecondsRange,
    /// Relative spread applied to nominal operation durations.
    pub cycle_jitter: f64,
    pub transport: TransportConfig,
    /// Station pieces leave from and return to. `None` disables the legs.
    pub warehouse: Option<String>,
    pub machines: Vec<MachineSpec>,
    pub physics: PhysicsTable,
    pub routes: Vec<RouteTemplate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct SecondsRange {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MachineSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub machine_type: MachineType,
}

impl MachineSpec {
    pub fn new(name: impl Into<String>, machine_type: MachineType) -> Self {
        Self {
            name: name.into(),
            machine_type,
        }
    }
}

/// Physical constants per machine type. Fields missing from a TOML table
/// keep that type's reference values.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "PhysicsTableOverrides")]
pub struct PhysicsTable {
    pub saw: PhysicsConstants,
    pub milling: PhysicsConstants,
    pub lathe: PhysicsConstants,
}

impl Default for PhysicsTable {
    fn default() -> Self {
        Self {
            saw: PhysicsConstants::for_type(MachineType::Saw),
            milling: PhysicsConstants::for_type(MachineType::Milling),
            lathe: PhysicsConstants::for_type(MachineType::Lathe),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct PhysicsTableOverrides {
    saw: PhysicsOverrides,
    milling: PhysicsOverrides,
    lathe: PhysicsOverrides,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PhysicsOverrides {
    ambient_temp_c: Option<f64>,
    processing_temp_c: Option<f64>,
    heat_tau_s: Option<f64>,
    cool_tau_s: Option<f64>,
    wear_rate: Option<f64>,
    wear_warning: Option<f64>,
    vibration_wear_coeff: Option<f64>,
    jitter_fraction: Option<f64>,
}

impl PhysicsOverrides {
    fn over(self, machine_type: MachineType) -> PhysicsConstants {
        let base = PhysicsConstants::for_type(machine_type);
        PhysicsConstants {
            ambient_temp_c: self.ambient_temp_c.unwrap_or(base.ambient_temp_c),
            processing_temp_c: self.processing_temp_c.unwrap_or(base.processing_temp_c),
            heat_tau_s: self.heat_tau_s.unwrap_or(base.heat_tau_s),
            cool_tau_s: self.cool_tau_s.unwrap_or(base.cool_tau_s),
            wear_rate: self.wear_rate.unwrap_or(base.wear_rate),
            wear_warning: self.wear_warning.unwrap_or(base.wear_warning),
            vibration_wear_coeff: self.vibration_wear_coeff.unwrap_or(base.vibration_wear_coeff),
            jitter_fraction: self.jitter_fraction.unwrap_or(base.jitter_fraction),
        }
    }
}

impl From<PhysicsTableOverrides> for PhysicsTable {
    fn from(overrides: PhysicsTableOverrides) -> Self {
        Self {
            saw: overrides.saw.over(MachineType::Saw),
            milling: overrides.milling.over(MachineType::Milling),
            lathe: overrides.lathe.over(MachineType::Lathe),
        }
    }
}

impl PhysicsTable {
    pub fn get(&self, machine_type: MachineType) -> &PhysicsConstants {
        match machine_type {
            MachineType::Saw => &self.saw,
            MachineType::Milling => &self.milling,
            MachineType::Lathe => &self.lathe,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub default_minutes: f64,
    pub min_minutes: f64,
    /// Relative spread applied to the looked-up distance.
    pub jitter: f64,
    pub legs: Vec<TransportLeg>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TransportLeg {
    pub from: String,
    pub to: String,
    pub minutes: f64,
}

impl TransportLeg {
    fn new(from: &str, to: &str, minutes: f64) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            minutes,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            default_minutes: 1.0,
            min_minutes: 0.5,
            jitter: 0.2,
            legs: vec![
                TransportLeg::new("Saw1", "Milling1", 1.0),
                TransportLeg::new("Saw1", "Lathe1", 2.0),
                TransportLeg::new("Saw1", "Milling2", 2.0),
                TransportLeg::new("Milling1", "Lathe1", 1.0),
                TransportLeg::new("Milling2", "Lathe1", 1.0),
            ],
        }
    }
}

impl TransportConfig {
    /// Nominal minutes between two stations, in either direction.
    pub fn minutes(&self, from: &str, to: &str) -> f64 {
        self.legs
            .iter()
            .find(|leg| (leg.from == from && leg.to == to) || (leg.from == to && leg.to == from))
            .map_or(self.default_minutes, |leg| leg.minutes)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RouteTemplate {
    pub material: String,
    pub steps: Vec<StepTemplate>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StepTemplate {
    pub machine: String,
    pub operation: OperationKind,
    pub duration_s: f64,
    #[serde(default)]
    pub tool: Option<Tool>,
}

impl StepTemplate {
    pub fn new(machine: &str, operation: OperationKind, duration_s: f64, tool: Option<&str>) -> Self {
        Self {
            machine: machine.to_string(),
            operation,
            duration_s,
            tool: tool.map(Tool::new),
        }
    }
}

impl RouteTemplate {
    fn reference(material: &str, tail: &str, tools: &[&str]) -> Self {
        let operation = if tail.starts_with("Lathe") {
            OperationKind::Turn
        } else {
            OperationKind::Mill
        };
        let slice = 480.0 / tools.len().max(1) as f64;
        let mut steps = vec![StepTemplate::new("Saw1", OperationKind::Cut, 480.0, None)];
        steps.extend(
            tools
                .iter()
                .map(|tool| StepTemplate::new(tail, operation, slice, Some(tool))),
        );
        Self {
            material: material.to_string(),
            steps,
        }
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            time_multiplier: DEFAULT_TIME_MULTIPLIER,
            piece_count: DEFAULT_PIECE_COUNT,
            arrival_interval_s: DEFAULT_ARRIVAL_INTERVAL_S,
            seed: DEFAULT_SEED,
            epoch: None,
            sample_interval_s: DEFAULT_SAMPLE_INTERVAL_S,
            setup_seconds: SecondsRange { min: 120.0, max: 240.0 },
            cycle_jitter: 0.2,
            transport: TransportConfig::default(),
            warehouse: Some("Warehouse".to_string()),
            machines: vec![
                MachineSpec::new("Saw1", MachineType::Saw),
                MachineSpec::new("Milling1", MachineType::Milling),
                MachineSpec::new("Milling2", MachineType::Milling),
                MachineSpec::new("Lathe1", MachineType::Lathe),
            ],
            physics: PhysicsTable::default(),
            routes: vec![
                RouteTemplate::reference("steel", "Milling1", &["TM10", "TM25"]),
                RouteTemplate::reference("aluminum", "Milling2", &["TM12", "TM30"]),
                RouteTemplate::reference("steel", "Lathe1", &["TL05"]),
                RouteTemplate::reference("brass", "Lathe1", &["TL08"]),
                RouteTemplate::reference("titanium", "Milling1", &["TM15", "TM35"]),
            ],
        }
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
}

fn non_negative(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(invalid(field, format!("must be a finite number >= 0, got {value}")))
    }
}

/// A simulated span in seconds that fits the clock.
fn span(field: &'static str, seconds: f64) -> Result<(), ConfigError> {
    non_negative(field, seconds)?;
    if seconds > MAX_SIM_SECONDS {
        return Err(invalid(field, format!("must not exceed {MAX_SIM_SECONDS} s, got {seconds}")));
    }
    Ok(())
}

fn fraction(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && (0.0..1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(field, format!("must be in [0, 1), got {value}")))
    }
}

impl SimConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_TIME_MULTIPLIER..=MAX_TIME_MULTIPLIER).contains(&self.time_multiplier) {
            return Err(invalid(
                "time_multiplier",
                format!(
                    "must be within [{MIN_TIME_MULTIPLIER}, {MAX_TIME_MULTIPLIER}], got {}",
                    self.time_multiplier
                ),
            ));
        }
        if self.piece_count == 0 {
            return Err(invalid("piece_count", "must be at least 1"));
        }
        span("arrival_interval_s", self.arrival_interval_s)?;
        span("sample_interval_s", self.sample_interval_s)?;
        if self.sample_interval_s <= 0.0 {
            return Err(invalid("sample_interval_s", "must be > 0"));
        }
        span("setup_seconds.min", self.setup_seconds.min)?;
        span("setup_seconds.max", self.setup_seconds.max)?;
        if self.setup_seconds.min > self.setup_seconds.max {
            return Err(invalid("setup_seconds", "min exceeds max"));
        }
        fraction("cycle_jitter", self.cycle_jitter)?;
        fraction("transport.jitter", self.transport.jitter)?;
        // Jitter can stretch a leg by up to 2x.
        span("transport.default_minutes", self.transport.default_minutes * 120.0)?;
        span("transport.min_minutes", self.transport.min_minutes * 120.0)?;
        for leg in &self.transport.legs {
            span("transport.legs.minutes", leg.minutes * 120.0)?;
        }

        if self.machines.is_empty() {
            return Err(invalid("machines", "roster is empty"));
        }
        let mut names = HashSet::new();
        for spec in &self.machines {
            if !names.insert(spec.name.as_str()) {
                return Err(ConfigError::DuplicateMachine(spec.name.clone()));
            }
        }
        for machine_type in [MachineType::Saw, MachineType::Milling, MachineType::Lathe] {
            self.physics
                .get(machine_type)
                .validate()
                .map_err(|e| invalid("physics", format!("{machine_type}: {e}")))?;
        }

        if self.routes.is_empty() {
            return Err(invalid("routes", "at least one route template is required"));
        }
        for (index, route) in self.routes.iter().enumerate() {
            if route.steps.is_empty() {
                return Err(invalid("routes", format!("template {index} has no steps")));
            }
            for step in &route.steps {
                if !names.contains(step.machine.as_str()) {
                    return Err(ConfigError::UnknownMachine {
                        template: index,
                        machine: step.machine.clone(),
                    });
                }
                // Cycle jitter can stretch a step by up to 2x.
                span("routes.steps.duration_s", step.duration_s * 2.0)?;
                if let Some(tool) = &step.tool {
                    if !(tool.quality.is_finite() && tool.quality > 0.0) {
                        return Err(invalid(
                            "routes.steps.tool.quality",
                            format!("tool {} must have quality > 0, got {}", tool.name, tool.quality),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Materialized plans, one per route template, in template order.
    pub fn plans(&self) -> Vec<(String, RoutingPlan)> {
        self.routes
            .iter()
            .map(|route| {
                let plan: RoutingPlan = route
                    .steps
                    .iter()
                    .map(|step| RouteStep {
                        machine: step.machine.clone(),
                        operation: step.operation,
                        duration_s: step.duration_s,
                        tool: step.tool.clone(),
                    })
                    .collect();
                (route.material.clone(), plan)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_plant_is_valid() {
        let config = SimConfig::default();
        config.validate().unwrap();
        assert_eq!(config.machines.len(), 4);
        assert_eq!(config.routes.len(), 5);

        let plans = config.plans();
        assert_eq!(plans[0].0, "steel");
        let machines: Vec<&str> = plans[0].1.iter().map(|s| s.machine.as_str()).collect();
        assert_eq!(machines, ["Saw1", "Milling1", "Milling1"]);
        assert_eq!(plans[2].1[1].operation, OperationKind::Turn);
        assert_eq!(plans[2].1[1].tool.as_ref().map(|t| t.name.as_str()), Some("TL05"));
    }

    #[test]
    fn test_transport_lookup_is_symmetric() {
        let transport = TransportConfig::default();
        assert_eq!(transport.minutes("Saw1", "Lathe1"), 2.0);
        assert_eq!(transport.minutes("Lathe1", "Saw1"), 2.0);
        assert_eq!(transport.minutes("Lathe1", "Warehouse"), 1.0);
    }

    #[test]
    fn test_rejects_contract_violations() {
        let bad_multiplier = SimConfig {
            time_multiplier: 0.0,
            ..SimConfig::default()
        };
        assert!(matches!(
            bad_multiplier.validate(),
            Err(ConfigError::InvalidValue { field: "time_multiplier", .. })
        ));

        let no_pieces = SimConfig {
            piece_count: 0,
            ..SimConfig::default()
        };
        assert!(no_pieces.validate().is_err());

        let mut unknown = SimConfig::default();
        unknown.routes[1].steps[1].machine = "Drill9".to_string();
        assert!(matches!(
            unknown.validate(),
            Err(ConfigError::UnknownMachine { template: 1, .. })
        ));

        let mut duplicate = SimConfig::default();
        duplicate.machines.push(MachineSpec::new("Saw1", MachineType::Saw));
        assert!(matches!(duplicate.validate(), Err(ConfigError::DuplicateMachine(_))));

        let mut negative = SimConfig::default();
        negative.routes[0].steps[0].duration_s = -5.0;
        assert!(negative.validate().is_err());

        let mut bad_tau = SimConfig::default();
        bad_tau.physics.lathe.cool_tau_s = 0.0;
        assert!(bad_tau.validate().is_err());
    }

    #[test]
    fn test_toml_overrides_subset() {
        let config = SimConfig::from_toml_str(
            r#"
            time_multiplier = 100.0
            piece_count = 1
            warehouse = "Dock"

            [[machines]]
            name = "Saw1"
            type = "Saw"

            [[routes]]
            material = "oak"
            steps = [{ machine = "Saw1", operation = "cut", duration_s = 10.0, tool = { name = "B1", quality = 2.0 } }]

            [physics.saw]
            processing_temp_c = 50.0
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.time_multiplier, 100.0);
        assert_eq!(config.warehouse.as_deref(), Some("Dock"));
        assert_eq!(config.machines, vec![MachineSpec::new("Saw1", MachineType::Saw)]);
        assert_eq!(config.routes[0].steps[0].tool.as_ref().map(|t| t.quality), Some(2.0));
        assert_eq!(config.physics.saw.processing_temp_c, 50.0);
        // Unspecified constants keep the saw's reference values.
        let reference = PhysicsConstants::for_type(MachineType::Saw);
        assert_eq!(config.physics.saw.heat_tau_s, reference.heat_tau_s);
        assert_eq!(config.physics.saw.wear_rate, reference.wear_rate);
        assert_eq!(config.physics.saw.ambient_temp_c, reference.ambient_temp_c);
        assert_eq!(config.physics.milling, PhysicsConstants::for_type(MachineType::Milling));
        assert_eq!(config.sample_interval_s, DEFAULT_SAMPLE_INTERVAL_S);
    }

    #[test]
    fn test_one_field_override_keeps_type_constants() {
        let config = SimConfig::from_toml_str(
            r#"
            [physics.lathe]
            wear_warning = 0.5
            "#,
        )
        .unwrap();
        let lathe = &config.physics.lathe;
        assert_eq!(lathe.wear_warning, 0.5);
        assert_eq!(lathe.processing_temp_c, 38.0);
        assert_eq!(lathe.wear_rate, 0.8e-4);
        assert_eq!(config.physics.saw, PhysicsConstants::for_type(MachineType::Saw));

        let typo = SimConfig::from_toml_str("[physics.saw]\nheat_tau = 10.0");
        assert!(matches!(typo, Err(ConfigError::Toml { .. })));
    }

    #[test]
    fn test_rejects_durations_the_clock_cannot_hold() {
        let late_arrivals = SimConfig {
            arrival_interval_s: 1e20,
            piece_count: 2,
            ..SimConfig::default()
        };
        assert!(matches!(
            late_arrivals.validate(),
            Err(ConfigError::InvalidValue { field: "arrival_interval_s", .. })
        ));

        let mut long_step = SimConfig::default();
        long_step.routes[0].steps[0].duration_s = 1e19;
        assert!(long_step.validate().is_err());

        let mut long_setup = SimConfig::default();
        long_setup.setup_seconds.max = f64::MAX;
        assert!(long_setup.validate().is_err());

        let mut far_leg = SimConfig::default();
        far_leg.transport.default_minutes = 1e18;
        assert!(far_leg.validate().is_err());

        for multiplier in [1e-9, 1e12] {
            let config = SimConfig {
                time_multiplier: multiplier,
                ..SimConfig::default()
            };
            assert!(config.validate().is_err(), "multiplier {multiplier}");
        }
    }

    #[test]
    fn test_rejects_unphysical_constants() {
        let mut config = SimConfig::default();
        config.physics.milling.wear_warning = -1.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "physics", .. })
        ));
    }

    #[test]
    fn test_unknown_machine_type_rejected() {
        let result = SimConfig::from_toml_str(
            r#"
            [[machines]]
            name = "X1"
            type = "Plasma"
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Toml { .. })));
    }
}
