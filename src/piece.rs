//! Work pieces and their routing plans.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PieceId(String);

impl PieceId {
    /// Identifier of the `index`-th injected piece (zero based): `PZ001`, `PZ002`, ...
    pub fn sequential(index: usize) -> Self {
        PieceId(format!("PZ{:03}", index + 1))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PieceId {
    fn from(s: &str) -> Self {
        PieceId(s.to_string())
    }
}

impl core::fmt::Display for PieceId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Cut,
    Mill,
    Turn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    /// Relative durability; wear accrues inversely to it.
    #[serde(default = "default_quality")]
    pub quality: f64,
}

fn default_quality() -> f64 {
    1.0
}

impl Tool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            quality: default_quality(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteStep {
    pub machine: String,
    pub operation: OperationKind,
    /// Nominal simulated seconds.
    pub duration_s: f64,
    pub tool: Option<Tool>,
}

pub type RoutingPlan = Arc<[RouteStep]>;

/// Where a piece currently is. Exactly one at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// Waiting at a station for its machine to free up.
    Queued,
    AtMachine(String),
    InTransit { from: String, to: String },
    Completed,
    Aborted,
}

#[derive(Debug, Clone)]
pub struct Piece {
    id: PieceId,
    material: String,
    plan: RoutingPlan,
    cursor: usize,
    location: Location,
}

impl Piece {
    pub fn new(id: PieceId, material: impl Into<String>, plan: RoutingPlan) -> Self {
        Self {
            id,
            material: material.into(),
            plan,
            cursor: 0,
            location: Location::Queued,
        }
    }

    pub fn id(&self) -> &PieceId {
        &self.id
    }

    pub fn material(&self) -> &str {
        &self.material
    }

    pub fn plan(&self) -> &RoutingPlan {
        &self.plan
    }

    /// Number of completed steps.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn current_step(&self) -> Option<&RouteStep> {
        self.plan.get(self.cursor)
    }

    /// The step after the current one, if any.
    pub fn next_step(&self) -> Option<&RouteStep> {
        self.plan.get(self.cursor + 1)
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn is_complete(&self) -> bool {
        self.cursor >= self.plan.len()
    }

    /// Marks the current step done. Returns false once the plan is exhausted.
    pub fn advance(&mut self) -> bool {
        if self.is_complete() {
            return false;
        }
        self.cursor += 1;
        true
    }

    pub fn set_location(&mut self, location: Location) {
        // Terminal locations are sticky.
        if !matches!(self.location, Location::Completed | Location::Aborted) {
            self.location = location;
        }
    }
}
