//! Wire records published through the event sink.

use crate::piece::PieceId;
use crate::signal::Metrics;
use chrono::{DateTime, Utc};
use serde::Serialize;

pub const DATA_TOPIC_PREFIX: &str = "/plant/data";
pub const TRACKING_TOPIC_PREFIX: &str = "/plant/tracking";

/// One sample of a machine's sensors.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    pub entity: String,
    pub data: Metrics,
    pub timestamp: DateTime<Utc>,
}

impl SensorReading {
    pub fn topic(&self) -> String {
        format!("{DATA_TOPIC_PREFIX}/{}", self.entity)
    }
}

/// Lifecycle phase a tracking event brackets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Setup,
    Processing,
    Move,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingEventKind {
    SetupStart,
    SetupEnd,
    SetupAborted,
    ProcessingStart,
    ProcessingEnd,
    ProcessingAborted,
    MoveStart,
    MoveEnd,
    MoveAborted,
    Deposit,
}

impl TrackingEventKind {
    pub fn start(phase: Phase) -> Self {
        match phase {
            Phase::Setup => Self::SetupStart,
            Phase::Processing => Self::ProcessingStart,
            Phase::Move => Self::MoveStart,
        }
    }

    pub fn end(phase: Phase) -> Self {
        match phase {
            Phase::Setup => Self::SetupEnd,
            Phase::Processing => Self::ProcessingEnd,
            Phase::Move => Self::MoveEnd,
        }
    }

    /// Synthetic close emitted when a phase is interrupted by shutdown.
    pub fn aborted(phase: Phase) -> Self {
        match phase {
            Phase::Setup => Self::SetupAborted,
            Phase::Processing => Self::ProcessingAborted,
            Phase::Move => Self::MoveAborted,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SetupStart => "setup_start",
            Self::SetupEnd => "setup_end",
            Self::SetupAborted => "setup_aborted",
            Self::ProcessingStart => "processing_start",
            Self::ProcessingEnd => "processing_end",
            Self::ProcessingAborted => "processing_aborted",
            Self::MoveStart => "move_start",
            Self::MoveEnd => "move_end",
            Self::MoveAborted => "move_aborted",
            Self::Deposit => "deposit",
        }
    }
}

/// A piece lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackingEvent {
    pub entity: String,
    pub event: TrackingEventKind,
    pub piece_id: PieceId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TrackingEvent {
    pub fn new(
        entity: impl Into<String>,
        event: TrackingEventKind,
        piece_id: PieceId,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            entity: entity.into(),
            event,
            piece_id,
            from: None,
            to: None,
            tool: None,
            timestamp,
        }
    }

    pub fn with_route(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self.to = Some(to.into());
        self
    }

    pub fn with_tool(mut self, tool: Option<String>) -> Self {
        self.tool = tool;
        self
    }

    /// Same event with a different kind and timestamp; used to close a phase.
    pub fn closed_as(&self, event: TrackingEventKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            event,
            timestamp,
            ..self.clone()
        }
    }

    pub fn topic(&self) -> String {
        format!("{TRACKING_TOPIC_PREFIX}/{}", self.entity)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Sensor(SensorReading),
    Tracking(TrackingEvent),
}

impl Record {
    pub fn topic(&self) -> String {
        match self {
            Record::Sensor(r) => r.topic(),
            Record::Tracking(e) => e.topic(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Record::Sensor(r) => serde_json::to_vec(r),
            Record::Tracking(e) => serde_json::to_vec(e),
        }
    }
}

impl From<SensorReading> for Record {
    fn from(r: SensorReading) -> Self {
        Record::Sensor(r)
    }
}

impl From<TrackingEvent> for Record {
    fn from(e: TrackingEvent) -> Self {
        Record::Tracking(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::Metric;
    use serde_json::json;

    fn ts() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T08:00:03Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_sensor_wire_shape() {
        let mut data = Metrics::new();
        data.set(Metric::Temperature, 20.16);
        data.set(Metric::Power, 0.9);
        let reading = SensorReading {
            entity: "Saw1".to_string(),
            data,
            timestamp: ts(),
        };
        let value: serde_json::Value =
            serde_json::from_slice(&Record::from(reading.clone()).to_bytes().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "entity": "Saw1",
                "data": {"temperature": 20.16, "power": 0.9},
                "timestamp": "2025-01-01T08:00:03Z"
            })
        );
        assert_eq!(reading.topic(), "/plant/data/Saw1");
    }

    #[test]
    fn test_tracking_wire_shape_skips_absent_fields() {
        let setup = TrackingEvent::new("Milling1", TrackingEventKind::SetupStart, "PZ001".into(), ts())
            .with_tool(Some("TM10".to_string()));
        let value = serde_json::to_value(&setup).unwrap();
        assert_eq!(
            value,
            json!({
                "entity": "Milling1",
                "event": "setup_start",
                "piece_id": "PZ001",
                "tool": "TM10",
                "timestamp": "2025-01-01T08:00:03Z"
            })
        );

        let mv = TrackingEvent::new("PZ001", TrackingEventKind::MoveStart, "PZ001".into(), ts())
            .with_route("Saw1", "Milling1");
        let value = serde_json::to_value(&mv).unwrap();
        assert_eq!(value["from"], "Saw1");
        assert_eq!(value["to"], "Milling1");
        assert!(value.get("tool").is_none());
        assert_eq!(mv.topic(), "/plant/tracking/PZ001");
    }

    #[test]
    fn test_closed_as_keeps_context() {
        let start = TrackingEvent::new("PZ002", TrackingEventKind::MoveStart, "PZ002".into(), ts())
            .with_route("Saw1", "Lathe1");
        let abort = start.closed_as(TrackingEventKind::aborted(Phase::Move), ts());
        assert_eq!(abort.event.as_str(), "move_aborted");
        assert_eq!(abort.from.as_deref(), Some("Saw1"));
        assert_eq!(abort.to.as_deref(), Some("Lathe1"));
    }
}
