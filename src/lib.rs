//! # Plant Simulator
//!
//! A concurrent discrete-event simulation of a small machining plant. Pieces
//! flow through saws, mills and lathes along routing plans; machines
//! accumulate heat and tool wear; every phase and sensor tick is published as
//! a JSON record to a pluggable sink.
//!
//! ## Features
//!
//! - **Physical signal model**: thermal lag, monotone tool wear, and
//!   per-type actuation metrics with bounded jitter
//! - **Exclusive machines**: an async occupancy gate per machine with FIFO waiting
//! - **Scaled time**: simulated durations run `multiplier` times faster than real time
//! - **Cooperative cancellation**: every open phase is closed on shutdown
//! - **Reproducible runs**: all randomness derives from one seed
//!
//! ## Quick Start
//!
//! ```no_run
//! use plantsim::{MemorySink, SimConfig, Simulation};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), plantsim::SimError> {
//! let sink = Arc::new(MemorySink::new());
//! let sim = Simulation::new(SimConfig::default(), sink.clone())?;
//! let summary = sim.run().await?;
//! println!("{} pieces done, {} records", summary.pieces_completed, sink.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`dispatcher`] - Piece injection, routing, and the run loop
//! - [`machine`] - Occupancy gate, setup and processing phases
//! - [`signal`] - Thermal and wear physics, sensor sampling
//! - [`piece`] - Pieces, tools, and routing plans
//! - [`clock`] - Simulated time
//! - [`sink`] - Record publishing and stock sinks
//! - [`record`] - Wire records and topics
//! - [`config`] - Run configuration and validation

#![deny(warnings)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::float_cmp)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::similar_names)]

pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod machine;
pub mod piece;
pub mod record;
pub mod shutdown;
pub mod signal;
pub mod sink;

// Re-export main public types for convenience
pub use clock::SimClock;
pub use config::SimConfig;
pub use dispatcher::{RunSummary, Simulation};
pub use error::{ConfigError, MachineError, SignalError, SimError, SinkError};
pub use machine::{Machine, MachineSnapshot, MachineStatus};
pub use piece::{Piece, PieceId, RouteStep, RoutingPlan};
pub use record::{Record, SensorReading, TrackingEvent, TrackingEventKind};
pub use signal::MachineType;
pub use sink::{ChannelSink, EventSink, MemorySink, NullSink, StdoutSink};
