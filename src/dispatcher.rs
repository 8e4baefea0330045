//! Piece injection and routing.
//!
//! The [`Simulation`] owns the plant: machines, clock, publisher and the
//! materialized routing plans. [`Simulation::run`] injects pieces at the
//! configured cadence and spawns one worker task per piece. A worker walks
//! its plan step by step, waiting on machines as needed, and moves the piece
//! between stations. The run ends when every injected piece has finished
//! its plan or the run is cancelled.

use crate::clock::{sim_secs, SimClock};
use crate::config::{SimConfig, TransportConfig};
use crate::error::SimError;
use crate::machine::{Machine, MachineSettings, MachineSnapshot, PhaseOutcome};
use crate::piece::{Location, Piece, PieceId, RoutingPlan};
use crate::record::{Phase, TrackingEvent, TrackingEventKind};
use crate::shutdown::{self, Shutdown, ShutdownTrigger};
use crate::signal;
use crate::sink::{EventSink, PublishStats, Publisher};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

const MACHINE_STREAM: u64 = 0x6d61_6368;
const PIECE_STREAM: u64 = 0x7069_6563;

/// Independent per-entity seed so task interleaving never shifts a stream.
fn derive_seed(seed: u64, stream: u64, index: usize) -> u64 {
    seed ^ stream.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ (index as u64).wrapping_mul(0xBF58_476D_1CE4_E5B9)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceOutcome {
    Completed,
    Aborted,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub pieces_injected: usize,
    pub pieces_completed: usize,
    pub pieces_aborted: usize,
    pub publish: PublishStats,
    /// Simulated time from start to the last piece finishing.
    pub simulated: Duration,
    pub real: Duration,
    pub machines: Vec<MachineSnapshot>,
}

/// State every piece worker shares.
#[derive(Debug)]
struct Plant {
    machines: HashMap<String, Arc<Machine>>,
    clock: SimClock,
    publisher: Arc<Publisher>,
    transport: TransportConfig,
    warehouse: Option<String>,
    cycle_jitter: f64,
}

#[derive(Debug)]
pub struct Simulation {
    plant: Arc<Plant>,
    roster: Vec<Arc<Machine>>,
    plans: Vec<(String, RoutingPlan)>,
    piece_count: usize,
    arrival_interval_s: f64,
    seed: u64,
    trigger: ShutdownTrigger,
}

impl Simulation {
    /// Validates `config` and builds the plant. Nothing is created if the
    /// configuration is rejected.
    pub fn new(config: SimConfig, sink: Arc<dyn EventSink>) -> Result<Self, SimError> {
        config.validate()?;
        let clock = SimClock::new(config.time_multiplier, config.epoch.unwrap_or_else(Utc::now))?;
        let publisher = Arc::new(Publisher::new(sink));
        let settings = MachineSettings {
            setup_seconds: config.setup_seconds,
            sample_interval_s: config.sample_interval_s,
        };

        let roster: Vec<Arc<Machine>> = config
            .machines
            .iter()
            .enumerate()
            .map(|(index, spec)| {
                Arc::new(Machine::new(
                    spec.name.clone(),
                    spec.machine_type,
                    config.physics.get(spec.machine_type).clone(),
                    settings,
                    StdRng::seed_from_u64(derive_seed(config.seed, MACHINE_STREAM, index)),
                    clock.clone(),
                    Arc::clone(&publisher),
                ))
            })
            .collect();
        let machines = roster
            .iter()
            .map(|m| (m.name().to_string(), Arc::clone(m)))
            .collect();

        let (trigger, _) = shutdown::channel();
        Ok(Self {
            plans: config.plans(),
            piece_count: config.piece_count,
            arrival_interval_s: config.arrival_interval_s,
            seed: config.seed,
            plant: Arc::new(Plant {
                machines,
                clock,
                publisher,
                transport: config.transport,
                warehouse: config.warehouse,
                cycle_jitter: config.cycle_jitter,
            }),
            roster,
            trigger,
        })
    }

    pub fn clock(&self) -> &SimClock {
        &self.plant.clock
    }

    /// Machines in roster order.
    pub fn machines(&self) -> &[Arc<Machine>] {
        &self.roster
    }

    pub fn machine(&self, name: &str) -> Option<&Arc<Machine>> {
        self.plant.machines.get(name)
    }

    pub fn publish_stats(&self) -> PublishStats {
        self.plant.publisher.stats()
    }

    /// Asks every worker to wind down at its next suspension point.
    pub fn cancel(&self) {
        info!("simulation cancel requested");
        self.trigger.trigger();
    }

    pub fn shutdown_signal(&self) -> Shutdown {
        self.trigger.subscribe()
    }

    pub async fn run(&self) -> Result<RunSummary, SimError> {
        let started = tokio::time::Instant::now();
        let sim_started = self.plant.clock.elapsed();
        info!(
            pieces = self.piece_count,
            machines = self.roster.len(),
            multiplier = self.plant.clock.multiplier(),
            "simulation starting"
        );

        let mut shutdown = self.trigger.subscribe();
        let mut workers = JoinSet::new();
        let mut injected = 0;
        for index in 0..self.piece_count {
            if index > 0
                && self
                    .plant
                    .clock
                    .sleep_or_cancel(sim_secs(self.arrival_interval_s), &mut shutdown)
                    .await
                    .is_err()
            {
                break;
            }
            let Some((material, plan)) = self.plans.get(index % self.plans.len()) else {
                break;
            };
            let piece = Piece::new(PieceId::sequential(index), material.clone(), Arc::clone(plan));
            let rng = StdRng::seed_from_u64(derive_seed(self.seed, PIECE_STREAM, index));
            workers.spawn(run_piece(
                Arc::clone(&self.plant),
                piece,
                rng,
                self.trigger.subscribe(),
            ));
            injected += 1;
        }

        let mut completed = 0;
        let mut aborted = 0;
        let mut failure = None;
        while let Some(joined) = workers.join_next().await {
            let result = joined.map_err(SimError::from).and_then(|r| r);
            match result {
                Ok(PieceOutcome::Completed) => completed += 1,
                Ok(PieceOutcome::Aborted) => aborted += 1,
                Err(e) => {
                    error!(error = %e, "piece worker failed, stopping simulation");
                    self.trigger.trigger();
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
            }
        }
        for machine in &self.roster {
            machine.shut_down();
        }
        if let Some(e) = failure {
            return Err(e);
        }

        let summary = RunSummary {
            pieces_injected: injected,
            pieces_completed: completed,
            pieces_aborted: aborted,
            publish: self.plant.publisher.stats(),
            simulated: self.plant.clock.elapsed().saturating_sub(sim_started),
            real: started.elapsed(),
            machines: self.roster.iter().map(|m| m.snapshot()).collect(),
        };
        info!(
            completed,
            aborted,
            published = summary.publish.published,
            dropped = summary.publish.dropped,
            "simulation finished"
        );
        Ok(summary)
    }
}

/// Drives one piece through its whole plan.
async fn run_piece(
    plant: Arc<Plant>,
    mut piece: Piece,
    mut rng: StdRng,
    mut shutdown: Shutdown,
) -> Result<PieceOutcome, SimError> {
    info!(piece = %piece.id(), material = piece.material(), steps = piece.plan().len(), "piece injected");

    if let (Some(warehouse), Some(first)) = (&plant.warehouse, piece.current_step()) {
        let first = first.machine.clone();
        if transport(&plant, &mut piece, warehouse, &first, &mut rng, &mut shutdown).await == PhaseOutcome::Aborted {
            return Ok(abort(&mut piece));
        }
    }

    while let Some(step) = piece.current_step().cloned() {
        let machine = plant
            .machines
            .get(&step.machine)
            .ok_or_else(|| SimError::UnknownStation(step.machine.clone()))?;

        let Some(mut occupancy) = machine.acquire(piece.id(), &mut shutdown).await? else {
            return Ok(abort(&mut piece));
        };
        piece.set_location(Location::AtMachine(step.machine.clone()));

        if occupancy.setup(step.tool.as_ref(), &mut shutdown).await? == PhaseOutcome::Aborted {
            return Ok(abort(&mut piece));
        }
        let spread = plant.cycle_jitter;
        let duration_s = step.duration_s * signal::uniform(&mut rng, 1.0 - spread, 1.0 + spread);
        if occupancy.run_operation(&step, duration_s, &mut shutdown).await? == PhaseOutcome::Aborted {
            return Ok(abort(&mut piece));
        }
        occupancy.release();
        debug!(piece = %piece.id(), machine = %step.machine, "step finished");

        let next_station = piece
            .next_step()
            .map(|next| next.machine.clone())
            .or_else(|| plant.warehouse.clone());
        piece.advance();
        match next_station {
            Some(next) if next != step.machine => {
                if transport(&plant, &mut piece, &step.machine, &next, &mut rng, &mut shutdown).await
                    == PhaseOutcome::Aborted
                {
                    return Ok(abort(&mut piece));
                }
            }
            _ => piece.set_location(Location::Queued),
        }
    }

    if let Some(warehouse) = &plant.warehouse {
        plant.publisher.publish(TrackingEvent::new(
            warehouse.clone(),
            TrackingEventKind::Deposit,
            piece.id().clone(),
            plant.clock.now(),
        ));
    }
    piece.set_location(Location::Completed);
    info!(piece = %piece.id(), "piece completed");
    Ok(PieceOutcome::Completed)
}

fn abort(piece: &mut Piece) -> PieceOutcome {
    info!(
        piece = %piece.id(),
        completed_steps = piece.cursor(),
        location = ?piece.location(),
        "piece aborted by shutdown"
    );
    piece.set_location(Location::Aborted);
    PieceOutcome::Aborted
}

/// Moves a piece between stations, bracketed by `move_start`/`move_end`.
async fn transport(
    plant: &Plant,
    piece: &mut Piece,
    from: &str,
    to: &str,
    rng: &mut StdRng,
    shutdown: &mut Shutdown,
) -> PhaseOutcome {
    let base = plant.transport.minutes(from, to);
    let spread = base * plant.transport.jitter;
    let minutes = (base + signal::uniform(rng, -spread, spread)).max(plant.transport.min_minutes);

    piece.set_location(Location::InTransit {
        from: from.to_string(),
        to: to.to_string(),
    });
    let start = TrackingEvent::new(
        piece.id().as_str(),
        TrackingEventKind::start(Phase::Move),
        piece.id().clone(),
        plant.clock.now(),
    )
    .with_route(from, to);
    plant.publisher.publish(start.clone());
    debug!(piece = %piece.id(), from, to, minutes, "moving");

    if plant
        .clock
        .sleep_or_cancel(sim_secs(minutes * 60.0), shutdown)
        .await
        .is_err()
    {
        plant
            .publisher
            .publish(start.closed_as(TrackingEventKind::aborted(Phase::Move), plant.clock.now()));
        return PhaseOutcome::Aborted;
    }
    plant
        .publisher
        .publish(start.closed_as(TrackingEventKind::end(Phase::Move), plant.clock.now()));
    piece.set_location(Location::Queued);
    PhaseOutcome::Completed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piece::RouteStep;
    use crate::sink::MemorySink;

    fn plant(sink: Arc<MemorySink>, default_minutes: f64) -> Plant {
        Plant {
            machines: HashMap::new(),
            clock: SimClock::new(60.0, Utc::now()).unwrap(),
            publisher: Arc::new(Publisher::new(sink)),
            transport: TransportConfig {
                default_minutes,
                min_minutes: 0.5,
                jitter: 0.2,
                legs: Vec::new(),
            },
            warehouse: None,
            cycle_jitter: 0.0,
        }
    }

    fn piece() -> Piece {
        Piece::new(PieceId::sequential(0), "steel", Vec::<RouteStep>::new().into())
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_floors_short_legs() {
        let sink = Arc::new(MemorySink::new());
        let plant = plant(Arc::clone(&sink), 0.0);
        let mut piece = piece();
        let mut rng = StdRng::seed_from_u64(1);
        let mut shutdown = Shutdown::never();

        let started = tokio::time::Instant::now();
        let outcome = transport(&plant, &mut piece, "Saw1", "Lathe1", &mut rng, &mut shutdown).await;
        assert_eq!(outcome, PhaseOutcome::Completed);
        // Half a simulated minute at x60.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(500) && elapsed < Duration::from_millis(505));
        assert_eq!(piece.location(), &Location::Queued);

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].topic, "/plant/tracking/PZ001");
        let end = records[1].json().unwrap();
        assert_eq!(end["event"], "move_end");
        assert_eq!(end["from"], "Saw1");
        assert_eq!(end["to"], "Lathe1");
    }

    #[test]
    fn test_abort_marks_piece_terminal() {
        let mut piece = piece();
        piece.set_location(Location::AtMachine("Saw1".to_string()));
        assert_eq!(abort(&mut piece), PieceOutcome::Aborted);
        assert_eq!(piece.location(), &Location::Aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_transport_is_closed() {
        let sink = Arc::new(MemorySink::new());
        let plant = plant(Arc::clone(&sink), 2.0);
        let mut piece = piece();
        let mut rng = StdRng::seed_from_u64(1);
        let (trigger, mut shutdown) = shutdown::channel();
        trigger.trigger();

        let outcome = transport(&plant, &mut piece, "Saw1", "Milling1", &mut rng, &mut shutdown).await;
        assert_eq!(outcome, PhaseOutcome::Aborted);
        let events: Vec<String> = sink
            .records()
            .iter()
            .map(|r| r.json().unwrap()["event"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(events, ["move_start", "move_aborted"]);
        assert!(matches!(piece.location(), Location::InTransit { .. }));
    }

    #[test]
    fn test_derived_seeds_differ_per_stream_and_index() {
        let a = derive_seed(42, MACHINE_STREAM, 0);
        let b = derive_seed(42, MACHINE_STREAM, 1);
        let c = derive_seed(42, PIECE_STREAM, 0);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, derive_seed(42, MACHINE_STREAM, 0));
    }
}
