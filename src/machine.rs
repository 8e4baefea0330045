//! Machines: exclusive production resources with accumulated physical state.
//!
//! Mutable state lives in a [`MachineCore`] behind a per-machine async
//! mutex. Holding the lock is holding the machine: the [`Occupancy`] token
//! owns the guard and is the only way to run setup and operations. Readers
//! never touch the lock; they read the last published [`MachineSnapshot`]
//! from a watch channel.

use crate::clock::{sim_secs, SimClock};
use crate::config::SecondsRange;
use crate::error::MachineError;
use crate::piece::{PieceId, RouteStep, Tool};
use crate::record::{Phase, SensorReading, TrackingEvent, TrackingEventKind};
use crate::shutdown::Shutdown;
use crate::signal::{self, Baseline, Load, MachineType, PhysicalState, PhysicsConstants};
use crate::sink::Publisher;
use rand::rngs::StdRng;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineStatus {
    Idle,
    Setup,
    Processing,
    Offline,
}

/// Consistent point-in-time view of a machine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MachineSnapshot {
    pub name: String,
    pub machine_type: MachineType,
    pub status: MachineStatus,
    pub occupant: Option<PieceId>,
    /// Temperature as of the last state change.
    pub temperature_c: f64,
    pub wear: f64,
    pub wear_alert: bool,
    pub mounted_tool: Option<String>,
    pub operations: u32,
    pub busy_seconds: f64,
}

/// Timing knobs shared by every machine in a run.
#[derive(Debug, Clone, Copy)]
pub struct MachineSettings {
    pub setup_seconds: SecondsRange,
    pub sample_interval_s: f64,
}

/// How a bracketed phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOutcome {
    Completed,
    Aborted,
}

#[derive(Debug)]
struct MachineCore {
    state: PhysicalState,
    baseline: Baseline,
    rng: StdRng,
    mounted_tool: Option<String>,
    wear_alert: bool,
    operations: u32,
    busy_seconds: f64,
    /// Simulated clock reading at the last release.
    released_at: Duration,
}

#[derive(Debug)]
pub struct Machine {
    name: String,
    machine_type: MachineType,
    constants: PhysicsConstants,
    settings: MachineSettings,
    gate: Arc<Mutex<MachineCore>>,
    status_tx: watch::Sender<MachineSnapshot>,
    holders: AtomicUsize,
    peak_holders: AtomicUsize,
    clock: SimClock,
    publisher: Arc<Publisher>,
}

impl Machine {
    pub fn new(
        name: impl Into<String>,
        machine_type: MachineType,
        constants: PhysicsConstants,
        settings: MachineSettings,
        mut rng: StdRng,
        clock: SimClock,
        publisher: Arc<Publisher>,
    ) -> Self {
        let name = name.into();
        let baseline = Baseline::draw(machine_type, &mut rng);
        let state = PhysicalState::at_ambient(&constants);
        let core = MachineCore {
            state,
            baseline,
            rng,
            mounted_tool: None,
            wear_alert: false,
            operations: 0,
            busy_seconds: 0.0,
            released_at: clock.elapsed(),
        };
        let snapshot = MachineSnapshot {
            name: name.clone(),
            machine_type,
            status: MachineStatus::Idle,
            occupant: None,
            temperature_c: state.temperature_c,
            wear: state.wear,
            wear_alert: false,
            mounted_tool: None,
            operations: 0,
            busy_seconds: 0.0,
        };
        let (status_tx, _) = watch::channel(snapshot);
        Self {
            name,
            machine_type,
            constants,
            settings,
            gate: Arc::new(Mutex::new(core)),
            status_tx,
            holders: AtomicUsize::new(0),
            peak_holders: AtomicUsize::new(0),
            clock,
            publisher,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn machine_type(&self) -> MachineType {
        self.machine_type
    }

    pub fn snapshot(&self) -> MachineSnapshot {
        self.status_tx.borrow().clone()
    }

    pub fn status(&self) -> MachineStatus {
        self.status_tx.borrow().status
    }

    pub fn subscribe(&self) -> watch::Receiver<MachineSnapshot> {
        self.status_tx.subscribe()
    }

    /// Highest number of simultaneous holders ever counted.
    pub fn peak_holders(&self) -> usize {
        self.peak_holders.load(Ordering::SeqCst)
    }

    /// Takes the machine if it is free, failing with `Busy` otherwise.
    pub fn try_acquire(self: &Arc<Self>, piece: &PieceId) -> Result<Occupancy, MachineError> {
        match Arc::clone(&self.gate).try_lock_owned() {
            Ok(guard) => self.occupy(guard, piece),
            Err(_) => Err(MachineError::Busy {
                machine: self.name.clone(),
                occupant: self.status_tx.borrow().occupant.clone(),
            }),
        }
    }

    /// Waits in FIFO order for the machine. `None` means the run was cancelled.
    pub async fn acquire(
        self: &Arc<Self>,
        piece: &PieceId,
        shutdown: &mut Shutdown,
    ) -> Result<Option<Occupancy>, MachineError> {
        if shutdown.is_triggered() {
            return Ok(None);
        }
        let guard = tokio::select! {
            guard = Arc::clone(&self.gate).lock_owned() => guard,
            () = shutdown.triggered() => return Ok(None),
        };
        self.occupy(guard, piece).map(Some)
    }

    /// Marks an idle machine offline at the end of a run.
    pub fn shut_down(&self) -> bool {
        match self.gate.try_lock() {
            Ok(_core) => {
                self.status_tx.send_modify(|snap| snap.status = MachineStatus::Offline);
                true
            }
            Err(_) => false,
        }
    }

    fn occupy(
        self: &Arc<Self>,
        core: OwnedMutexGuard<MachineCore>,
        piece: &PieceId,
    ) -> Result<Occupancy, MachineError> {
        let holders = self.holders.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_holders.fetch_max(holders, Ordering::SeqCst);
        let mut occupancy = Occupancy {
            machine: Arc::clone(self),
            core,
            piece: piece.clone(),
        };
        if holders > 1 {
            error!(machine = %self.name, holders, "double occupancy detected");
            return Err(MachineError::DoubleOccupancy {
                machine: self.name.clone(),
                holders,
            });
        }

        // Catch up on cooling for the time the machine sat idle.
        let idle = self.clock.elapsed().saturating_sub(occupancy.core.released_at);
        occupancy
            .core
            .state
            .advance(&self.constants, idle.as_secs_f64(), Load::Idle, 1.0)?;
        occupancy.publish_status(MachineStatus::Setup);
        debug!(machine = %self.name, piece = %piece, "machine acquired");
        Ok(occupancy)
    }
}

/// Exclusive possession of a machine by one piece. Dropping it releases
/// the machine and returns it to Idle.
#[derive(Debug)]
pub struct Occupancy {
    machine: Arc<Machine>,
    core: OwnedMutexGuard<MachineCore>,
    piece: PieceId,
}

impl Occupancy {
    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    pub fn piece(&self) -> &PieceId {
        &self.piece
    }

    fn publish_status(&self, status: MachineStatus) {
        let occupant = match status {
            MachineStatus::Idle | MachineStatus::Offline => None,
            MachineStatus::Setup | MachineStatus::Processing => Some(self.piece.clone()),
        };
        let core = &*self.core;
        self.machine.status_tx.send_replace(MachineSnapshot {
            name: self.machine.name.clone(),
            machine_type: self.machine.machine_type,
            status,
            occupant,
            temperature_c: core.state.temperature_c,
            wear: core.state.wear,
            wear_alert: core.wear_alert,
            mounted_tool: core.mounted_tool.clone(),
            operations: core.operations,
            busy_seconds: core.busy_seconds,
        });
    }

    fn refresh_physics(&self) {
        let core = &*self.core;
        self.machine.status_tx.send_modify(|snap| {
            snap.temperature_c = core.state.temperature_c;
            snap.wear = core.state.wear;
            snap.wear_alert = core.wear_alert;
            snap.busy_seconds = core.busy_seconds;
        });
    }

    fn event(&self, kind: TrackingEventKind, tool: Option<String>) -> TrackingEvent {
        TrackingEvent::new(
            self.machine.name.clone(),
            kind,
            self.piece.clone(),
            self.machine.clock.now(),
        )
        .with_tool(tool)
    }

    /// Tool change or fixturing before an operation, bracketed by
    /// `setup_start`/`setup_end`. The machine cools while it is set up.
    pub async fn setup(
        &mut self,
        tool: Option<&Tool>,
        shutdown: &mut Shutdown,
    ) -> Result<PhaseOutcome, MachineError> {
        let tool_name = tool.map(|t| t.name.clone());
        let start = self.event(TrackingEventKind::start(Phase::Setup), tool_name.clone());
        self.machine.publisher.publish(start.clone());

        let range = self.machine.settings.setup_seconds;
        let setup_s = signal::uniform(&mut self.core.rng, range.min, range.max);
        let begun = self.machine.clock.elapsed();
        let outcome = self.machine.clock.sleep_or_cancel(sim_secs(setup_s), shutdown).await;
        let spent = self.machine.clock.elapsed().saturating_sub(begun).as_secs_f64();
        let cooled_s = if outcome.is_ok() { setup_s } else { spent.min(setup_s) };
        self.core
            .state
            .advance(&self.machine.constants, cooled_s, Load::Idle, 1.0)?;

        if outcome.is_err() {
            let abort = start.closed_as(TrackingEventKind::aborted(Phase::Setup), self.machine.clock.now());
            self.machine.publisher.publish(abort);
            return Ok(PhaseOutcome::Aborted);
        }

        if tool_name.is_some() && self.core.mounted_tool != tool_name {
            debug!(machine = %self.machine.name, tool = ?tool_name, "tool changed");
            self.core.mounted_tool = tool_name.clone();
        }
        self.publish_status(MachineStatus::Setup);
        self.machine
            .publisher
            .publish(start.closed_as(TrackingEventKind::end(Phase::Setup), self.machine.clock.now()));
        Ok(PhaseOutcome::Completed)
    }

    /// Runs one routing step for `duration_s` simulated seconds, emitting a
    /// sensor reading at every full sample interval.
    pub async fn run_operation(
        &mut self,
        step: &RouteStep,
        duration_s: f64,
        shutdown: &mut Shutdown,
    ) -> Result<PhaseOutcome, MachineError> {
        let quality = step.tool.as_ref().map_or(1.0, |t| t.quality);
        let interval = self.machine.settings.sample_interval_s;
        let duration_s = duration_s.max(0.0);
        let ticks = (duration_s / interval).floor() as u64;
        let remainder = duration_s - ticks as f64 * interval;

        self.publish_status(MachineStatus::Processing);
        let start = self.event(
            TrackingEventKind::start(Phase::Processing),
            step.tool.as_ref().map(|t| t.name.clone()),
        );
        self.machine.publisher.publish(start.clone());

        for _ in 0..ticks {
            if !self.process_for(interval, quality, shutdown).await? {
                return Ok(self.abort_processing(&start));
            }
            let data = {
                let core = &mut *self.core;
                signal::sample(
                    self.machine.machine_type,
                    &core.baseline,
                    &self.machine.constants,
                    &core.state,
                    &mut core.rng,
                )
            };
            self.machine.publisher.publish(SensorReading {
                entity: self.machine.name.clone(),
                data,
                timestamp: self.machine.clock.now(),
            });
        }
        if remainder > 0.0 && !self.process_for(remainder, quality, shutdown).await? {
            return Ok(self.abort_processing(&start));
        }

        self.core.operations += 1;
        self.publish_status(MachineStatus::Processing);
        self.machine.publisher.publish(
            start.closed_as(TrackingEventKind::end(Phase::Processing), self.machine.clock.now()),
        );
        Ok(PhaseOutcome::Completed)
    }

    /// Processes for `dt_s`, or for the part of it that elapsed before
    /// shutdown. Returns false when cut short.
    async fn process_for(
        &mut self,
        dt_s: f64,
        tool_quality: f64,
        shutdown: &mut Shutdown,
    ) -> Result<bool, MachineError> {
        let begun = self.machine.clock.elapsed();
        let finished = self
            .machine
            .clock
            .sleep_or_cancel(sim_secs(dt_s), shutdown)
            .await
            .is_ok();
        let spent = if finished {
            dt_s
        } else {
            let elapsed = self.machine.clock.elapsed().saturating_sub(begun);
            elapsed.as_secs_f64().min(dt_s)
        };
        self.accrue(spent, tool_quality)?;
        Ok(finished)
    }

    fn accrue(&mut self, dt_s: f64, tool_quality: f64) -> Result<(), MachineError> {
        let constants = &self.machine.constants;
        let core = &mut *self.core;
        core.state.advance(constants, dt_s, Load::Processing, tool_quality)?;
        core.busy_seconds += dt_s;
        if !core.wear_alert && core.state.wear >= constants.wear_warning {
            core.wear_alert = true;
            warn!(
                machine = %self.machine.name,
                wear = core.state.wear,
                threshold = constants.wear_warning,
                "tool wear above warning threshold"
            );
        }
        self.refresh_physics();
        Ok(())
    }

    fn abort_processing(&self, start: &TrackingEvent) -> PhaseOutcome {
        let abort = start.closed_as(TrackingEventKind::aborted(Phase::Processing), self.machine.clock.now());
        self.machine.publisher.publish(abort);
        PhaseOutcome::Aborted
    }

    /// Hands the machine back. Equivalent to dropping the token.
    pub fn release(self) {}
}

impl Drop for Occupancy {
    fn drop(&mut self) {
        self.core.released_at = self.machine.clock.elapsed();
        self.publish_status(MachineStatus::Idle);
        self.machine.holders.fetch_sub(1, Ordering::SeqCst);
        debug!(machine = %self.machine.name, piece = %self.piece, "machine released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piece::OperationKind;
    use crate::shutdown;
    use crate::sink::MemorySink;
    use chrono::{DateTime, Utc};
    use rand::SeedableRng;

    fn clock(multiplier: f64) -> SimClock {
        let epoch = DateTime::parse_from_rfc3339("2025-01-01T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        SimClock::new(multiplier, epoch).unwrap()
    }

    fn machine(machine_type: MachineType, sink: Arc<MemorySink>) -> Arc<Machine> {
        machine_with(machine_type, PhysicsConstants::for_type(machine_type), sink)
    }

    fn machine_with(
        machine_type: MachineType,
        constants: PhysicsConstants,
        sink: Arc<MemorySink>,
    ) -> Arc<Machine> {
        Arc::new(Machine::new(
            "M1",
            machine_type,
            constants,
            MachineSettings {
                setup_seconds: SecondsRange { min: 2.0, max: 2.0 },
                sample_interval_s: 1.0,
            },
            StdRng::seed_from_u64(42),
            clock(100.0),
            Arc::new(Publisher::new(sink)),
        ))
    }

    fn step(duration_s: f64) -> RouteStep {
        RouteStep {
            machine: "M1".to_string(),
            operation: OperationKind::Mill,
            duration_s,
            tool: Some(Tool::new("TM10")),
        }
    }

    fn events(sink: &MemorySink) -> Vec<String> {
        sink.records()
            .iter()
            .filter(|r| r.is_tracking())
            .map(|r| r.json().unwrap()["event"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_acquire_fails_busy() {
        let sink = Arc::new(MemorySink::new());
        let m = machine(MachineType::Saw, sink);
        let first = m.try_acquire(&"PZ001".into()).unwrap();
        assert_eq!(m.status(), MachineStatus::Setup);
        assert_eq!(m.snapshot().occupant, Some("PZ001".into()));

        let second = m.try_acquire(&"PZ002".into());
        match second {
            Err(MachineError::Busy { machine, occupant }) => {
                assert_eq!(machine, "M1");
                assert_eq!(occupant, Some("PZ001".into()));
            }
            other => panic!("expected Busy, got {other:?}"),
        }

        first.release();
        assert_eq!(m.status(), MachineStatus::Idle);
        assert_eq!(m.snapshot().occupant, None);
        assert!(m.try_acquire(&"PZ002".into()).is_ok());
        assert_eq!(m.peak_holders(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_brackets_and_heats() {
        let sink = Arc::new(MemorySink::new());
        let m = machine(MachineType::Milling, Arc::clone(&sink));
        let (_trigger, mut shutdown) = shutdown::channel();

        let mut occ = m.acquire(&"PZ001".into(), &mut shutdown).await.unwrap().unwrap();
        let tool = Tool::new("TM10");
        assert_eq!(occ.setup(Some(&tool), &mut shutdown).await.unwrap(), PhaseOutcome::Completed);
        assert_eq!(m.snapshot().mounted_tool.as_deref(), Some("TM10"));
        assert_eq!(
            occ.run_operation(&step(5.5), 5.5, &mut shutdown).await.unwrap(),
            PhaseOutcome::Completed
        );
        assert_eq!(m.status(), MachineStatus::Processing);
        occ.release();

        assert_eq!(
            events(&sink),
            ["setup_start", "setup_end", "processing_start", "processing_end"]
        );
        let temps: Vec<f64> = sink
            .records()
            .iter()
            .filter(|r| r.is_sensor())
            .map(|r| r.json().unwrap()["data"]["temperature"].as_f64().unwrap())
            .collect();
        assert_eq!(temps.len(), 5);
        assert!(temps.windows(2).all(|w| w[1] >= w[0]));
        assert!(temps[0] > 20.0);

        let snap = m.snapshot();
        assert_eq!(snap.status, MachineStatus::Idle);
        assert_eq!(snap.operations, 1);
        assert!((snap.busy_seconds - 5.5).abs() < 1e-9);
        assert!(snap.wear > 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_gets_machine_after_release() {
        let sink = Arc::new(MemorySink::new());
        let m = machine(MachineType::Lathe, sink);
        let (_trigger, shutdown) = shutdown::channel();

        let holder = m.try_acquire(&"PZ001".into()).unwrap();
        let waiter = {
            let m = Arc::clone(&m);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let occ = m.acquire(&"PZ002".into(), &mut shutdown).await.unwrap().unwrap();
                occ.piece().clone()
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        drop(holder);
        assert_eq!(waiter.await.unwrap(), PieceId::from("PZ002"));
        assert_eq!(m.peak_holders(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_processing_closes_phase() {
        let sink = Arc::new(MemorySink::new());
        let m = machine(MachineType::Saw, Arc::clone(&sink));
        let (trigger, mut shutdown) = shutdown::channel();

        let mut occ = m.try_acquire(&"PZ001".into()).unwrap();
        occ.setup(None, &mut shutdown).await.unwrap();
        let stopper = tokio::spawn(async move {
            // 5.5 simulated seconds into the operation.
            tokio::time::sleep(Duration::from_millis(55)).await;
            trigger.trigger();
        });
        let outcome = occ.run_operation(&step(60.0), 60.0, &mut shutdown).await.unwrap();
        assert_eq!(outcome, PhaseOutcome::Aborted);
        drop(occ);
        stopper.await.unwrap();

        assert_eq!(
            events(&sink),
            ["setup_start", "setup_end", "processing_start", "processing_aborted"]
        );
        let snap = m.snapshot();
        assert_eq!(snap.operations, 0);
        assert_eq!(snap.status, MachineStatus::Idle);
        // The half tick before the cancel still counts.
        assert!((snap.busy_seconds - 5.5).abs() < 0.01, "{}", snap.busy_seconds);
        let five_ticks = 5.0 * PhysicsConstants::for_type(MachineType::Saw).wear_rate;
        assert!(snap.wear > five_ticks);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wear_alert_raised_once_and_machine_keeps_working() {
        let sink = Arc::new(MemorySink::new());
        let constants = PhysicsConstants {
            wear_rate: 0.01,
            wear_warning: 0.001,
            ..PhysicsConstants::for_type(MachineType::Milling)
        };
        let m = machine_with(MachineType::Milling, constants, Arc::clone(&sink));
        let (_trigger, mut shutdown) = shutdown::channel();
        assert!(!m.snapshot().wear_alert);

        let mut occ = m.try_acquire(&"PZ001".into()).unwrap();
        let outcome = occ.run_operation(&step(5.0), 5.0, &mut shutdown).await.unwrap();
        assert_eq!(outcome, PhaseOutcome::Completed);
        assert!(m.snapshot().wear_alert);
        drop(occ);
        assert!(m.snapshot().wear_alert);

        let mut occ = m.try_acquire(&"PZ002".into()).unwrap();
        let outcome = occ.run_operation(&step(5.0), 5.0, &mut shutdown).await.unwrap();
        assert_eq!(outcome, PhaseOutcome::Completed);
        drop(occ);

        let snap = m.snapshot();
        assert!(snap.wear_alert);
        assert_eq!(snap.operations, 2);
        assert_eq!(
            events(&sink),
            ["processing_start", "processing_end", "processing_start", "processing_end"]
        );
        assert_eq!(sink.records().iter().filter(|r| r.is_sensor()).count(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_time_cools_on_next_acquire() {
        let sink = Arc::new(MemorySink::new());
        let m = machine(MachineType::Milling, sink);
        let (_trigger, mut shutdown) = shutdown::channel();

        let mut occ = m.try_acquire(&"PZ001".into()).unwrap();
        occ.run_operation(&step(600.0), 600.0, &mut shutdown).await.unwrap();
        drop(occ);
        let hot = m.snapshot().temperature_c;

        // One simulated hour idle.
        tokio::time::sleep(Duration::from_secs(36)).await;
        let occ = m.try_acquire(&"PZ002".into()).unwrap();
        let cooled = m.snapshot().temperature_c;
        drop(occ);
        assert!(cooled < hot);
        assert!(cooled >= 20.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shut_down_only_when_free() {
        let sink = Arc::new(MemorySink::new());
        let m = machine(MachineType::Saw, sink);
        let occ = m.try_acquire(&"PZ001".into()).unwrap();
        assert!(!m.shut_down());
        drop(occ);
        assert!(m.shut_down());
        assert_eq!(m.status(), MachineStatus::Offline);
    }
}
