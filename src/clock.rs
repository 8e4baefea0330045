//! Simulated time.
//!
//! The clock scales every simulated duration by the configured multiplier
//! before handing it to `tokio::time`, and maps real elapsed time back to
//! simulated timestamps. Sleeps are per-caller; workers never wait on each
//! other through the clock.

use crate::error::ConfigError;
use crate::shutdown::{Cancelled, Shutdown};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct SimClock {
    multiplier: f64,
    epoch: DateTime<Utc>,
    origin: Instant,
}

impl SimClock {
    /// Starts a clock whose simulated time begins at `epoch`.
    pub fn new(multiplier: f64, epoch: DateTime<Utc>) -> Result<Self, ConfigError> {
        if !(multiplier.is_finite() && multiplier > 0.0) {
            return Err(ConfigError::InvalidValue {
                field: "time_multiplier",
                reason: format!("must be a finite number > 0, got {multiplier}"),
            });
        }
        Ok(Self {
            multiplier,
            epoch,
            origin: Instant::now(),
        })
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn epoch(&self) -> DateTime<Utc> {
        self.epoch
    }

    /// Real duration corresponding to `sim`.
    pub fn to_real(&self, sim: Duration) -> Duration {
        saturating_secs(sim.as_secs_f64() / self.multiplier)
    }

    /// Simulated time elapsed since the clock started.
    pub fn elapsed(&self) -> Duration {
        saturating_secs(self.origin.elapsed().as_secs_f64() * self.multiplier)
    }

    /// Current simulated timestamp, millisecond resolution.
    pub fn now(&self) -> DateTime<Utc> {
        let millis = i64::try_from(self.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.epoch + chrono::Duration::milliseconds(millis)
    }

    pub async fn sleep(&self, sim: Duration) {
        tokio::time::sleep(self.to_real(sim)).await;
    }

    /// Sleeps for `sim`, returning early if the run is being shut down.
    pub async fn sleep_or_cancel(&self, sim: Duration, shutdown: &mut Shutdown) -> Result<(), Cancelled> {
        if shutdown.is_triggered() {
            return Err(Cancelled);
        }
        tokio::select! {
            () = self.sleep(sim) => Ok(()),
            () = shutdown.triggered() => Err(Cancelled),
        }
    }
}

/// Simulated seconds as a `Duration`, clamping negatives and NaN to zero.
pub fn sim_secs(seconds: f64) -> Duration {
    saturating_secs(seconds)
}

fn saturating_secs(seconds: f64) -> Duration {
    if seconds.is_nan() || seconds <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
}
