//! Adaptive delay control.
//!
//! Each host carries a pressure level in `0..=MAX_PRESSURE`. Backoff reports
//! raise it by one, at most once per sensitivity window; successes lower it
//! by one unconditionally. The recommended delay is the pressure table entry
//! for the current level plus jitter drawn from `[0, 2 * base_delay)`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{MisuseError, ThrottleError, ThrottleResult};
use crate::registry::HostState;

/// Highest pressure level.
pub const MAX_PRESSURE: u8 = 20;

/// Number of entries in a pressure table.
pub const PRESSURE_LEVELS: usize = MAX_PRESSURE as usize + 1;

const DEFAULT_TABLE_SECS: [u64; PRESSURE_LEVELS] = [
    0, 5, 10, 20, 30, 40, 50, 60, 90, 120, 180, 240, 300, 600, 900, 1200, 1500, 1800, 2100, 2400,
    3600,
];

/// Maps pressure level to the dynamic part of the delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PressureTable {
    steps: [Duration; PRESSURE_LEVELS],
}

impl Default for PressureTable {
    fn default() -> Self {
        Self {
            steps: DEFAULT_TABLE_SECS.map(Duration::from_secs),
        }
    }
}

impl PressureTable {
    /// Build a table from one delay per level. The table must have exactly
    /// `PRESSURE_LEVELS` entries, start at zero and never decrease.
    pub fn new(steps: &[Duration]) -> ThrottleResult<Self> {
        let steps: [Duration; PRESSURE_LEVELS] = steps.try_into().map_err(|_| {
            MisuseError::InvalidPressureTable(format!(
                "expected {} entries, got {}",
                PRESSURE_LEVELS,
                steps.len()
            ))
        })?;

        if !steps[0].is_zero() {
            return Err(MisuseError::InvalidPressureTable(format!(
                "level 0 must map to zero, got {:?}",
                steps[0]
            ))
            .into());
        }
        if let Some(level) = steps.windows(2).position(|w| w[1] < w[0]) {
            return Err(MisuseError::InvalidPressureTable(format!(
                "level {} ({:?}) is lower than level {} ({:?})",
                level + 1,
                steps[level + 1],
                level,
                steps[level]
            ))
            .into());
        }

        Ok(Self { steps })
    }

    /// Build a table from seconds.
    pub fn from_secs(secs: &[f64]) -> ThrottleResult<Self> {
        let steps = secs
            .iter()
            .map(|&s| {
                Duration::try_from_secs_f64(s).map_err(|_| {
                    ThrottleError::from(MisuseError::InvalidPressureTable(format!(
                        "invalid delay {}",
                        s
                    )))
                })
            })
            .collect::<ThrottleResult<Vec<_>>>()?;
        Self::new(&steps)
    }

    /// Dynamic delay for a level; levels above the maximum clamp to it.
    pub fn delay_for(&self, level: u8) -> Duration {
        self.steps[usize::from(level.min(MAX_PRESSURE))]
    }

    /// All levels, from 0 to `MAX_PRESSURE`.
    pub fn steps(&self) -> &[Duration] {
        &self.steps
    }
}

/// Source of jitter, injectable so tests can pin the random component.
pub trait Jitter: Send + Sync + fmt::Debug {
    /// A value in `[0, ceiling)`, or zero when the ceiling is zero.
    fn draw(&self, ceiling: Duration) -> Duration;
}

/// Uniform jitter from the thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRngJitter;

impl Jitter for ThreadRngJitter {
    fn draw(&self, ceiling: Duration) -> Duration {
        if ceiling.is_zero() {
            return Duration::ZERO;
        }
        let secs = rand::rng().random_range(0.0..ceiling.as_secs_f64());
        below(ceiling, Duration::from_secs_f64(secs))
    }
}

/// Deterministic jitter: always the same fraction of the ceiling.
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter {
    fraction: f64,
}

impl FixedJitter {
    /// `fraction` is clamped into `[0, 1)`.
    pub fn new(fraction: f64) -> Self {
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0 - f64::EPSILON)
        } else {
            0.0
        };
        Self { fraction }
    }

    pub fn zero() -> Self {
        Self::new(0.0)
    }
}

impl Jitter for FixedJitter {
    fn draw(&self, ceiling: Duration) -> Duration {
        if ceiling.is_zero() {
            return Duration::ZERO;
        }
        below(ceiling, ceiling.mul_f64(self.fraction))
    }
}

/// Float rounding can land a draw on the ceiling itself.
fn below(ceiling: Duration, drawn: Duration) -> Duration {
    if drawn >= ceiling {
        ceiling - Duration::from_nanos(1)
    } else {
        drawn
    }
}

/// Mutable pressure for one host.
#[derive(Debug, Clone)]
pub struct Pressure {
    level: u8,
    changed_at: Instant,
}

impl Pressure {
    /// Level 0, with the window starting at `now`.
    pub fn new(now: Instant) -> Self {
        Self {
            level: 0,
            changed_at: now,
        }
    }

    /// Current pressure level.
    pub fn level(&self) -> u8 {
        self.level
    }

    /// When the level last changed, or creation time if it never has.
    pub fn changed_at(&self) -> Instant {
        self.changed_at
    }

    /// Raise by one if `window` has passed since the last change.
    /// Returns whether the level moved.
    pub fn increase(&mut self, window: Duration, now: Instant) -> bool {
        if self.level >= MAX_PRESSURE {
            return false;
        }
        if now.saturating_duration_since(self.changed_at) < window {
            return false;
        }
        self.level += 1;
        self.stamp(now);
        true
    }

    /// Lower by one, floored at zero. Always refreshes the change time.
    /// Returns whether the level moved.
    pub fn decrease(&mut self, now: Instant) -> bool {
        self.stamp(now);
        if self.level == 0 {
            return false;
        }
        self.level -= 1;
        true
    }

    fn stamp(&mut self, now: Instant) {
        self.changed_at = self.changed_at.max(now);
    }
}

/// Turns per-host pressure into recommended delays and applies
/// success/backoff signals.
#[derive(Debug, Clone)]
pub struct DelayController {
    table: PressureTable,
    jitter: Arc<dyn Jitter>,
}

impl Default for DelayController {
    fn default() -> Self {
        Self::new(PressureTable::default(), Arc::new(ThreadRngJitter))
    }
}

impl DelayController {
    pub fn new(table: PressureTable, jitter: Arc<dyn Jitter>) -> Self {
        Self { table, jitter }
    }

    pub fn table(&self) -> &PressureTable {
        &self.table
    }

    /// Dynamic component for a level, without jitter.
    pub fn dynamic_delay(&self, level: u8) -> Duration {
        self.table.delay_for(level)
    }

    /// How long to wait before the next request to `host`.
    ///
    /// Jitter is redrawn on every call, so call this right before sleeping.
    pub fn recommended_delay(&self, host: &HostState) -> Duration {
        let dynamic = self.dynamic_delay(host.pressure_level());
        let jitter = self.jitter.draw(host.base_delay().saturating_mul(2));
        dynamic.saturating_add(jitter)
    }

    /// Returns whether the level moved.
    pub fn increase_pressure(&self, host: &HostState) -> bool {
        let window = host.sensitivity_window();
        let (moved, level) =
            host.with_pressure(|p| (p.increase(window, Instant::now()), p.level()));
        if moved {
            debug!("Pressure for {} raised to {}", host.host_id(), level);
        } else {
            debug!(
                "Pressure for {} held at {} (within sensitivity window or at maximum)",
                host.host_id(),
                level
            );
        }
        moved
    }

    /// Returns whether the level moved.
    pub fn decrease_pressure(&self, host: &HostState) -> bool {
        let (moved, level) = host.with_pressure(|p| (p.decrease(Instant::now()), p.level()));
        if moved {
            debug!("Pressure for {} lowered to {}", host.host_id(), level);
        }
        moved
    }
}
