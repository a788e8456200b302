//! foia-throttle - adaptive per-host throttling for concurrent fetchers.
//!
//! Gates how many requests run against each host at once and recommends how
//! long to wait before the next one. The delay adapts to how the host
//! responds: backoff reports (429/503) raise a per-host pressure level at
//! most once per sensitivity window, successes lower it right away.
//!
//! ```no_run
//! use std::time::Duration;
//! use foia_throttle::{HostConfig, RateLimiter};
//!
//! # async fn fetch(url: &str) -> u16 { 200 }
//! # async fn example() -> foia_throttle::ThrottleResult<()> {
//! let limiter = RateLimiter::new();
//! let url = "https://example.com/records/1.pdf";
//! limiter.register(url, HostConfig::new(2, Duration::from_millis(500)))?;
//!
//! tokio::time::sleep(limiter.delay(url)).await;
//! limiter.acquire(url).await?;
//! let status = fetch(url).await;
//! limiter.release(url)?;
//! limiter.report_response_status(url, status);
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod gate;
mod host;
mod limiter;
mod pressure;
mod registry;

pub use config::{
    HostConfig, ThrottleConfig, DEFAULT_BASE_DELAY, DEFAULT_MAX_CONCURRENCY,
    DEFAULT_SENSITIVITY_WINDOW, ENV_BASE_DELAY_MS, ENV_MAX_CONCURRENCY,
    ENV_SENSITIVITY_WINDOW_SECS,
};
pub use error::{MisuseError, ThrottleError, ThrottleResult};
pub use gate::{ConcurrencyGate, GatePermit};
pub use host::extract_host;
pub use limiter::RateLimiter;
pub use pressure::{
    DelayController, FixedJitter, Jitter, Pressure, PressureTable, ThreadRngJitter, MAX_PRESSURE,
    PRESSURE_LEVELS,
};
pub use registry::{HostRegistry, HostState, HostStats};
