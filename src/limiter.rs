//! Adaptive per-host rate limiter.
//!
//! The entry point callers use. Wraps a `HostRegistry` and a
//! `DelayController`:
//! - `delay` recommends how long to wait before a request (it never sleeps)
//! - `acquire`/`release` bound concurrent requests per host
//! - `report_backoff`/`report_success` move the host's pressure level
//!
//! Unknown hosts are registered on first use with `ThrottleConfig::defaults`
//! unless `auto_register` is turned off.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{HostConfig, ThrottleConfig};
use crate::error::{MisuseError, ThrottleResult};
use crate::gate::GatePermit;
use crate::host::extract_host;
use crate::pressure::{DelayController, Jitter, ThreadRngJitter};
use crate::registry::{HostRegistry, HostState, HostStats};

/// Per-host concurrency and delay governor.
///
/// Cloning is cheap; clones share the same host state.
#[derive(Clone)]
pub struct RateLimiter {
    config: Arc<ThrottleConfig>,
    registry: Arc<HostRegistry>,
    controller: Arc<DelayController>,
}

impl RateLimiter {
    /// Create a new rate limiter with default config.
    pub fn new() -> Self {
        Self::with_config(ThrottleConfig::default())
    }

    /// Create a new rate limiter with custom config.
    ///
    /// Hosts listed in `config.hosts` are not registered; use `from_config`
    /// for that.
    pub fn with_config(config: ThrottleConfig) -> Self {
        let registry = HostRegistry::new(config.sensitivity_window, config.strict_misuse);
        let controller =
            DelayController::new(config.pressure_table.clone(), Arc::new(ThreadRngJitter));
        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            controller: Arc::new(controller),
        }
    }

    /// Validate `config` and register every host it lists.
    pub fn from_config(config: ThrottleConfig) -> ThrottleResult<Self> {
        config.validate()?;
        let limiter = Self::with_config(config);
        for (host, host_config) in &limiter.config.hosts {
            limiter.registry.register(host, host_config)?;
        }
        Ok(limiter)
    }

    /// Replace the jitter source.
    pub fn with_jitter(mut self, jitter: Arc<dyn Jitter>) -> Self {
        self.controller = Arc::new(DelayController::new(
            self.config.pressure_table.clone(),
            jitter,
        ));
        self
    }

    /// Extract host from URL.
    pub fn extract_host(url: &str) -> Option<String> {
        extract_host(url).ok()
    }

    /// Register the host of `url` with explicit settings.
    ///
    /// A host that is already known keeps its state and settings.
    pub fn register(&self, url: &str, config: HostConfig) -> ThrottleResult<()> {
        let host = extract_host(url)?;
        self.registry.register(&host, &config)?;
        Ok(())
    }

    /// Recommended wait before the next request to the host of `url`.
    ///
    /// Never sleeps and never fails: an unusable URL, or an unknown host
    /// when auto registration is off, yields zero.
    pub fn delay(&self, url: &str) -> Duration {
        match self.resolve(url) {
            Ok(state) => {
                state.touch();
                let delay = self.controller.recommended_delay(&state);
                debug!(
                    "Recommended delay for {} at pressure {}: {:?}",
                    state.host_id(),
                    state.pressure_level(),
                    delay
                );
                delay
            }
            Err(e) => {
                warn!("No delay for {}: {}", url, e);
                Duration::ZERO
            }
        }
    }

    /// Wait for a concurrency slot for the host of `url`.
    ///
    /// Cancel safe. Every successful call must be paired with `release`.
    pub async fn acquire(&self, url: &str) -> ThrottleResult<()> {
        let state = self.resolve(url)?;
        state.touch();
        state.gate().acquire().await
    }

    /// Take a concurrency slot only if one is free now.
    pub fn try_acquire(&self, url: &str) -> bool {
        match self.resolve(url) {
            Ok(state) => {
                state.touch();
                state.gate().try_acquire()
            }
            Err(e) => {
                warn!("Cannot acquire slot for {}: {}", url, e);
                false
            }
        }
    }

    /// Wait for a slot that is released when the returned permit drops.
    pub async fn acquire_permit(&self, url: &str) -> ThrottleResult<GatePermit> {
        let state = self.resolve(url)?;
        state.touch();
        Arc::clone(state.gate()).acquire_owned().await
    }

    /// Return a slot taken with `acquire` or `try_acquire`.
    pub fn release(&self, url: &str) -> ThrottleResult<()> {
        let host = extract_host(url)?;
        let state = match self.registry.get(&host) {
            Ok(state) => state,
            Err(_) => return self.misuse(MisuseError::ReleaseWithoutAcquire(host)),
        };
        state.touch();
        state.gate().release()
    }

    /// Report a throttled or failed request; may raise the host's pressure.
    pub fn report_backoff(&self, url: &str) {
        let Some(state) = self.resolve_for_report(url) else {
            return;
        };
        state.record_backoff();
        if self.controller.increase_pressure(&state) {
            let level = state.pressure_level();
            warn!(
                "Backing off {}: pressure {}, dynamic delay {:?}",
                state.host_id(),
                level,
                self.controller.dynamic_delay(level)
            );
        }
    }

    /// Report a request that completed without throttling signals; lowers
    /// the host's pressure.
    pub fn report_success(&self, url: &str) {
        let Some(state) = self.resolve_for_report(url) else {
            return;
        };
        state.record_success();
        if self.controller.decrease_pressure(&state) && state.pressure_level() == 0 {
            info!("Host {} recovered from backoff", state.host_id());
        }
    }

    /// Check if a status code is definitely a rate limit.
    pub fn is_definite_rate_limit(status_code: u16) -> bool {
        matches!(status_code, 429 | 503)
    }

    /// Classify a response status and report it.
    ///
    /// 429 and 503 count as backoff, 2xx and 3xx as success; anything else
    /// says nothing about throttling and leaves pressure alone.
    pub fn report_response_status(&self, url: &str, status_code: u16) {
        if Self::is_definite_rate_limit(status_code) {
            self.report_backoff(url);
        } else if (200..400).contains(&status_code) {
            self.report_success(url);
        } else {
            debug!("HTTP {} from {}, pressure unchanged", status_code, url);
        }
    }

    /// Current pressure level, if the host is known.
    pub fn pressure_level(&self, url: &str) -> Option<u8> {
        self.known(url).map(|state| state.pressure_level())
    }

    /// Statistics for one host, if known.
    pub fn host_stats(&self, url: &str) -> Option<HostStats> {
        self.known(url)
            .map(|state| state.stats(self.controller.table()))
    }

    /// Statistics for all hosts.
    pub fn stats(&self) -> HashMap<String, HostStats> {
        self.registry
            .hosts()
            .into_iter()
            .map(|state| {
                (
                    state.host_id().to_string(),
                    state.stats(self.controller.table()),
                )
            })
            .collect()
    }

    /// Forget hosts that have been idle for at least `idle_for`.
    pub fn evict_idle(&self, idle_for: Duration) -> usize {
        let removed = self.registry.remove_idle(idle_for);
        if removed > 0 {
            debug!("Evicted {} idle hosts", removed);
        }
        removed
    }

    /// Configuration this limiter was built with.
    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// Shared host registry.
    pub fn registry(&self) -> &HostRegistry {
        &self.registry
    }

    /// Delay controller shared by all hosts.
    pub fn controller(&self) -> &DelayController {
        &self.controller
    }

    /// Look up the host of `url`, registering it with defaults if allowed.
    fn resolve(&self, url: &str) -> ThrottleResult<Arc<HostState>> {
        let host = extract_host(url)?;
        if !self.config.auto_register {
            return self.registry.get(&host);
        }
        self.registry.get_or_register(&host, &self.config.defaults)
    }

    fn resolve_for_report(&self, url: &str) -> Option<Arc<HostState>> {
        match self.resolve(url) {
            Ok(state) => {
                state.touch();
                Some(state)
            }
            Err(e) => {
                warn!("Ignoring report for {}: {}", url, e);
                None
            }
        }
    }

    fn known(&self, url: &str) -> Option<Arc<HostState>> {
        let host = extract_host(url).ok()?;
        self.registry.get(&host).ok()
    }

    fn misuse(&self, err: MisuseError) -> ThrottleResult<()> {
        if self.config.strict_misuse {
            panic!("{}", err);
        }
        warn!("{}; ignoring", err);
        Err(err.into())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("hosts", &self.registry.len())
            .finish_non_exhaustive()
    }
}
