//! Per-host state and the registry that owns it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::HostConfig;
use crate::error::{ThrottleError, ThrottleResult};
use crate::gate::ConcurrencyGate;
use crate::pressure::{Pressure, PressureTable};

/// State for a single host, shared by every caller fetching from it.
#[derive(Debug)]
pub struct HostState {
    host_id: String,
    base_delay: Duration,
    sensitivity_window: Duration,
    gate: Arc<ConcurrencyGate>,
    pressure: Mutex<Pressure>,
    last_seen: Mutex<Instant>,
    backoff_reports: AtomicU64,
    success_reports: AtomicU64,
}

impl HostState {
    pub fn new(
        host_id: impl Into<String>,
        config: &HostConfig,
        sensitivity_window: Duration,
        strict_misuse: bool,
    ) -> Self {
        let host_id = host_id.into();
        let now = Instant::now();
        Self {
            gate: Arc::new(ConcurrencyGate::new(
                host_id.clone(),
                config.max_concurrency,
                strict_misuse,
            )),
            host_id,
            base_delay: config.base_delay,
            sensitivity_window,
            pressure: Mutex::new(Pressure::new(now)),
            last_seen: Mutex::new(now),
            backoff_reports: AtomicU64::new(0),
            success_reports: AtomicU64::new(0),
        }
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn sensitivity_window(&self) -> Duration {
        self.sensitivity_window
    }

    pub fn max_concurrency(&self) -> usize {
        self.gate.max_concurrency()
    }

    pub fn in_flight(&self) -> usize {
        self.gate.in_flight()
    }

    pub fn gate(&self) -> &Arc<ConcurrencyGate> {
        &self.gate
    }

    pub fn pressure_level(&self) -> u8 {
        self.with_pressure(|p| p.level())
    }

    pub fn pressure_changed_at(&self) -> Instant {
        self.with_pressure(|p| p.changed_at())
    }

    /// Run `f` with the pressure lock held. Keep `f` short and await-free.
    pub fn with_pressure<R>(&self, f: impl FnOnce(&mut Pressure) -> R) -> R {
        let mut pressure = self.pressure.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut pressure)
    }

    /// Mark the host as used just now.
    pub fn touch(&self) {
        let now = Instant::now();
        let mut last_seen = self.last_seen.lock().unwrap_or_else(PoisonError::into_inner);
        if now > *last_seen {
            *last_seen = now;
        }
    }

    pub fn idle_for(&self) -> Duration {
        let last_seen = *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner);
        Instant::now().saturating_duration_since(last_seen)
    }

    pub(crate) fn record_backoff(&self) {
        self.backoff_reports.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_success(&self) {
        self.success_reports.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether `config` describes the settings this host was created with.
    fn matches(&self, config: &HostConfig, sensitivity_window: Duration) -> bool {
        self.max_concurrency() == config.max_concurrency
            && self.base_delay == config.base_delay
            && self.sensitivity_window == sensitivity_window
    }

    pub fn stats(&self, table: &PressureTable) -> HostStats {
        let pressure_level = self.pressure_level();
        HostStats {
            pressure_level,
            dynamic_delay: table.delay_for(pressure_level),
            base_delay: self.base_delay,
            in_flight: self.in_flight(),
            max_concurrency: self.max_concurrency(),
            total_acquired: self.gate.total_acquired(),
            backoff_reports: self.backoff_reports.load(Ordering::Relaxed),
            success_reports: self.success_reports.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time statistics for a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostStats {
    pub pressure_level: u8,
    /// Delay implied by the pressure level, before jitter.
    pub dynamic_delay: Duration,
    pub base_delay: Duration,
    pub in_flight: usize,
    pub max_concurrency: usize,
    pub total_acquired: u64,
    pub backoff_reports: u64,
    pub success_reports: u64,
}

/// Owns the `host_id -> HostState` mapping.
///
/// The map lock is only held to look up or insert an entry; everything
/// per-host lives behind the entry's `Arc`, so hosts never wait on each other.
#[derive(Debug)]
pub struct HostRegistry {
    hosts: RwLock<HashMap<String, Arc<HostState>>>,
    sensitivity_window: Duration,
    strict_misuse: bool,
}

impl HostRegistry {
    pub fn new(sensitivity_window: Duration, strict_misuse: bool) -> Self {
        Self {
            hosts: RwLock::new(HashMap::new()),
            sensitivity_window,
            strict_misuse,
        }
    }

    /// Create state for `host_id` unless it already exists.
    ///
    /// Registering an existing host is a no-op: its pressure and in-flight
    /// count are kept and the new settings are ignored.
    pub fn register(&self, host_id: &str, config: &HostConfig) -> ThrottleResult<Arc<HostState>> {
        config.validate()?;
        let window = config.sensitivity_window.unwrap_or(self.sensitivity_window);

        if let Some(existing) = self.lookup(host_id) {
            if !existing.matches(config, window) {
                debug!(
                    "Host {} already registered; ignoring new settings {:?}",
                    host_id, config
                );
            }
            return Ok(existing);
        }

        let mut hosts = self.hosts.write().unwrap_or_else(PoisonError::into_inner);
        let state = hosts.entry(host_id.to_string()).or_insert_with(|| {
            info!(
                "Registered host {} (max_concurrency={}, base_delay={:?})",
                host_id, config.max_concurrency, config.base_delay
            );
            Arc::new(HostState::new(
                host_id,
                config,
                window,
                self.strict_misuse,
            ))
        });
        Ok(Arc::clone(state))
    }

    /// Existing state for `host_id`, or new state built from `defaults`.
    pub fn get_or_register(
        &self,
        host_id: &str,
        defaults: &HostConfig,
    ) -> ThrottleResult<Arc<HostState>> {
        match self.lookup(host_id) {
            Some(state) => Ok(state),
            None => {
                debug!(
                    "Registering {} on first use with defaults {:?}",
                    host_id, defaults
                );
                self.register(host_id, defaults)
            }
        }
    }

    pub fn get(&self, host_id: &str) -> ThrottleResult<Arc<HostState>> {
        self.lookup(host_id)
            .ok_or_else(|| ThrottleError::UnknownHost(host_id.to_string()))
    }

    pub fn contains(&self, host_id: &str) -> bool {
        self.lookup(host_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.hosts.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All registered hosts.
    pub fn hosts(&self) -> Vec<Arc<HostState>> {
        self.hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Drop hosts that have nothing in flight, are not borrowed elsewhere,
    /// and have not been touched for `idle_for`. Returns how many were removed.
    pub fn remove_idle(&self, idle_for: Duration) -> usize {
        let mut hosts = self.hosts.write().unwrap_or_else(PoisonError::into_inner);
        let before = hosts.len();
        hosts.retain(|host_id, state| {
            let evict = state.in_flight() == 0
                && Arc::strong_count(state) == 1
                && state.idle_for() >= idle_for;
            if evict {
                debug!("Evicting idle host {}", host_id);
            }
            !evict
        });
        before - hosts.len()
    }

    fn lookup(&self, host_id: &str) -> Option<Arc<HostState>> {
        self.hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(host_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MisuseError;

    fn registry() -> HostRegistry {
        HostRegistry::new(Duration::from_secs(10), false)
    }

    #[tokio::test]
    async fn test_register_creates_fresh_state() {
        let registry = registry();
        let state = registry
            .register("example.com", &HostConfig::new(3, Duration::from_millis(200)))
            .unwrap();

        assert_eq!(state.host_id(), "example.com");
        assert_eq!(state.pressure_level(), 0);
        assert_eq!(state.in_flight(), 0);
        assert_eq!(state.max_concurrency(), 3);
        assert_eq!(state.base_delay(), Duration::from_millis(200));
        assert_eq!(state.sensitivity_window(), Duration::from_secs(10));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let registry = registry();
        let first = registry
            .register("example.com", &HostConfig::new(2, Duration::ZERO))
            .unwrap();
        assert!(first.gate().try_acquire());
        first.with_pressure(|p| p.increase(Duration::ZERO, Instant::now()));

        let second = registry
            .register("example.com", &HostConfig::new(7, Duration::from_secs(5)))
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.max_concurrency(), 2);
        assert_eq!(second.in_flight(), 1);
        assert_eq!(second.pressure_level(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_register_rejects_bad_config() {
        let registry = registry();
        let err = registry
            .register("example.com", &HostConfig::new(0, Duration::ZERO))
            .unwrap_err();
        assert_eq!(err, ThrottleError::Misuse(MisuseError::ZeroConcurrency));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_get_or_register_keeps_existing() {
        let registry = registry();
        let created = registry
            .get_or_register("example.com", &HostConfig::new(4, Duration::ZERO))
            .unwrap();
        assert_eq!(created.max_concurrency(), 4);

        let again = registry
            .get_or_register("example.com", &HostConfig::default())
            .unwrap();
        assert!(Arc::ptr_eq(&created, &again));
        assert_eq!(again.max_concurrency(), 4);
    }

    #[tokio::test]
    async fn test_get_unknown_host() {
        let registry = registry();
        assert_eq!(
            registry.get("nowhere.test").unwrap_err(),
            ThrottleError::UnknownHost("nowhere.test".to_string())
        );
        assert!(!registry.contains("nowhere.test"));
    }

    #[tokio::test]
    async fn test_per_host_window_override() {
        let registry = registry();
        let state = registry
            .register(
                "slow.example.com",
                &HostConfig::default().with_sensitivity_window(Duration::from_secs(60)),
            )
            .unwrap();
        assert_eq!(state.sensitivity_window(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_concurrent_registration_creates_one_entry() {
        let registry = Arc::new(registry());
        let handles: Vec<_> = (0..32)
            .map(|i| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    registry
                        .register("example.com", &HostConfig::new(i % 4 + 1, Duration::ZERO))
                        .unwrap()
                })
            })
            .collect();

        let mut states = Vec::new();
        for handle in handles {
            states.push(handle.await.unwrap());
        }
        assert_eq!(registry.len(), 1);
        assert!(states.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_idle() {
        let registry = registry();
        registry.register("idle.example.com", &HostConfig::default()).unwrap();
        let busy = registry.register("busy.example.com", &HostConfig::default()).unwrap();
        assert!(busy.gate().try_acquire());
        drop(busy);

        tokio::time::advance(Duration::from_secs(120)).await;
        assert_eq!(registry.remove_idle(Duration::from_secs(60)), 1);
        assert!(!registry.contains("idle.example.com"));
        assert!(registry.contains("busy.example.com"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_resets_idle_time() {
        let registry = registry();
        let state = registry.register("example.com", &HostConfig::default()).unwrap();
        tokio::time::advance(Duration::from_secs(120)).await;
        state.touch();
        drop(state);
        assert_eq!(registry.remove_idle(Duration::from_secs(60)), 0);
    }
}
