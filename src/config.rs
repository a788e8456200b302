//! Throttle configuration and types.
//!
//! Configuration can be built in code or loaded from a TOML file:
//!
//! ```toml
//! sensitivity_window_seconds = 10
//! auto_register = true
//!
//! [defaults]
//! max_concurrency = 2
//! base_delay_seconds = 1.0
//!
//! [hosts."example.com"]
//! max_concurrency = 4
//! base_delay_seconds = 0.5
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::{MisuseError, ThrottleError, ThrottleResult};
use crate::host::extract_host;
use crate::pressure::PressureTable;

/// Minimum time between two pressure increases for the same host.
pub const DEFAULT_SENSITIVITY_WINDOW: Duration = Duration::from_secs(10);

/// Concurrency cap used for hosts registered on demand.
pub const DEFAULT_MAX_CONCURRENCY: usize = 2;

/// Base delay used for hosts registered on demand.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

pub const ENV_SENSITIVITY_WINDOW_SECS: &str = "FOIA_THROTTLE_SENSITIVITY_WINDOW_SECS";
pub const ENV_BASE_DELAY_MS: &str = "FOIA_THROTTLE_BASE_DELAY_MS";
pub const ENV_MAX_CONCURRENCY: &str = "FOIA_THROTTLE_MAX_CONCURRENCY";

/// Per-host settings supplied at registration time.
#[derive(Debug, Clone, PartialEq)]
pub struct HostConfig {
    /// Cap on simultaneous in-flight requests to the host.
    pub max_concurrency: usize,
    /// Jitter ceiling is twice this value.
    pub base_delay: Duration,
    /// Overrides the global sensitivity window when set.
    pub sensitivity_window: Option<Duration>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            base_delay: DEFAULT_BASE_DELAY,
            sensitivity_window: None,
        }
    }
}

impl HostConfig {
    pub fn new(max_concurrency: usize, base_delay: Duration) -> Self {
        Self {
            max_concurrency,
            base_delay,
            sensitivity_window: None,
        }
    }

    /// Build from a floating point number of seconds, rejecting negative or
    /// non-finite delays.
    pub fn from_secs(max_concurrency: usize, base_delay_seconds: f64) -> ThrottleResult<Self> {
        let base_delay = secs_to_duration(base_delay_seconds, MisuseError::InvalidBaseDelay)?;
        let config = Self::new(max_concurrency, base_delay);
        config.validate()?;
        Ok(config)
    }

    pub fn with_sensitivity_window(mut self, window: Duration) -> Self {
        self.sensitivity_window = Some(window);
        self
    }

    pub fn validate(&self) -> ThrottleResult<()> {
        if self.max_concurrency == 0 {
            return Err(MisuseError::ZeroConcurrency.into());
        }
        if self.max_concurrency > tokio::sync::Semaphore::MAX_PERMITS {
            return Err(ThrottleError::Config(format!(
                "max_concurrency {} exceeds the supported maximum",
                self.max_concurrency
            )));
        }
        Ok(())
    }
}

/// Global throttle configuration.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Minimum time between successive pressure increases.
    pub sensitivity_window: Duration,
    /// Pressure level to dynamic delay mapping.
    pub pressure_table: PressureTable,
    /// Settings for hosts that were never registered explicitly.
    pub defaults: HostConfig,
    /// Register unknown hosts with `defaults` on first use. When false,
    /// unknown hosts are reported as errors.
    pub auto_register: bool,
    /// Panic on caller misuse instead of clamping and logging.
    pub strict_misuse: bool,
    /// Hosts registered up front by `RateLimiter::from_config`.
    pub hosts: HashMap<String, HostConfig>,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            sensitivity_window: DEFAULT_SENSITIVITY_WINDOW,
            pressure_table: PressureTable::default(),
            defaults: HostConfig::default(),
            auto_register: true,
            strict_misuse: cfg!(debug_assertions),
            hosts: HashMap::new(),
        }
    }
}

impl ThrottleConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(contents: &str) -> ThrottleResult<Self> {
        let file: ThrottleFile = toml::from_str(contents)?;
        file.into_config()
    }

    /// Load a TOML file from disk.
    pub fn load(path: &Path) -> ThrottleResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ThrottleError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Overlay values from the environment. Unparseable values are ignored
    /// with a warning.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Some(secs) = env_parse::<f64>(ENV_SENSITIVITY_WINDOW_SECS) {
            match secs_to_duration(secs, MisuseError::InvalidSensitivityWindow) {
                Ok(window) => self.sensitivity_window = window,
                Err(e) => warn!("Ignoring {}: {}", ENV_SENSITIVITY_WINDOW_SECS, e),
            }
        }
        if let Some(ms) = env_parse::<u64>(ENV_BASE_DELAY_MS) {
            self.defaults.base_delay = Duration::from_millis(ms);
        }
        if let Some(max) = env_parse::<usize>(ENV_MAX_CONCURRENCY) {
            if max == 0 {
                warn!("Ignoring {}: must be at least 1", ENV_MAX_CONCURRENCY);
            } else {
                self.defaults.max_concurrency = max;
            }
        }
        self
    }

    /// Register a host to be created up front.
    pub fn with_host(mut self, host: &str, config: HostConfig) -> ThrottleResult<Self> {
        self.hosts.insert(extract_host(host)?, config);
        Ok(self)
    }

    pub fn validate(&self) -> ThrottleResult<()> {
        self.defaults.validate()?;
        for config in self.hosts.values() {
            config.validate()?;
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    let raw = std::env::var(var).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {}: cannot parse {:?}", var, raw);
            None
        }
    }
}

fn secs_to_duration(secs: f64, err: fn(String) -> MisuseError) -> ThrottleResult<Duration> {
    Duration::try_from_secs_f64(secs).map_err(|_| err(secs.to_string()).into())
}

/// On-disk layout, in seconds.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ThrottleFile {
    #[serde(default)]
    sensitivity_window_seconds: Option<f64>,
    #[serde(default)]
    pressure_table: Option<Vec<f64>>,
    #[serde(default)]
    auto_register: Option<bool>,
    #[serde(default)]
    strict_misuse: Option<bool>,
    #[serde(default)]
    defaults: Option<HostSection>,
    #[serde(default)]
    hosts: HashMap<String, HostSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct HostSection {
    #[serde(default)]
    max_concurrency: Option<usize>,
    #[serde(default)]
    base_delay_seconds: Option<f64>,
    #[serde(default)]
    sensitivity_window_seconds: Option<f64>,
}

impl HostSection {
    fn into_host_config(self, fallback: &HostConfig) -> ThrottleResult<HostConfig> {
        let base_delay = match self.base_delay_seconds {
            Some(secs) => secs_to_duration(secs, MisuseError::InvalidBaseDelay)?,
            None => fallback.base_delay,
        };
        let sensitivity_window = match self.sensitivity_window_seconds {
            Some(secs) => Some(secs_to_duration(
                secs,
                MisuseError::InvalidSensitivityWindow,
            )?),
            None => fallback.sensitivity_window,
        };
        let config = HostConfig {
            max_concurrency: self.max_concurrency.unwrap_or(fallback.max_concurrency),
            base_delay,
            sensitivity_window,
        };
        config.validate()?;
        Ok(config)
    }
}

impl ThrottleFile {
    fn into_config(self) -> ThrottleResult<ThrottleConfig> {
        let mut config = ThrottleConfig::default();

        if let Some(secs) = self.sensitivity_window_seconds {
            config.sensitivity_window =
                secs_to_duration(secs, MisuseError::InvalidSensitivityWindow)?;
        }
        if let Some(table) = self.pressure_table {
            config.pressure_table = PressureTable::from_secs(&table)?;
        }
        if let Some(auto_register) = self.auto_register {
            config.auto_register = auto_register;
        }
        if let Some(strict) = self.strict_misuse {
            config.strict_misuse = strict;
        }
        if let Some(defaults) = self.defaults {
            config.defaults = defaults.into_host_config(&HostConfig::default())?;
        }
        for (host, section) in self.hosts {
            let key = extract_host(&host)
                .map_err(|e| ThrottleError::Config(format!("[hosts.{:?}]: {}", host, e)))?;
            let host_config = section.into_host_config(&config.defaults)?;
            config.hosts.insert(key, host_config);
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Tests that modify environment variables must be serialized
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_env() {
        std::env::remove_var(ENV_SENSITIVITY_WINDOW_SECS);
        std::env::remove_var(ENV_BASE_DELAY_MS);
        std::env::remove_var(ENV_MAX_CONCURRENCY);
    }

    #[test]
    fn test_defaults() {
        let config = ThrottleConfig::default();
        assert_eq!(config.sensitivity_window, Duration::from_secs(10));
        assert_eq!(config.defaults.max_concurrency, 2);
        assert_eq!(config.defaults.base_delay, Duration::from_secs(1));
        assert!(config.auto_register);
        assert!(config.hosts.is_empty());
    }

    #[test]
    fn test_parse_full_file() {
        let config = ThrottleConfig::from_toml_str(
            r#"
            sensitivity_window_seconds = 30
            auto_register = false
            strict_misuse = false

            [defaults]
            max_concurrency = 3
            base_delay_seconds = 0.25

            [hosts."Example.com"]
            max_concurrency = 8

            [hosts."https://api.example.org:8443/v1"]
            base_delay_seconds = 2
            sensitivity_window_seconds = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.sensitivity_window, Duration::from_secs(30));
        assert!(!config.auto_register);
        assert!(!config.strict_misuse);
        assert_eq!(config.defaults.max_concurrency, 3);
        assert_eq!(config.defaults.base_delay, Duration::from_millis(250));

        let example = &config.hosts["example.com"];
        assert_eq!(example.max_concurrency, 8);
        // Falls back to [defaults]
        assert_eq!(example.base_delay, Duration::from_millis(250));

        let api = &config.hosts["api.example.org:8443"];
        assert_eq!(api.max_concurrency, 3);
        assert_eq!(api.base_delay, Duration::from_secs(2));
        assert_eq!(api.sensitivity_window, Some(Duration::from_secs(5)));
        assert_eq!(example.sensitivity_window, None);
    }

    #[test]
    fn test_empty_file_is_default() {
        let config = ThrottleConfig::from_toml_str("").unwrap();
        assert_eq!(config.sensitivity_window, DEFAULT_SENSITIVITY_WINDOW);
        assert_eq!(config.defaults, HostConfig::default());
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let err = ThrottleConfig::from_toml_str(
            r#"
            [hosts."example.com"]
            max_concurrency = 0
            "#,
        )
        .unwrap_err();
        assert_eq!(err, ThrottleError::Misuse(MisuseError::ZeroConcurrency));
    }

    #[test]
    fn test_rejects_negative_delay() {
        let err = ThrottleConfig::from_toml_str(
            r#"
            [defaults]
            base_delay_seconds = -1.0
            "#,
        )
        .unwrap_err();
        assert!(err.is_misuse());
    }

    #[test]
    fn test_rejects_non_monotonic_table() {
        let err = ThrottleConfig::from_toml_str(
            "pressure_table = [0, 5, 4, 20, 30, 40, 50, 60, 90, 120, 180, 240, 300, 600, 900, 1200, 1500, 1800, 2100, 2400, 3600]",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ThrottleError::Misuse(MisuseError::InvalidPressureTable(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_keys() {
        let err = ThrottleConfig::from_toml_str("max_conurrency = 3").unwrap_err();
        assert!(matches!(err, ThrottleError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("throttle.toml");
        std::fs::write(&path, "sensitivity_window_seconds = 2.5\n").unwrap();

        let config = ThrottleConfig::load(&path).unwrap();
        assert_eq!(config.sensitivity_window, Duration::from_millis(2500));

        let missing = ThrottleConfig::load(&dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(ThrottleError::Config(_))));
    }

    #[test]
    fn test_host_config_from_secs() {
        let config = HostConfig::from_secs(4, 1.5).unwrap();
        assert_eq!(config.base_delay, Duration::from_millis(1500));
        assert!(HostConfig::from_secs(1, f64::NAN).is_err());
        assert!(HostConfig::from_secs(0, 1.0).is_err());
    }

    #[test]
    fn test_env_overrides_applied() {
        let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();

        std::env::set_var(ENV_SENSITIVITY_WINDOW_SECS, "2.5");
        std::env::set_var(ENV_BASE_DELAY_MS, "250");
        std::env::set_var(ENV_MAX_CONCURRENCY, " 6 ");

        let config = ThrottleConfig::default().apply_env_overrides();
        assert_eq!(config.sensitivity_window, Duration::from_millis(2500));
        assert_eq!(config.defaults.base_delay, Duration::from_millis(250));
        assert_eq!(config.defaults.max_concurrency, 6);

        clear_env();
    }

    #[test]
    fn test_env_overrides_without_vars_keep_defaults() {
        let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();

        let config = ThrottleConfig::default().apply_env_overrides();
        assert_eq!(config.sensitivity_window, DEFAULT_SENSITIVITY_WINDOW);
        assert_eq!(config.defaults, HostConfig::default());
    }

    #[test]
    fn test_env_overrides_ignore_unparseable_values() {
        let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();

        std::env::set_var(ENV_SENSITIVITY_WINDOW_SECS, "soon");
        std::env::set_var(ENV_BASE_DELAY_MS, "fast");
        std::env::set_var(ENV_MAX_CONCURRENCY, "lots");

        let config = ThrottleConfig::default().apply_env_overrides();
        assert_eq!(config.sensitivity_window, DEFAULT_SENSITIVITY_WINDOW);
        assert_eq!(config.defaults.base_delay, DEFAULT_BASE_DELAY);
        assert_eq!(config.defaults.max_concurrency, DEFAULT_MAX_CONCURRENCY);

        clear_env();
    }

    #[test]
    fn test_env_overrides_reject_out_of_range_values() {
        let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();

        std::env::set_var(ENV_SENSITIVITY_WINDOW_SECS, "-3");
        std::env::set_var(ENV_BASE_DELAY_MS, "-250");
        std::env::set_var(ENV_MAX_CONCURRENCY, "0");

        let config = ThrottleConfig::default().apply_env_overrides();
        assert_eq!(config.sensitivity_window, DEFAULT_SENSITIVITY_WINDOW);
        assert_eq!(config.defaults.base_delay, DEFAULT_BASE_DELAY);
        assert_eq!(config.defaults.max_concurrency, DEFAULT_MAX_CONCURRENCY);

        // A valid value alongside a rejected one still applies.
        std::env::set_var(ENV_BASE_DELAY_MS, "500");
        let config = ThrottleConfig::default().apply_env_overrides();
        assert_eq!(config.defaults.base_delay, Duration::from_millis(500));
        assert_eq!(config.defaults.max_concurrency, DEFAULT_MAX_CONCURRENCY);

        clear_env();
    }
}
