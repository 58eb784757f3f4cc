//! Sandbox configuration
//!
//! [`SandboxConfig`] holds the service-wide limits and the defaults new
//! contexts start from. Callers may override a subset of the defaults per
//! context through [`ContextOptions`]; the merged, clamped result is a
//! [`SandboxOptions`] value that never changes for the lifetime of the
//! context.

use crate::error::ConfigError;
use crate::host::StorageLimits;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

/// Absolute ceiling for a single execution, whatever the caller asks for
pub const MAX_EXECUTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Environment variable prefix; nested keys use a double underscore
pub const ENV_PREFIX: &str = "SANDBOX";

/// Modules extensions may `require` without being denied
pub fn default_allowed_modules() -> Vec<String> {
    vec!["uuid".to_string(), "util".to_string(), "events".to_string()]
}

/// Service-wide sandbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Default wall-clock timeout per execution
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Default interpreter heap ceiling (bytes)
    pub memory_limit: usize,

    /// Modules that resolve to host shims instead of denial stubs
    pub allowed_modules: Vec<String>,

    /// Host globals kept in addition to the core language built-ins
    pub allowed_globals: Vec<String>,

    /// Maximum serialized result size (bytes)
    pub max_output_size: usize,

    /// Maximum source unit size (bytes)
    pub max_code_size: usize,

    /// Forward extension console output to host logs
    pub logging: bool,

    /// Hosts `sandbox.http.fetch` may reach unless a context narrows it
    pub default_allowed_hosts: Vec<String>,

    /// Whether the per-(user, extension) execution limiter is active
    pub rate_limit_enabled: bool,

    /// Executions allowed per (user, extension) per minute
    pub rate_limit_per_minute: u32,

    /// Concurrent live contexts allowed per extension
    pub max_contexts_per_extension: usize,

    /// Idle time after which the reaper destroys a context
    #[serde(with = "humantime_serde")]
    pub idle_ttl: Duration,

    /// How often the reaper sweeps
    #[serde(with = "humantime_serde")]
    pub reap_interval: Duration,

    /// Global active-context count that triggers a warning
    pub soft_context_limit: usize,

    /// Global active-context count that triggers emergency cleanup
    pub hard_context_limit: usize,

    /// Idle time that makes a context eligible for emergency cleanup
    #[serde(with = "humantime_serde")]
    pub emergency_idle: Duration,

    /// Errors retained per context (oldest dropped first)
    pub max_errors_per_context: usize,

    /// Buffered lifecycle events before slow subscribers lag
    pub event_channel_capacity: usize,

    /// Bytes (keys plus JSON values) `sandbox.storage` may hold per extension
    pub storage_max_bytes: usize,

    /// Keys `sandbox.storage` may hold per extension
    pub storage_max_keys: usize,

    /// Largest single JSON value accepted by `sandbox.storage.set`
    pub storage_max_value_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            memory_limit: 64 * 1024 * 1024, // 64MB
            allowed_modules: default_allowed_modules(),
            allowed_globals: Vec::new(),
            max_output_size: 1024 * 1024, // 1MB
            max_code_size: 256 * 1024,
            logging: true,
            default_allowed_hosts: Vec::new(),
            rate_limit_enabled: true,
            rate_limit_per_minute: 10,
            max_contexts_per_extension: 3,
            idle_ttl: Duration::from_secs(30 * 60),
            reap_interval: Duration::from_secs(60),
            soft_context_limit: 50,
            hard_context_limit: 100,
            emergency_idle: Duration::from_secs(5 * 60),
            max_errors_per_context: 50,
            event_channel_capacity: 1024,
            storage_max_bytes: 5 * 1024 * 1024,
            storage_max_keys: 1000,
            storage_max_value_bytes: 1024 * 1024,
        }
    }
}

impl SandboxConfig {
    /// Load configuration from defaults, an optional file and `SANDBOX__*`
    /// environment variables, in increasing order of precedence.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let defaults = config::Config::try_from(&Self::default())?;
        let mut builder = config::Config::builder().add_source(defaults);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("allowed_modules")
                    .with_list_parse_key("allowed_globals")
                    .with_list_parse_key("default_allowed_hosts"),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout.is_zero() {
            return Err(ConfigError::Invalid("timeout must be greater than zero".into()));
        }
        if self.memory_limit == 0 {
            return Err(ConfigError::Invalid("memory_limit must be greater than zero".into()));
        }
        if self.max_output_size == 0 || self.max_code_size == 0 {
            return Err(ConfigError::Invalid(
                "max_output_size and max_code_size must be greater than zero".into(),
            ));
        }
        if self.rate_limit_enabled && self.rate_limit_per_minute == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit_per_minute must be greater than zero when rate limiting is enabled"
                    .into(),
            ));
        }
        if self.max_contexts_per_extension == 0 {
            return Err(ConfigError::Invalid(
                "max_contexts_per_extension must be greater than zero".into(),
            ));
        }
        if self.soft_context_limit >= self.hard_context_limit {
            return Err(ConfigError::Invalid(format!(
                "soft_context_limit ({}) must be below hard_context_limit ({})",
                self.soft_context_limit, self.hard_context_limit
            )));
        }
        if self.reap_interval.is_zero() {
            return Err(ConfigError::Invalid("reap_interval must be greater than zero".into()));
        }
        if self.storage_max_keys == 0 || self.storage_max_value_bytes == 0 {
            return Err(ConfigError::Invalid(
                "storage_max_keys and storage_max_value_bytes must be greater than zero".into(),
            ));
        }
        if self.storage_max_value_bytes > self.storage_max_bytes {
            return Err(ConfigError::Invalid(format!(
                "storage_max_value_bytes ({}) must not exceed storage_max_bytes ({})",
                self.storage_max_value_bytes, self.storage_max_bytes
            )));
        }
        if self.event_channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event_channel_capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn storage_limits(&self) -> StorageLimits {
        StorageLimits {
            max_bytes: self.storage_max_bytes,
            max_keys: self.storage_max_keys,
            max_value_bytes: self.storage_max_value_bytes,
        }
    }

    /// Options a context gets when the caller overrides nothing.
    pub fn default_options(&self) -> SandboxOptions {
        SandboxOptions {
            timeout: self.timeout.min(MAX_EXECUTION_TIMEOUT),
            memory_limit: self.memory_limit,
            allowed_modules: self.allowed_modules.iter().cloned().collect(),
            allowed_globals: self.allowed_globals.iter().cloned().collect(),
            max_output_size: self.max_output_size,
            logging: self.logging,
            permissions: BTreeSet::new(),
            allowed_hosts: self.default_allowed_hosts.iter().cloned().collect(),
        }
    }

    /// Merge caller overrides over the configured defaults.
    pub fn resolve_options(&self, overrides: &ContextOptions) -> SandboxOptions {
        let mut options = self.default_options();

        if let Some(timeout) = overrides.timeout {
            options.timeout = timeout;
        }
        if let Some(memory_limit) = overrides.memory_limit {
            options.memory_limit = memory_limit;
        }
        if let Some(modules) = &overrides.allowed_modules {
            options.allowed_modules = modules.iter().cloned().collect();
        }
        if let Some(globals) = &overrides.allowed_globals {
            options.allowed_globals = globals.iter().cloned().collect();
        }
        if let Some(max_output_size) = overrides.max_output_size {
            options.max_output_size = max_output_size;
        }
        if let Some(logging) = overrides.logging {
            options.logging = logging;
        }
        if let Some(permissions) = &overrides.permissions {
            options.permissions = permissions.iter().cloned().collect();
        }
        if let Some(hosts) = &overrides.allowed_hosts {
            options.allowed_hosts = hosts.iter().map(|h| h.to_ascii_lowercase()).collect();
        }

        options.timeout = clamp_timeout(options.timeout);
        options
    }
}

fn clamp_timeout(timeout: Duration) -> Duration {
    if timeout.is_zero() {
        Duration::from_millis(1)
    } else {
        timeout.min(MAX_EXECUTION_TIMEOUT)
    }
}

/// Caller-supplied per-context overrides; unset fields fall back to
/// [`SandboxConfig`] defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ContextOptions {
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,
    pub memory_limit: Option<usize>,
    pub allowed_modules: Option<Vec<String>>,
    pub allowed_globals: Option<Vec<String>>,
    pub max_output_size: Option<usize>,
    pub logging: Option<bool>,
    pub permissions: Option<Vec<String>>,
    pub allowed_hosts: Option<Vec<String>>,
}

impl ContextOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn with_max_output_size(mut self, bytes: usize) -> Self {
        self.max_output_size = Some(bytes);
        self
    }

    pub fn with_logging(mut self, logging: bool) -> Self {
        self.logging = Some(logging);
        self
    }

    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions = Some(permissions.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_allowed_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_hosts = Some(hosts.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_allowed_globals<I, S>(mut self, globals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_globals = Some(globals.into_iter().map(Into::into).collect());
        self
    }
}

/// Resolved, immutable options of one context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxOptions {
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub memory_limit: usize,
    pub allowed_modules: BTreeSet<String>,
    pub allowed_globals: BTreeSet<String>,
    pub max_output_size: usize,
    pub logging: bool,
    pub permissions: BTreeSet<String>,
    pub allowed_hosts: BTreeSet<String>,
}

impl SandboxOptions {
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }
}

impl Default for SandboxOptions {
    fn default() -> Self {
        SandboxConfig::default().default_options()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = SandboxConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.memory_limit, 64 * 1024 * 1024);
        assert_eq!(config.max_output_size, 1024 * 1024);
        assert_eq!(config.rate_limit_per_minute, 10);
        assert_eq!(config.max_contexts_per_extension, 3);
        assert_eq!(config.idle_ttl, Duration::from_secs(1800));
        assert_eq!(config.soft_context_limit, 50);
        assert_eq!(config.hard_context_limit, 100);
        assert_eq!(config.emergency_idle, Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_timeout_is_clamped_to_ceiling() {
        let config = SandboxConfig::default();
        let options =
            config.resolve_options(&ContextOptions::default().with_timeout(Duration::from_secs(60)));
        assert_eq!(options.timeout, MAX_EXECUTION_TIMEOUT);

        let options = config
            .resolve_options(&ContextOptions::default().with_timeout(Duration::from_millis(50)));
        assert_eq!(options.timeout, Duration::from_millis(50));
    }

    #[test]
    fn test_overrides_replace_only_given_fields() {
        let config = SandboxConfig::default();
        let options = config.resolve_options(
            &ContextOptions::default()
                .with_permissions(["storage"])
                .with_allowed_hosts(["API.Example.com"]),
        );
        assert!(options.has_permission("storage"));
        assert!(!options.has_permission("network"));
        assert!(options.allowed_hosts.contains("api.example.com"));
        assert_eq!(options.memory_limit, config.memory_limit);
        assert!(options.allowed_modules.contains("uuid"));
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let config = SandboxConfig {
            soft_context_limit: 100,
            hard_context_limit: 50,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = SandboxConfig {
            timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SandboxConfig {
            storage_max_bytes: 1024,
            storage_max_value_bytes: 4096,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_reads_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sandbox.toml");
        std::fs::write(
            &path,
            "timeout = \"2s\"\nrate_limit_per_minute = 25\ndefault_allowed_hosts = [\"api.example.com\"]\n",
        )
        .unwrap();

        let config = SandboxConfig::load(Some(&path)).unwrap();
        assert_eq!(config.timeout, Duration::from_secs(2));
        assert_eq!(config.rate_limit_per_minute, 25);
        assert_eq!(config.default_allowed_hosts, vec!["api.example.com".to_string()]);
        assert_eq!(config.max_contexts_per_extension, 3);
    }

    #[test]
    fn test_context_options_deserialize_camel_case() {
        let options: ContextOptions =
            serde_json::from_str(r#"{"timeout":"50ms","maxOutputSize":10,"permissions":["events"]}"#)
                .unwrap();
        assert_eq!(options.timeout, Some(Duration::from_millis(50)));
        assert_eq!(options.max_output_size, Some(10));
        assert_eq!(options.permissions, Some(vec!["events".to_string()]));
    }
}
