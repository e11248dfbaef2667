//! Signal hub configuration.
//!
//! Configuration is loaded from environment variables. The credential secret
//! is redacted in Debug output.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;

use secrecy::SecretString;
use thiserror::Error;

/// Default WebSocket bind address.
pub const DEFAULT_HUB_BIND_ADDRESS: &str = "0.0.0.0:9400";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:9401";

/// Default peer count at or above which a session switches to relay routing.
pub const DEFAULT_FULL_MESH_THRESHOLD: usize = 6;

/// Default fan-out limit used to size the relay set (`ceil(peers / fanout)`).
pub const DEFAULT_RELAY_FANOUT: usize = 6;

/// Default maintenance cycle interval in seconds.
pub const DEFAULT_MAINTENANCE_INTERVAL_SECONDS: u64 = 5;

/// Default grace period before an empty session is removed, in seconds.
pub const DEFAULT_EMPTY_SESSION_GRACE_SECONDS: u64 = 60;

/// Default keep-alive timeout before a connection is reaped, in seconds.
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECONDS: u64 = 45;

/// Default reaper scan interval in seconds.
pub const DEFAULT_REAPER_INTERVAL_SECONDS: u64 = 10;

/// Default rate-limit window in seconds.
pub const DEFAULT_RATE_WINDOW_SECONDS: u64 = 60;

/// Default per-window budget for session-control operations (join/leave/auth).
pub const DEFAULT_SESSION_CONTROL_LIMIT: u32 = 30;

/// Default per-window budget for signal forwarding.
pub const DEFAULT_SIGNAL_LIMIT: u32 = 600;

/// Default per-window budget for everything else.
pub const DEFAULT_RATE_LIMIT: u32 = 120;

/// Default idle horizon after which rate-limit buckets are evicted, in seconds.
pub const DEFAULT_BUCKET_RETENTION_SECONDS: u64 = 300;

/// Latency reports above this are discarded as implausible, in milliseconds.
pub const DEFAULT_MAX_LATENCY_MS: u64 = 60_000;

/// Topology planning parameters, threaded into every session.
#[derive(Debug, Clone, Copy)]
pub struct TopologySettings {
    /// Peer counts at or below this stay full-mesh.
    pub full_mesh_threshold: usize,
    /// Relay set size is `ceil(peers / relay_fanout)`.
    pub relay_fanout: usize,
    /// Latency reports above this are discarded.
    pub max_latency_ms: u64,
}

impl Default for TopologySettings {
    fn default() -> Self {
        Self {
            full_mesh_threshold: DEFAULT_FULL_MESH_THRESHOLD,
            relay_fanout: DEFAULT_RELAY_FANOUT,
            max_latency_ms: DEFAULT_MAX_LATENCY_MS,
        }
    }
}

/// Per-category request budgets for the rate limiter.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitSettings {
    /// Window length.
    pub window: Duration,
    /// Budget for join/leave/authenticate.
    pub session_control_limit: u32,
    /// Budget for signal forwarding.
    pub signal_limit: u32,
    /// Budget for everything else.
    pub default_limit: u32,
    /// Buckets idle longer than this are evicted.
    pub retention: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(DEFAULT_RATE_WINDOW_SECONDS),
            session_control_limit: DEFAULT_SESSION_CONTROL_LIMIT,
            signal_limit: DEFAULT_SIGNAL_LIMIT,
            default_limit: DEFAULT_RATE_LIMIT,
            retention: Duration::from_secs(DEFAULT_BUCKET_RETENTION_SECONDS),
        }
    }
}

/// Signal hub configuration, loaded from environment variables with
/// sensible defaults. The credential secret is redacted in Debug output.
#[derive(Clone)]
pub struct Config {
    /// WebSocket server bind address (default: "0.0.0.0:9400").
    pub hub_bind_address: String,

    /// Health endpoint bind address (default: "0.0.0.0:9401").
    pub health_bind_address: String,

    /// Shared secret for credential verification (base64-encoded).
    /// Protected by `SecretString` to prevent accidental logging.
    pub auth_secret: SecretString,

    /// Topology planning parameters.
    pub topology: TopologySettings,

    /// Rate limiter budgets.
    pub rate_limits: RateLimitSettings,

    /// Maintenance cycle interval.
    pub maintenance_interval: Duration,

    /// Grace period before an empty session is removed.
    pub empty_session_grace: Duration,

    /// Keep-alive timeout before a connection is reaped.
    pub heartbeat_timeout: Duration,

    /// Reaper scan interval.
    pub reaper_interval: Duration,
}

/// Custom Debug implementation that redacts the secret.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("hub_bind_address", &self.hub_bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("auth_secret", &"[REDACTED]")
            .field("topology", &self.topology)
            .field("rate_limits", &self.rate_limits)
            .field("maintenance_interval", &self.maintenance_interval)
            .field("empty_session_grace", &self.empty_session_grace)
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .field("reaper_interval", &self.reaper_interval)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

fn parsed_or<T: std::str::FromStr>(vars: &HashMap<String, String>, key: &str, default: T) -> T {
    vars.get(key).and_then(|s| s.parse().ok()).unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let auth_secret = SecretString::from(
            vars.get("LATTICE_AUTH_SECRET")
                .ok_or_else(|| ConfigError::MissingEnvVar("LATTICE_AUTH_SECRET".to_string()))?
                .clone(),
        );

        let hub_bind_address = vars
            .get("LATTICE_HUB_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HUB_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("LATTICE_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let full_mesh_threshold = parsed_or(
            vars,
            "LATTICE_FULL_MESH_THRESHOLD",
            DEFAULT_FULL_MESH_THRESHOLD,
        );
        if full_mesh_threshold == 0 {
            return Err(ConfigError::InvalidValue(
                "LATTICE_FULL_MESH_THRESHOLD must be at least 1".to_string(),
            ));
        }

        let relay_fanout = parsed_or(vars, "LATTICE_RELAY_FANOUT", DEFAULT_RELAY_FANOUT);
        if relay_fanout == 0 {
            return Err(ConfigError::InvalidValue(
                "LATTICE_RELAY_FANOUT must be at least 1".to_string(),
            ));
        }

        let topology = TopologySettings {
            full_mesh_threshold,
            relay_fanout,
            max_latency_ms: parsed_or(vars, "LATTICE_MAX_LATENCY_MS", DEFAULT_MAX_LATENCY_MS),
        };

        let rate_limits = RateLimitSettings {
            window: Duration::from_secs(parsed_or(
                vars,
                "LATTICE_RATE_WINDOW_SECONDS",
                DEFAULT_RATE_WINDOW_SECONDS,
            )),
            session_control_limit: parsed_or(
                vars,
                "LATTICE_SESSION_CONTROL_LIMIT",
                DEFAULT_SESSION_CONTROL_LIMIT,
            ),
            signal_limit: parsed_or(vars, "LATTICE_SIGNAL_LIMIT", DEFAULT_SIGNAL_LIMIT),
            default_limit: parsed_or(vars, "LATTICE_DEFAULT_LIMIT", DEFAULT_RATE_LIMIT),
            retention: Duration::from_secs(parsed_or(
                vars,
                "LATTICE_BUCKET_RETENTION_SECONDS",
                DEFAULT_BUCKET_RETENTION_SECONDS,
            )),
        };

        Ok(Config {
            hub_bind_address,
            health_bind_address,
            auth_secret,
            topology,
            rate_limits,
            maintenance_interval: Duration::from_secs(parsed_or(
                vars,
                "LATTICE_MAINTENANCE_INTERVAL_SECONDS",
                DEFAULT_MAINTENANCE_INTERVAL_SECONDS,
            )),
            empty_session_grace: Duration::from_secs(parsed_or(
                vars,
                "LATTICE_EMPTY_SESSION_GRACE_SECONDS",
                DEFAULT_EMPTY_SESSION_GRACE_SECONDS,
            )),
            heartbeat_timeout: Duration::from_secs(parsed_or(
                vars,
                "LATTICE_HEARTBEAT_TIMEOUT_SECONDS",
                DEFAULT_HEARTBEAT_TIMEOUT_SECONDS,
            )),
            reaper_interval: Duration::from_secs(parsed_or(
                vars,
                "LATTICE_REAPER_INTERVAL_SECONDS",
                DEFAULT_REAPER_INTERVAL_SECONDS,
            )),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([(
            "LATTICE_AUTH_SECRET".to_string(),
            "dGVzdC1zZWNyZXQtdGhhdC1pcy1sb25nLWVub3VnaC0xMjM0".to_string(),
        )])
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&base_vars()).expect("config should load");

        assert_eq!(config.hub_bind_address, DEFAULT_HUB_BIND_ADDRESS);
        assert_eq!(config.health_bind_address, DEFAULT_HEALTH_BIND_ADDRESS);
        assert_eq!(
            config.topology.full_mesh_threshold,
            DEFAULT_FULL_MESH_THRESHOLD
        );
        assert_eq!(config.topology.relay_fanout, DEFAULT_RELAY_FANOUT);
        assert_eq!(
            config.rate_limits.window,
            Duration::from_secs(DEFAULT_RATE_WINDOW_SECONDS)
        );
        assert_eq!(
            config.empty_session_grace,
            Duration::from_secs(DEFAULT_EMPTY_SESSION_GRACE_SECONDS)
        );
        assert!(!config.auth_secret.expose_secret().is_empty());
    }

    #[test]
    fn test_from_vars_custom_values() {
        let mut vars = base_vars();
        vars.insert(
            "LATTICE_HUB_BIND_ADDRESS".to_string(),
            "127.0.0.1:9500".to_string(),
        );
        vars.insert("LATTICE_FULL_MESH_THRESHOLD".to_string(), "10".to_string());
        vars.insert("LATTICE_RELAY_FANOUT".to_string(), "4".to_string());
        vars.insert(
            "LATTICE_EMPTY_SESSION_GRACE_SECONDS".to_string(),
            "5".to_string(),
        );
        vars.insert("LATTICE_SIGNAL_LIMIT".to_string(), "50".to_string());

        let config = Config::from_vars(&vars).expect("config should load");

        assert_eq!(config.hub_bind_address, "127.0.0.1:9500");
        assert_eq!(config.topology.full_mesh_threshold, 10);
        assert_eq!(config.topology.relay_fanout, 4);
        assert_eq!(config.empty_session_grace, Duration::from_secs(5));
        assert_eq!(config.rate_limits.signal_limit, 50);
    }

    #[test]
    fn test_missing_auth_secret() {
        let vars = HashMap::new();
        let result = Config::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "LATTICE_AUTH_SECRET")
        );
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let mut vars = base_vars();
        vars.insert("LATTICE_FULL_MESH_THRESHOLD".to_string(), "0".to_string());
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));

        let mut vars = base_vars();
        vars.insert("LATTICE_RELAY_FANOUT".to_string(), "0".to_string());
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let config = Config::from_vars(&base_vars()).expect("config should load");
        let debug_output = format!("{config:?}");

        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("dGVzdC1zZWNyZXQ"));
    }
}
