//! Configuration settings for the sentinel proxy.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::ProxyError;

/// Main configuration structure for the proxy.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub proxy: ProxyConfig,
    pub central: CentralConfig,
    pub security: SecurityConfig,
    #[serde(default)]
    pub flood: FloodConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub order: OrderConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Address the proxy listens on for charge point connections.
    pub listen_addr: String,
}

/// Upstream central system configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CentralConfig {
    /// WebSocket URI of the central system.
    pub uri: String,
    /// Bounded wait for an immediate correlated reply after forwarding,
    /// in seconds. Expiry means "no immediate reply", never an error.
    #[serde(default = "default_response_wait")]
    pub response_wait_seconds: u64,
}

/// Scope of the nonce cache used for replay detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NonceScope {
    /// One cache shared by every connection. Detects a nonce replayed
    /// across connections impersonating different identities.
    Global,
    /// Each connection gets its own cache, and a fresh namespace on
    /// reconnect. Session-local protection only.
    PerConnection,
}

impl Default for NonceScope {
    fn default() -> Self {
        Self::Global
    }
}

/// Envelope security configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    /// Path to the shared HMAC secret file.
    pub secret_path: PathBuf,
    /// Allowed clock skew between sender timestamp and local clock.
    #[serde(default = "default_allowed_skew")]
    pub allowed_skew_seconds: u64,
    /// Nonce time-to-live in seconds.
    #[serde(default = "default_nonce_ttl")]
    pub nonce_ttl_seconds: u64,
    /// Hard cap on nonce cache entries (oldest-first eviction).
    #[serde(default = "default_nonce_cache_max")]
    pub nonce_cache_max: usize,
    /// Whether nonces are tracked process-wide or per connection.
    #[serde(default)]
    pub nonce_scope: NonceScope,
}

/// Flood detection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FloodConfig {
    /// Sliding window length in seconds.
    #[serde(default = "default_flood_window")]
    pub window_seconds: u64,
    /// Maximum messages allowed within the window.
    #[serde(default = "default_flood_limit")]
    pub limit: usize,
}

/// Liveness watchdog configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LivenessConfig {
    /// Silence longer than this is a suppression event.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_seconds: u64,
    /// Watchdog scan interval in seconds.
    #[serde(default = "default_scan_interval")]
    pub scan_interval_seconds: u64,
}

/// Expected-sequence configuration for the order validator.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderConfig {
    /// Session phases in expected order. Actions not listed here are not
    /// ordering-sensitive and pass unchecked.
    #[serde(default = "default_expected_actions")]
    pub expected_actions: Vec<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format ("pretty" or "json").
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Optional log file path.
    pub file: Option<PathBuf>,
}

/// Limits configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Maximum WebSocket message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Maximum concurrent charge point connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Audit logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    /// Whether audit logging is enabled.
    #[serde(default = "default_audit_enabled")]
    pub enabled: bool,
    /// Path to the audit log file.
    #[serde(default = "default_audit_log_path")]
    pub log_path: PathBuf,
}

// Default value functions

fn default_response_wait() -> u64 {
    2
}

fn default_allowed_skew() -> u64 {
    60
}

fn default_nonce_ttl() -> u64 {
    300
}

fn default_nonce_cache_max() -> usize {
    10_000
}

fn default_flood_window() -> u64 {
    2
}

fn default_flood_limit() -> usize {
    5
}

fn default_heartbeat_timeout() -> u64 {
    30
}

fn default_scan_interval() -> u64 {
    5
}

fn default_expected_actions() -> Vec<String> {
    [
        "BootNotification",
        "Heartbeat",
        "StartTransaction",
        "StopTransaction",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_max_message_size() -> usize {
    1_048_576 // 1MB
}

fn default_max_connections() -> usize {
    100
}

fn default_audit_enabled() -> bool {
    true
}

fn default_audit_log_path() -> PathBuf {
    PathBuf::from("/var/log/ocpp-sentinel/audit.log")
}

impl Default for FloodConfig {
    fn default() -> Self {
        Self {
            window_seconds: default_flood_window(),
            limit: default_flood_limit(),
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_seconds: default_heartbeat_timeout(),
            scan_interval_seconds: default_scan_interval(),
        }
    }
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self {
            expected_actions: default_expected_actions(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: default_audit_enabled(),
            log_path: default_audit_log_path(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ProxyError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ProxyError::Config {
            message: format!("Failed to read config file '{}': {}", path.display(), e),
        })?;

        let settings: Settings = toml::from_str(&content).map_err(|e| ProxyError::Config {
            message: format!("Failed to parse config file '{}': {}", path.display(), e),
        })?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate the settings.
    pub fn validate(&self) -> Result<(), ProxyError> {
        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ProxyError::Config {
                message: format!(
                    "Invalid log level '{}'. Valid levels: {:?}",
                    self.logging.level, valid_levels
                ),
            });
        }

        // Validate log format
        let valid_formats = ["pretty", "json"];
        if !valid_formats.contains(&self.logging.format.to_lowercase().as_str()) {
            return Err(ProxyError::Config {
                message: format!(
                    "Invalid log format '{}'. Valid formats: {:?}",
                    self.logging.format, valid_formats
                ),
            });
        }

        // Validate central URI scheme
        if !self.central.uri.starts_with("ws://") && !self.central.uri.starts_with("wss://") {
            return Err(ProxyError::Config {
                message: format!(
                    "Invalid central URI '{}'. Must be a ws:// or wss:// URI",
                    self.central.uri
                ),
            });
        }

        if self.flood.limit == 0 {
            return Err(ProxyError::Config {
                message: "flood.limit must be at least 1".to_string(),
            });
        }

        if self.flood.window_seconds == 0 {
            return Err(ProxyError::Config {
                message: "flood.window_seconds must be at least 1".to_string(),
            });
        }

        if self.security.nonce_cache_max == 0 {
            return Err(ProxyError::Config {
                message: "security.nonce_cache_max must be at least 1".to_string(),
            });
        }

        if self.liveness.scan_interval_seconds == 0 {
            return Err(ProxyError::Config {
                message: "liveness.scan_interval_seconds must be at least 1".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
            [proxy]
            listen_addr = "127.0.0.1:9090"

            [central]
            uri = "ws://127.0.0.1:9000"

            [security]
            secret_path = "/etc/ocpp-sentinel/hmac.key"
        "#
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let settings: Settings = toml::from_str(minimal_toml()).unwrap();
        settings.validate().unwrap();

        assert_eq!(settings.central.response_wait_seconds, 2);
        assert_eq!(settings.security.allowed_skew_seconds, 60);
        assert_eq!(settings.security.nonce_ttl_seconds, 300);
        assert_eq!(settings.security.nonce_cache_max, 10_000);
        assert_eq!(settings.security.nonce_scope, NonceScope::Global);
        assert_eq!(settings.flood.window_seconds, 2);
        assert_eq!(settings.flood.limit, 5);
        assert_eq!(settings.liveness.heartbeat_timeout_seconds, 30);
        assert_eq!(settings.liveness.scan_interval_seconds, 5);
        assert_eq!(settings.order.expected_actions[0], "BootNotification");
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn test_nonce_scope_parses_kebab_case() {
        let toml_str = format!(
            "{}\nnonce_scope = \"per-connection\"\n",
            minimal_toml().trim_end()
        );
        let settings: Settings = toml::from_str(&toml_str).unwrap();
        assert_eq!(settings.security.nonce_scope, NonceScope::PerConnection);
    }

    #[test]
    fn test_invalid_central_uri_rejected() {
        let toml_str = minimal_toml().replace("ws://127.0.0.1:9000", "http://127.0.0.1:9000");
        let settings: Settings = toml::from_str(&toml_str).unwrap();
        assert!(matches!(
            settings.validate(),
            Err(ProxyError::Config { .. })
        ));
    }

    #[test]
    fn test_zero_flood_limit_rejected() {
        let toml_str = format!(
            "{}\n[flood]\nlimit = 0\n",
            minimal_toml().trim_end()
        );
        let settings: Settings = toml::from_str(&toml_str).unwrap();
        assert!(matches!(
            settings.validate(),
            Err(ProxyError::Config { .. })
        ));
    }
}
