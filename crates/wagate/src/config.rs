use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;

use serde::Deserialize;
use thiserror::Error;

/// Floor for `dispatch.interval_ms`: at most one send starts per three seconds.
pub const MIN_DISPATCH_INTERVAL_MS: u64 = 3_000;

// ============================================================================
// Config (root)
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    /// Session names in registration order. Auto-routing walks this order.
    #[serde(default = "default_sessions")]
    pub sessions: Vec<String>,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub sidecar: SidecarConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub attachments: AttachmentConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub auto_reply: Vec<AutoReplyRule>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            sessions: default_sessions(),
            credentials: CredentialsConfig::default(),
            sidecar: SidecarConfig::default(),
            session: SessionConfig::default(),
            dispatch: DispatchConfig::default(),
            attachments: AttachmentConfig::default(),
            relay: RelayConfig::default(),
            auto_reply: Vec::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        let config: Self = serde_saphyr::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sessions.is_empty() {
            return Err(ConfigError::Invalid("at least one session is required".into()));
        }
        for (i, name) in self.sessions.iter().enumerate() {
            if name.is_empty() || name == crate::routing::AUTO {
                return Err(ConfigError::Invalid(format!(
                    "invalid session name '{}'",
                    name
                )));
            }
            if self.sessions[..i].contains(name) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate session name '{}'",
                    name
                )));
            }
        }

        if self.dispatch.interval_ms < MIN_DISPATCH_INTERVAL_MS {
            return Err(ConfigError::Invalid(format!(
                "dispatch.interval_ms must be at least {}",
                MIN_DISPATCH_INTERVAL_MS
            )));
        }

        let durations = [
            ("session.reconnect_delay_ms", self.session.reconnect_delay_ms),
            ("server.request_timeout_seconds", self.server.request_timeout_seconds),
            ("server.rate_limit.window_seconds", self.server.rate_limit.window_seconds),
            ("sidecar.connect_timeout_seconds", self.sidecar.connect_timeout_seconds),
            ("sidecar.send_timeout_seconds", self.sidecar.send_timeout_seconds),
            ("attachments.probe_timeout_seconds", self.attachments.probe_timeout_seconds),
            ("attachments.download_timeout_seconds", self.attachments.download_timeout_seconds),
            ("relay.timeout_seconds", self.relay.timeout_seconds),
        ];
        if let Some((key, _)) = durations.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{} must be greater than zero", key)));
        }
        Ok(())
    }
}

fn default_sessions() -> Vec<String> {
    ["tipd", "upb", "perpus", "edok"]
        .into_iter()
        .map(String::from)
        .collect()
}

// ============================================================================
// ServerConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_seconds: default_request_timeout(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_request_timeout() -> u64 {
    300
}

/// Per-client request cap over a fixed window.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_seconds: default_window_seconds(),
        }
    }
}

fn default_max_requests() -> usize {
    100
}

fn default_window_seconds() -> u64 {
    60
}

// ============================================================================
// CredentialsConfig / SidecarConfig / SessionConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default = "default_credentials_path")]
    pub path: PathBuf,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            path: default_credentials_path(),
        }
    }
}

fn default_credentials_path() -> PathBuf {
    PathBuf::from("sessions")
}

#[derive(Debug, Deserialize)]
pub struct SidecarConfig {
    #[serde(default = "default_sidecar_url")]
    pub url: String,
    #[serde(default = "default_sidecar_connect_timeout")]
    pub connect_timeout_seconds: u64,
    #[serde(default = "default_sidecar_send_timeout")]
    pub send_timeout_seconds: u64,
}

impl SidecarConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_seconds)
    }
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            url: default_sidecar_url(),
            connect_timeout_seconds: default_sidecar_connect_timeout(),
            send_timeout_seconds: default_sidecar_send_timeout(),
        }
    }
}

fn default_sidecar_url() -> String {
    "ws://127.0.0.1:8765".to_string()
}

fn default_sidecar_connect_timeout() -> u64 {
    30
}

fn default_sidecar_send_timeout() -> u64 {
    60
}

#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
}

impl SessionConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: default_reconnect_delay(),
        }
    }
}

fn default_reconnect_delay() -> u64 {
    5_000
}

// ============================================================================
// DispatchConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct DispatchConfig {
    /// Minimum spacing between the starts of two consecutive jobs.
    #[serde(default = "default_dispatch_interval")]
    pub interval_ms: u64,
}

impl DispatchConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_dispatch_interval(),
        }
    }
}

fn default_dispatch_interval() -> u64 {
    3_000
}

// ============================================================================
// AttachmentConfig
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct AttachmentConfig {
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_seconds: u64,
    #[serde(default = "default_download_timeout")]
    pub download_timeout_seconds: u64,
    #[serde(default = "default_cleanup_delay")]
    pub cleanup_delay_ms: u64,
}

impl AttachmentConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_seconds)
    }

    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.cleanup_delay_ms)
    }
}

impl Default for AttachmentConfig {
    fn default() -> Self {
        Self {
            temp_dir: default_temp_dir(),
            probe_timeout_seconds: default_probe_timeout(),
            download_timeout_seconds: default_download_timeout(),
            cleanup_delay_ms: default_cleanup_delay(),
        }
    }
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("tmp")
}

fn default_probe_timeout() -> u64 {
    10
}

fn default_download_timeout() -> u64 {
    20
}

fn default_cleanup_delay() -> u64 {
    3_000
}

// ============================================================================
// RelayConfig / AutoReplyRule
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RelayConfig {
    /// External store endpoint. The relay is disabled when unset.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_relay_timeout")]
    pub timeout_seconds: u64,
}

impl RelayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_seconds: default_relay_timeout(),
        }
    }
}

fn default_relay_timeout() -> u64 {
    5
}

/// Reply automatically when an inbound text matches `trigger`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AutoReplyRule {
    pub trigger: String,
    pub reply: String,
}

// ============================================================================
// LoggingConfig
// ============================================================================

/// File sinks next to stdout: `<dir>/app.log` gets every record,
/// `<dir>/error.log` only errors.
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
        }
    }
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

// ============================================================================
// ConfigError
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_saphyr::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.rate_limit.max_requests, 100);
        assert_eq!(config.server.rate_limit.window_seconds, 60);
        assert_eq!(config.sessions, vec!["tipd", "upb", "perpus", "edok"]);
        assert_eq!(config.credentials.path, PathBuf::from("sessions"));
        assert_eq!(config.session.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(config.dispatch.interval(), Duration::from_secs(3));
        assert_eq!(config.attachments.probe_timeout_seconds, 10);
        assert_eq!(config.attachments.download_timeout_seconds, 20);
        assert_eq!(config.attachments.cleanup_delay_ms, 3_000);
        assert_eq!(config.relay.url, None);
        assert_eq!(config.relay.timeout_seconds, 5);
        assert!(config.auto_reply.is_empty());
        assert_eq!(config.sidecar.connect_timeout(), Duration::from_secs(30));
        assert_eq!(config.sidecar.send_timeout(), Duration::from_secs(60));
        assert_eq!(config.logging.dir, PathBuf::from("logs"));
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_load_missing_file_returns_defaults() {
        let tmp_dir = TempDir::new().unwrap();
        let missing_path = tmp_dir.path().join("missing-config.yaml");
        let config = Config::load(&missing_path).await.unwrap();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.sessions.len(), 4);
    }

    #[tokio::test]
    async fn test_load_valid_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
server:
  host: "127.0.0.1"
  port: 3000
sessions: ["alpha", "beta"]
sidecar:
  url: "ws://10.0.0.2:9000"
dispatch:
  interval_ms: 4500
logging:
  dir: "/var/log/wagate"
relay:
  url: "https://store.example.com/wa/store"
  timeout_seconds: 2
auto_reply:
  - trigger: "tes"
    reply: "gateway is running"
"#
        )
        .unwrap();

        let config = Config::load(file.path()).await.unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.sessions, vec!["alpha", "beta"]);
        assert_eq!(config.sidecar.url, "ws://10.0.0.2:9000");
        assert_eq!(config.dispatch.interval(), Duration::from_millis(4500));
        assert_eq!(config.logging.dir, PathBuf::from("/var/log/wagate"));
        assert_eq!(
            config.relay.url.as_deref(),
            Some("https://store.example.com/wa/store")
        );
        assert_eq!(config.relay.timeout_seconds, 2);
        assert_eq!(
            config.auto_reply,
            vec![AutoReplyRule {
                trigger: "tes".to_string(),
                reply: "gateway is running".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_load_partial_yaml_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
server:
  port: 9000
"#
        )
        .unwrap();

        let config = Config::load(file.path()).await.unwrap();
        assert_eq!(config.server.host, "0.0.0.0"); // default
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.request_timeout_seconds, 300); // default
        assert_eq!(config.sessions.len(), 4); // default
    }

    #[tokio::test]
    async fn test_load_invalid_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "invalid: yaml: content: [").unwrap();

        let result = Config::load(file.path()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_rejects_duplicate_and_reserved_session_names() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"sessions: ["upb", "upb"]"#).unwrap();
        let result = Config::load(file.path()).await;
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"sessions: ["auto"]"#).unwrap();
        let result = Config::load(file.path()).await;
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    async fn load_yaml(yaml: &str) -> Result<Config, ConfigError> {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{}", yaml).unwrap();
        Config::load(file.path()).await
    }

    #[tokio::test]
    async fn test_rejects_dispatch_interval_below_floor() {
        let result = load_yaml("dispatch:\n  interval_ms: 0").await;
        assert!(matches!(result, Err(ConfigError::Invalid(msg)) if msg.contains("interval_ms")));

        let result = load_yaml("dispatch:\n  interval_ms: 2999").await;
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        assert!(load_yaml("dispatch:\n  interval_ms: 3000").await.is_ok());
    }

    #[tokio::test]
    async fn test_rejects_zero_reconnect_delay() {
        let result = load_yaml("session:\n  reconnect_delay_ms: 0").await;
        assert!(
            matches!(result, Err(ConfigError::Invalid(msg)) if msg.contains("reconnect_delay_ms"))
        );
    }

    #[tokio::test]
    async fn test_rejects_zero_timeouts() {
        for (yaml, key) in [
            ("server:\n  request_timeout_seconds: 0", "request_timeout_seconds"),
            ("server:\n  rate_limit:\n    window_seconds: 0", "window_seconds"),
            ("sidecar:\n  connect_timeout_seconds: 0", "connect_timeout_seconds"),
            ("sidecar:\n  send_timeout_seconds: 0", "send_timeout_seconds"),
            ("attachments:\n  probe_timeout_seconds: 0", "probe_timeout_seconds"),
            ("attachments:\n  download_timeout_seconds: 0", "download_timeout_seconds"),
            ("relay:\n  timeout_seconds: 0", "relay.timeout_seconds"),
        ] {
            let result = load_yaml(yaml).await;
            assert!(
                matches!(&result, Err(ConfigError::Invalid(msg)) if msg.contains(key)),
                "{} accepted: {:?}",
                key,
                result.map(|_| ())
            );
        }
    }

    #[test]
    fn test_config_error_display() {
        let io_error = ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "test",
        ));
        assert!(io_error.to_string().contains("failed to read config file"));
    }
}
