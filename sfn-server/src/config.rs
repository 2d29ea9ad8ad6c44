//! Processor configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via SFN_CONFIG)
//! 3. Environment variables
//!
//! The workflow itself (name, listen address, functions) lives in a separate
//! file, see [`sfn_core::WorkflowConfig`]; its path is `workflow` here.

use serde::{Deserialize, Serialize};
use sfn_protocol::AuthType;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Processor configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the workflow file.
    pub workflow: Option<PathBuf>,
    /// Network configuration.
    pub network: NetworkConfig,
    /// Authentication configuration.
    pub auth: AuthConfig,
    /// TLS configuration.
    pub tls: TlsConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("SFN_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("SFN_WORKFLOW") {
            self.workflow = Some(PathBuf::from(path));
        }
        self.network.apply_env_overrides();
        self.auth.apply_env_overrides();
        self.tls.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Loads secrets from external file if configured.
    pub fn load_secrets(&mut self) -> Result<(), ConfigError> {
        self.auth.load_secrets()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.auth.validate()?;
        self.tls.validate()
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Transport idle timeout in seconds.
    pub idle_timeout_secs: u64,
    /// Time allowed for a peer to complete the handshake, in seconds.
    pub handshake_timeout_secs: u64,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 300,
            handshake_timeout_secs: 5,
            max_connections: 1000,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(timeout) = std::env::var("SFN_IDLE_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.idle_timeout_secs = secs;
            }
        }

        if let Ok(timeout) = std::env::var("SFN_HANDSHAKE_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.handshake_timeout_secs = secs;
            }
        }

        if let Ok(max) = std::env::var("SFN_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Strategy applied to every handshake.
    #[serde(with = "auth_type_serde")]
    pub mode: AuthType,
    /// App id a handshake must carry in `app_key` mode.
    pub app_id: String,
    /// Accepted app secret hashes (SHA-256 hex strings).
    pub app_secret_hashes: Vec<String>,
    /// Trusted Ed25519 verifying keys (hex) for `public_key` mode.
    pub trusted_public_keys: Vec<String>,
    /// Ed25519 private key seed (hex) for `private_key` mode.
    pub private_key: Option<String>,
    /// Optional path to an external secrets file with one hash per line.
    pub secrets_file: Option<PathBuf>,
    /// Credential presented to downstream processors (`kind:value`).
    pub downstream_credential: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: AuthType::None,
            app_id: String::new(),
            app_secret_hashes: Vec::new(),
            trusted_public_keys: Vec::new(),
            private_key: None,
            secrets_file: None,
            downstream_credential: None,
        }
    }
}

impl AuthConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(mode) = std::env::var("SFN_AUTH_MODE") {
            match mode.parse() {
                Ok(mode) => self.mode = mode,
                Err(e) => tracing::warn!("Ignoring SFN_AUTH_MODE: {}", e),
            }
        }

        if let Ok(app_id) = std::env::var("SFN_APP_ID") {
            self.app_id = app_id;
        }

        if let Ok(hash) = std::env::var("SFN_APP_SECRET_HASH") {
            if !hash.is_empty() {
                self.app_secret_hashes.push(hash);
            }
        }

        if let Ok(path) = std::env::var("SFN_AUTH_SECRETS_FILE") {
            self.secrets_file = Some(PathBuf::from(path));
        }

        if let Ok(credential) = std::env::var("SFN_DOWNSTREAM_CREDENTIAL") {
            self.downstream_credential = Some(credential);
        }
    }

    /// Loads app secret hashes from the secrets file if configured.
    pub fn load_secrets(&mut self) -> Result<(), ConfigError> {
        if let Some(ref path) = self.secrets_file {
            let content =
                std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(path.clone(), e))?;
            for line in content.lines() {
                let line = line.trim();
                if !line.is_empty() && !line.starts_with('#') {
                    self.app_secret_hashes.push(line.to_string());
                }
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.mode {
            AuthType::None => Ok(()),
            AuthType::AppKey if self.app_id.is_empty() => Err(ConfigError::ValidationError(
                "app_key auth requires app_id".to_string(),
            )),
            AuthType::AppKey if self.app_secret_hashes.is_empty() && self.secrets_file.is_none() => {
                Err(ConfigError::ValidationError(
                    "app_key auth requires at least one app secret hash".to_string(),
                ))
            }
            AuthType::PublicKey if self.trusted_public_keys.is_empty() => {
                Err(ConfigError::ValidationError(
                    "public_key auth requires trusted_public_keys".to_string(),
                ))
            }
            AuthType::PrivateKey if self.private_key.is_none() => Err(
                ConfigError::ValidationError("private_key auth requires private_key".to_string()),
            ),
            _ => Ok(()),
        }
    }
}

/// TLS configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Generate a self-signed certificate in process.
    pub dev_mode: bool,
    /// Path to PEM-encoded server certificate file.
    pub cert_path: Option<PathBuf>,
    /// Path to PEM-encoded private key file.
    pub key_path: Option<PathBuf>,
    /// Path to PEM-encoded CA certificate(s) used when dialing downstreams.
    pub ca_path: Option<PathBuf>,
}

impl TlsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(dev) = std::env::var("SFN_TLS_DEV") {
            self.dev_mode = dev == "1" || dev.to_lowercase() == "true";
        }

        if let Ok(path) = std::env::var("SFN_TLS_CERT") {
            self.cert_path = Some(PathBuf::from(path));
        }

        if let Ok(path) = std::env::var("SFN_TLS_KEY") {
            self.key_path = Some(PathBuf::from(path));
        }

        if let Ok(path) = std::env::var("SFN_TLS_CA") {
            self.ca_path = Some(PathBuf::from(path));
        }
    }

    /// A dev certificate is generated unless both cert and key are given.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dev_mode {
            return Ok(());
        }
        if self.cert_path.is_none() {
            return Err(ConfigError::ValidationError(
                "TLS cert_path not set and dev_mode disabled".to_string(),
            ));
        }
        if self.key_path.is_none() {
            return Err(ConfigError::ValidationError(
                "TLS key_path not set and dev_mode disabled".to_string(),
            ));
        }
        Ok(())
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("SFN_METRICS_ENABLED") {
            self.enabled = enabled == "1" || enabled.to_lowercase() == "true";
        }

        if let Ok(addr) = std::env::var("SFN_METRICS_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Auth mode as its snake_case name (`none`, `app_key`, ...).
mod auth_type_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use sfn_protocol::AuthType;

    pub fn serialize<S>(mode: &AuthType, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(mode.as_str())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<AuthType, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.idle_timeout(), Duration::from_secs(300));
        assert_eq!(config.network.handshake_timeout(), Duration::from_secs(5));
        assert_eq!(config.network.max_connections, 1000);
        assert_eq!(config.auth.mode, AuthType::None);
        assert_eq!(config.metrics.bind_addr.port(), 9090);
        assert!(config.workflow.is_none());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
workflow: ./workflow.yaml
network:
  handshake_timeout_secs: 2
auth:
  mode: app_key
  app_id: demo
  app_secret_hashes:
    - abc123
tls:
  dev_mode: true
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.workflow, Some(PathBuf::from("./workflow.yaml")));
        assert_eq!(config.network.handshake_timeout_secs, 2);
        assert_eq!(config.network.idle_timeout_secs, 300);
        assert_eq!(config.auth.mode, AuthType::AppKey);
        assert_eq!(config.auth.app_secret_hashes, vec!["abc123"]);
        assert!(config.tls.dev_mode);
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_auth_mode() {
        let yaml = "auth:\n  mode: kerberos\n";
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let mut config = Config::default();
        config.auth.mode = AuthType::PublicKey;
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.auth.mode, AuthType::PublicKey);
        assert_eq!(parsed.metrics.bind_addr, config.metrics.bind_addr);
    }

    #[test]
    fn test_validation() {
        let mut auth = AuthConfig {
            mode: AuthType::AppKey,
            ..Default::default()
        };
        assert!(matches!(
            auth.validate(),
            Err(ConfigError::ValidationError(_))
        ));
        auth.app_id = "demo".to_string();
        assert!(auth.validate().is_err());
        auth.app_secret_hashes.push("h".to_string());
        assert!(auth.validate().is_ok());

        let tls = TlsConfig::default();
        assert!(tls.validate().is_err());
        let tls = TlsConfig {
            cert_path: Some(PathBuf::from("cert.pem")),
            key_path: Some(PathBuf::from("key.pem")),
            ..Default::default()
        };
        assert!(tls.validate().is_ok());
    }

    #[test]
    fn test_load_secrets() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# app secrets").unwrap();
        writeln!(file, "deadbeef").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "  cafebabe  ").unwrap();

        let mut config = Config::default();
        config.auth.secrets_file = Some(file.path().to_path_buf());
        config.load_secrets().unwrap();
        assert_eq!(config.auth.app_secret_hashes, vec!["deadbeef", "cafebabe"]);
    }

    #[test]
    fn test_from_file_errors() {
        assert!(matches!(
            Config::from_file("/nonexistent/sfn.yaml"),
            Err(ConfigError::IoError(..))
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"network: [not, a, map]\n").unwrap();
        assert!(matches!(
            Config::from_file(file.path()),
            Err(ConfigError::ParseError(..))
        ));
    }
}
