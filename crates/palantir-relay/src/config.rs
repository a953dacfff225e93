//! Relay configuration

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use palantir_crypto::{Identity, PeerId};
use palantir_transport::{DEFAULT_MAX_FRAME_SIZE, MAX_CREDENTIAL_LEN};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENV_LISTEN_ADDR: &str = "PALANTIR_RELAY_LISTEN_ADDR";
pub const ENV_CONFIG: &str = "PALANTIR_RELAY_CONFIG";
pub const ENV_IDENTITY: &str = "PALANTIR_RELAY_IDENTITY";
pub const ENV_MAX_SESSIONS: &str = "PALANTIR_RELAY_MAX_SESSIONS";
pub const ENV_ACCESS_TOKEN: &str = "PALANTIR_RELAY_ACCESS_TOKEN";

/// Smallest frame limit that still fits a handshake hello.
const MIN_FRAME_SIZE: usize = 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub max_frame_size: usize,
    pub handshake_timeout_secs: u64,
    pub max_sessions: Option<usize>,
    /// Hex peer ids admitted by the relay. Empty admits any authenticated peer.
    pub allowed_peers: Vec<String>,
    /// Credential every client must present during the handshake.
    pub access_token: Option<String>,
    /// Hex of the 32-byte signing secret followed by the 32-byte exchange secret.
    /// A fresh identity is generated when absent.
    pub identity_secret: Option<String>,
    /// Period of the session summary log line; 0 disables it.
    pub stats_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 7400)),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            handshake_timeout_secs: 10,
            max_sessions: None,
            allowed_peers: Vec::new(),
            access_token: None,
            identity_secret: None,
            stats_interval_secs: 60,
        }
    }
}

impl RelayConfig {
    /// Load from environment variables, command line and TOML file, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        let args: Vec<String> = std::env::args().skip(1).collect();
        Self::load_from(|key| std::env::var(key).ok(), &args)
    }

    /// Same as [`RelayConfig::load`] with explicit sources.
    pub fn load_from(
        env: impl Fn(&str) -> Option<String>,
        args: &[String],
    ) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let mut config_path = env(ENV_CONFIG);

        if let Some(addr) = env(ENV_LISTEN_ADDR) {
            config.listen_addr = parse_addr(&addr)?;
        }
        if let Some(secret) = env(ENV_IDENTITY) {
            config.identity_secret = Some(secret);
        }
        if let Some(token) = env(ENV_ACCESS_TOKEN) {
            config.access_token = Some(token);
        }
        if let Some(max) = env(ENV_MAX_SESSIONS) {
            config.max_sessions = Some(max.parse().map_err(|e| {
                ConfigError::Invalid(format!("Invalid {ENV_MAX_SESSIONS}: {e}"))
            })?);
        }

        if let Some(path) = config.load_from_args(args)? {
            config_path = Some(path);
        }

        if let Some(path) = config_path {
            config.load_from_toml(Path::new(&path))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Returns the config file path if one was given.
    fn load_from_args(&mut self, args: &[String]) -> Result<Option<String>, ConfigError> {
        let mut config_path = None;
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            let mut value = |flag: &str| {
                iter.next()
                    .cloned()
                    .ok_or_else(|| ConfigError::Invalid(format!("{flag} requires a value")))
            };
            match arg.as_str() {
                "--listen-addr" | "-l" => self.listen_addr = parse_addr(&value(arg.as_str())?)?,
                "--config" | "-f" => config_path = Some(value(arg.as_str())?),
                "--max-sessions" => {
                    self.max_sessions = Some(value(arg.as_str())?.parse().map_err(|e| {
                        ConfigError::Invalid(format!("Invalid max_sessions: {e}"))
                    })?)
                }
                _ => {}
            }
        }
        Ok(config_path)
    }

    fn load_from_toml(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.apply_toml(&content)
    }

    /// Overlay the keys present in a TOML document.
    pub fn apply_toml(&mut self, content: &str) -> Result<(), ConfigError> {
        let table: toml::Value = toml::from_str(content)?;

        if let Some(addr) = table.get("listen_addr").and_then(|v| v.as_str()) {
            self.listen_addr = parse_addr(addr)?;
        }
        if let Some(max) = non_negative(&table, "max_frame_size")? {
            self.max_frame_size = max as usize;
        }
        if let Some(secs) = non_negative(&table, "handshake_timeout_secs")? {
            self.handshake_timeout_secs = secs;
        }
        if let Some(max) = non_negative(&table, "max_sessions")? {
            self.max_sessions = Some(max as usize);
        }
        if let Some(secret) = table.get("identity_secret").and_then(|v| v.as_str()) {
            self.identity_secret = Some(secret.to_string());
        }
        if let Some(secs) = non_negative(&table, "stats_interval_secs")? {
            self.stats_interval_secs = secs;
        }
        if let Some(peers) = table.get("allowed_peers") {
            let peers = peers.as_array().ok_or_else(|| {
                ConfigError::Invalid("allowed_peers must be an array of strings".to_string())
            })?;
            self.allowed_peers = peers
                .iter()
                .map(|v| {
                    v.as_str().map(str::to_string).ok_or_else(|| {
                        ConfigError::Invalid("allowed_peers must be an array of strings".into())
                    })
                })
                .collect::<Result<_, _>>()?;
        }
        if let Some(token) = table.get("access_token").and_then(|v| v.as_str()) {
            self.access_token = Some(token.to_string());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_size < MIN_FRAME_SIZE {
            return Err(ConfigError::Invalid(format!(
                "max_frame_size must be at least {MIN_FRAME_SIZE}"
            )));
        }
        if self.handshake_timeout_secs == 0 {
            return Err(ConfigError::Invalid("handshake_timeout_secs must be > 0".to_string()));
        }
        if self.max_sessions == Some(0) {
            return Err(ConfigError::Invalid("max_sessions must be > 0".to_string()));
        }
        if let Some(secret) = &self.identity_secret {
            Identity::from_secret_hex(secret)
                .map_err(|e| ConfigError::Invalid(format!("Invalid identity_secret: {e}")))?;
        }
        self.allowed_peer_ids()?;
        if let Some(token) = &self.access_token {
            if token.is_empty() || token.len() > MAX_CREDENTIAL_LEN {
                return Err(ConfigError::Invalid(format!(
                    "access_token must be 1..={MAX_CREDENTIAL_LEN} bytes"
                )));
            }
        }
        Ok(())
    }

    /// Parsed `allowed_peers`.
    pub fn allowed_peer_ids(&self) -> Result<Vec<PeerId>, ConfigError> {
        self.allowed_peers
            .iter()
            .map(|hex| {
                PeerId::from_hex(hex).map_err(|e| {
                    ConfigError::Invalid(format!("Invalid allowed peer {hex:?}: {e}"))
                })
            })
            .collect()
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// The configured identity, or a freshly generated one.
    pub fn identity(&self) -> Result<Identity, ConfigError> {
        match &self.identity_secret {
            Some(secret) => Identity::from_secret_hex(secret)
                .map_err(|e| ConfigError::Invalid(format!("Invalid identity_secret: {e}"))),
            None => Ok(Identity::generate()),
        }
    }
}

fn parse_addr(addr: &str) -> Result<SocketAddr, ConfigError> {
    addr.parse()
        .map_err(|e| ConfigError::Invalid(format!("Invalid listen_addr {addr:?}: {e}")))
}

fn non_negative(table: &toml::Value, key: &str) -> Result<Option<u64>, ConfigError> {
    match table.get(key).and_then(|v| v.as_integer()) {
        None => Ok(None),
        Some(n) if n >= 0 => Ok(Some(n as u64)),
        Some(n) => Err(ConfigError::Invalid(format!("{key} must not be negative, got {n}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = RelayConfig::load_from(env(&[]), &[]).unwrap();
        assert_eq!(config.listen_addr.port(), 7400);
        assert_eq!(config.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert!(config.max_sessions.is_none());
    }

    #[test]
    fn test_env_then_args() {
        let config = RelayConfig::load_from(
            env(&[(ENV_LISTEN_ADDR, "127.0.0.1:9000"), (ENV_MAX_SESSIONS, "5")]),
            &args(&["--listen-addr", "127.0.0.1:9001"]),
        )
        .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9001".parse().unwrap());
        assert_eq!(config.max_sessions, Some(5));
    }

    #[test]
    fn test_missing_flag_value() {
        let err = RelayConfig::load_from(env(&[]), &args(&["--listen-addr"])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_toml_file_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let peer = Identity::generate().peer_id();
        writeln!(file, "listen_addr = \"127.0.0.1:7500\"").unwrap();
        writeln!(file, "max_sessions = 2\nhandshake_timeout_secs = 3").unwrap();
        writeln!(file, "allowed_peers = [\"{}\"]", peer.to_hex()).unwrap();
        let path = file.path().to_string_lossy().to_string();

        let config = RelayConfig::load_from(env(&[(ENV_CONFIG, path.as_str())]), &[]).unwrap();
        assert_eq!(config.listen_addr.port(), 7500);
        assert_eq!(config.max_sessions, Some(2));
        assert_eq!(config.handshake_timeout(), Duration::from_secs(3));
        assert_eq!(config.allowed_peer_ids().unwrap(), vec![peer]);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = RelayConfig::default();
        config.max_sessions = Some(0);
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.max_frame_size = 16;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.identity_secret = Some("zz".to_string());
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.allowed_peers = vec!["not-hex".to_string()];
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.access_token = Some(String::new());
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        assert!(config.apply_toml("max_frame_size = -1").is_err());
        assert!(config.apply_toml("allowed_peers = [1, 2]").is_err());
    }

    #[test]
    fn test_access_token_from_env() {
        let config =
            RelayConfig::load_from(env(&[(ENV_ACCESS_TOKEN, "mellon")]), &[]).unwrap();
        assert_eq!(config.access_token.as_deref(), Some("mellon"));
    }

    #[test]
    fn test_configured_identity_is_stable() {
        let identity = Identity::generate();
        let (sign, kex) = identity.to_bytes();
        let secret = format!("{}{}", hex::encode(sign), hex::encode(kex));

        let mut config = RelayConfig::default();
        config.identity_secret = Some(secret);
        config.validate().unwrap();
        assert_eq!(config.identity().unwrap().peer_id(), identity.peer_id());
    }
}
