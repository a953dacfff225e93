//! Network descriptor: where the relay is and which layers to stack.
//!
//! Loaded from TOML or the environment, then checked with [`NetworkDescriptor::validate`].

use std::path::Path;
use std::time::Duration;

use palantir_crypto::PeerId;
use palantir_transport::{OuterLayer, DEFAULT_MAX_FRAME_SIZE, MAX_CREDENTIAL_LEN};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENV_RELAY_ADDR: &str = "PALANTIR_RELAY_ADDR";
pub const ENV_LAYERS: &str = "PALANTIR_LAYERS";
pub const ENV_RELAY_ID: &str = "PALANTIR_RELAY_ID";
pub const ENV_CREDENTIAL: &str = "PALANTIR_CREDENTIAL";

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid descriptor: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkDescriptor {
    pub relay_address: String,
    /// Optional layers above relay routing, outermost first.
    pub layers: Vec<String>,
    /// Hex peer id the relay must authenticate as.
    pub relay_id: Option<String>,
    pub max_frame_size: usize,
    pub handshake_timeout_secs: u64,
    /// Undelivered messages buffered before the stack stops reading.
    pub inbox_capacity: usize,
    /// How long [`Palantir::request`](crate::Palantir::request) waits for a response.
    pub request_timeout_secs: u64,
    /// Presented to the relay's admission policy during the handshake.
    pub credential: Option<String>,
}

impl Default for NetworkDescriptor {
    fn default() -> Self {
        Self {
            relay_address: "127.0.0.1:7400".to_string(),
            layers: vec!["encryption".to_string()],
            relay_id: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            handshake_timeout_secs: 10,
            inbox_capacity: 1024,
            request_timeout_secs: 30,
            credential: None,
        }
    }
}

impl NetworkDescriptor {
    pub fn new(relay_address: impl Into<String>) -> Self {
        Self {
            relay_address: relay_address.into(),
            ..Self::default()
        }
    }

    pub fn with_layers<I, S>(mut self, layers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.layers = layers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_relay_id(mut self, relay_id: PeerId) -> Self {
        self.relay_id = Some(relay_id.to_hex());
        self
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    pub fn from_toml(content: &str) -> Result<Self, DescriptorError> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, DescriptorError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Defaults overridden by the `PALANTIR_*` variables read in [`Self::apply_env`].
    pub fn from_env() -> Result<Self, DescriptorError> {
        let mut descriptor = Self::default();
        descriptor.apply_env(|key| std::env::var(key).ok());
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Apply overrides from `lookup`, which maps variable names to values.
    ///
    /// `PALANTIR_LAYERS` is a comma separated list; an empty value means no
    /// optional layers.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup(ENV_RELAY_ADDR) {
            self.relay_address = addr;
        }
        if let Some(layers) = lookup(ENV_LAYERS) {
            self.layers = layers
                .split(',')
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(id) = lookup(ENV_RELAY_ID) {
            self.relay_id = if id.trim().is_empty() { None } else { Some(id) };
        }
        if let Some(credential) = lookup(ENV_CREDENTIAL) {
            self.credential = if credential.is_empty() { None } else { Some(credential) };
        }
    }

    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.relay_address.trim().is_empty() {
            return Err(DescriptorError::Invalid("relay_address must not be empty".to_string()));
        }
        if self.max_frame_size < 64 {
            return Err(DescriptorError::Invalid("max_frame_size must be >= 64".to_string()));
        }
        if self.max_frame_size > u32::MAX as usize {
            return Err(DescriptorError::Invalid("max_frame_size exceeds u32 range".to_string()));
        }
        if self.handshake_timeout_secs == 0 {
            return Err(DescriptorError::Invalid(
                "handshake_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.inbox_capacity == 0 {
            return Err(DescriptorError::Invalid("inbox_capacity must be > 0".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(DescriptorError::Invalid("request_timeout_secs must be > 0".to_string()));
        }
        if self.credential.as_ref().map_or(false, |c| c.len() > MAX_CREDENTIAL_LEN) {
            return Err(DescriptorError::Invalid(format!(
                "credential must be at most {MAX_CREDENTIAL_LEN} bytes"
            )));
        }
        let layers = self.outer_layers()?;
        for (i, layer) in layers.iter().enumerate() {
            if layers[..i].contains(layer) {
                return Err(DescriptorError::Invalid(format!("layer '{layer}' listed twice")));
            }
        }
        self.pinned_relay()?;
        Ok(())
    }

    pub fn outer_layers(&self) -> Result<Vec<OuterLayer>, DescriptorError> {
        self.layers
            .iter()
            .map(|l| l.parse::<OuterLayer>().map_err(DescriptorError::Invalid))
            .collect()
    }

    pub fn pinned_relay(&self) -> Result<Option<PeerId>, DescriptorError> {
        self.relay_id
            .as_deref()
            .map(|hex| {
                PeerId::from_hex(hex).map_err(|_| {
                    DescriptorError::Invalid(format!("relay_id '{hex}' is not a 64-digit hex id"))
                })
            })
            .transpose()
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
