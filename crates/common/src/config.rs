use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::endpoint::{parse_reference, AlgorithmId, EndpointRegistry, RegistryError};
use crate::security::E2ePolicy;
use crate::transport::{millis, RetryPolicy};

/// Tunables of an endpoint security manager
///
/// Every field has a default, so an empty TOML document is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Strength, in bits, local endpoints are generated at
    #[serde(default = "default_desired_strength")]
    pub desired_strength: u32,
    /// Weakest local endpoint kept after generation
    #[serde(default = "default_min_strength")]
    pub min_strength: u32,
    /// Strongest local endpoint kept after generation
    #[serde(default = "default_max_strength")]
    pub max_strength: u32,
    /// Policy applied by the convenience send operations
    #[serde(default)]
    pub policy: E2ePolicy,
    /// Overall deadline of the awaitable request operations
    #[serde(default = "default_request_timeout", with = "millis")]
    pub request_timeout: Duration,
    /// Buffered peer events per subscriber before the slowest one lags
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Endpoint references (`namespace#localName`) allowed for discovery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_endpoints: Option<Vec<String>>,
    /// Freeze the allowed set once applied
    #[serde(default)]
    pub lock_allowed_endpoints: bool,
    /// Retry budget handed to the transport for every request
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_desired_strength() -> u32 {
    128
}

fn default_min_strength() -> u32 {
    128
}

fn default_max_strength() -> u32 {
    256
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_event_capacity() -> usize {
    64
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            desired_strength: default_desired_strength(),
            min_strength: default_min_strength(),
            max_strength: default_max_strength(),
            policy: E2ePolicy::default(),
            request_timeout: default_request_timeout(),
            event_capacity: default_event_capacity(),
            allowed_endpoints: None,
            lock_allowed_endpoints: false,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("toml serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    #[error("toml deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl SecurityConfig {
    pub fn from_toml(config_toml: &str) -> Result<Self, ConfigError> {
        let config: SecurityConfig = toml::from_str(config_toml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config_toml = std::fs::read_to_string(path)?;
        Self::from_toml(&config_toml)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_strength > self.max_strength {
            return Err(ConfigError::Invalid(format!(
                "min_strength {} exceeds max_strength {}",
                self.min_strength, self.max_strength
            )));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be positive".into()));
        }
        if let Some(allowed) = &self.allowed_endpoints {
            for reference in allowed {
                if parse_reference(reference).is_none() {
                    return Err(ConfigError::Invalid(format!(
                        "malformed endpoint reference: {}",
                        reference
                    )));
                }
            }
        }
        Ok(())
    }

    /// Apply `allowed_endpoints` to `registry`, if configured
    ///
    /// References to unknown algorithms are ignored with a warning.
    pub fn apply_allowed(&self, registry: &EndpointRegistry) -> Result<(), ConfigError> {
        let Some(allowed) = &self.allowed_endpoints else {
            return Ok(());
        };
        let mut ids: Vec<AlgorithmId> = Vec::with_capacity(allowed.len());
        for reference in allowed {
            let known = parse_reference(reference)
                .and_then(|(namespace, local_name)| registry.lookup(local_name, namespace));
            match known {
                Some(capability) => ids.push(capability.id()),
                None => tracing::warn!("ignoring unknown endpoint {}", reference),
            }
        }
        registry.set_allowed(&ids, self.lock_allowed_endpoints)?;
        Ok(())
    }
}
