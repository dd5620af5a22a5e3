//! Client configuration.
//!
//! [`ClientProperties`] can be built in code with the `with_*` methods or
//! loaded from a TOML file:
//!
//! ```toml
//! synchronization_strategy = "all"
//! initial_message_count = 50
//! region = "us1"
//! ```

use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};

use chatsync_types::Identity;

/// How much state the client loads eagerly after connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SynchronizationStrategy {
    /// Load the channel list, then every joined channel's members and
    /// an initial message window.
    All,
    /// Load only the channel list; channels sync on demand.
    #[default]
    ChannelsList,
}

/// Options for a chat client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientProperties {
    /// Eager-loading strategy (default: channels-list).
    #[serde(default)]
    pub synchronization_strategy: SynchronizationStrategy,
    /// Messages fetched per channel during initial sync (default: 100).
    #[serde(default = "default_initial_message_count")]
    pub initial_message_count: u32,
    /// Backend region (default: us1).
    #[serde(default = "default_region")]
    pub region: String,
}

fn default_initial_message_count() -> u32 {
    100
}

fn default_region() -> String {
    "us1".to_string()
}

impl Default for ClientProperties {
    fn default() -> Self {
        Self {
            synchronization_strategy: SynchronizationStrategy::default(),
            initial_message_count: default_initial_message_count(),
            region: default_region(),
        }
    }
}

impl ClientProperties {
    /// Create properties with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the synchronization strategy.
    pub fn with_strategy(mut self, strategy: SynchronizationStrategy) -> Self {
        self.synchronization_strategy = strategy;
        self
    }

    /// Set how many messages each channel loads during initial sync.
    pub fn with_initial_message_count(mut self, count: u32) -> Self {
        self.initial_message_count = count;
        self
    }

    /// Set the backend region.
    pub fn with_region(mut self, region: &str) -> Self {
        self.region = region.to_string();
        self
    }

    /// Parse and validate properties from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let properties: Self = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: None,
            source: e,
        })?;
        properties.validate()?;
        Ok(properties)
    }

    /// Load and validate properties from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let properties: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: Some(path.to_path_buf()),
            source: e,
        })?;
        properties.validate()?;
        Ok(properties)
    }

    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.region.trim().is_empty() {
            return Err(ConfigError::Invalid("region must not be empty".into()));
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration.
    #[error("failed to parse config{}: {source}", describe_path(.path))]
    ParseError {
        /// Path to the configuration file, if it came from one.
        path: Option<PathBuf>,
        /// Underlying TOML error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn describe_path(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| format!(" file {}", p.display()))
        .unwrap_or_default()
}

/// Identity and access token presented to the transport.
#[derive(Clone)]
pub struct Credentials {
    /// The user to connect as.
    pub identity: Identity,
    /// Opaque access token.
    pub token: String,
}

impl Credentials {
    /// Create credentials.
    pub fn new(identity: &str, token: &str) -> Self {
        Self {
            identity: Identity::new(identity),
            token: token.to_string(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("identity", &self.identity)
            .field("token", &format!("[{} bytes REDACTED]", self.token.len()))
            .finish()
    }
}
