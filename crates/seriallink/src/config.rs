//! Serial link configuration
//!
//! This module contains configuration types for the connection manager,
//! including transport selection, the default port, queue bound and
//! recovery policy.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::LinkError;
use crate::transport::ConnectionOptions;

/// Top-level configuration, usually loaded from TOML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,
    /// Port to open on startup (used by the daemon)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<PortConfig>,
    /// Output queue settings
    #[serde(default)]
    pub queue: QueueConfig,
    /// Link error recovery settings
    #[serde(default)]
    pub recovery: RecoveryConfig,
    /// Capacity of the link event broadcast channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_event_capacity() -> usize {
    256
}

impl LinkConfig {
    /// Parse a configuration from a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, LinkError> {
        let mut config: LinkConfig =
            toml::from_str(content).map_err(|e| LinkError::Config(e.to_string()))?;
        if config.event_capacity == 0 {
            config.event_capacity = default_event_capacity();
        }
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LinkError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| LinkError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    fn validate(&self) -> Result<(), LinkError> {
        if self.queue.capacity == 0 {
            return Err(LinkError::Config(
                "queue.capacity must be at least 1".to_string(),
            ));
        }
        if let Some(ref port) = self.port {
            if port.path.trim().is_empty() {
                return Err(LinkError::Config("port.path must not be empty".to_string()));
            }
            if port.options.bitrate == 0 {
                return Err(LinkError::Config("port.bitrate must be non-zero".to_string()));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Transport Configuration
// =============================================================================

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Operating system serial ports
    Native(NativeConfig),
    /// In-memory transport for testing
    Mock(MockConfig),
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Native(NativeConfig::default())
    }
}

/// Native serial port configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeConfig {
    /// Poll interval of the blocking reader
    #[serde(default = "default_read_poll")]
    pub read_poll_ms: u64,
    /// Size of the reader's scratch buffer
    #[serde(default = "default_read_buffer")]
    pub read_buffer_size: usize,
}

fn default_read_poll() -> u64 {
    10
}

fn default_read_buffer() -> usize {
    4096
}

impl Default for NativeConfig {
    fn default() -> Self {
        Self {
            read_poll_ms: default_read_poll(),
            read_buffer_size: default_read_buffer(),
        }
    }
}

/// Mock transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockConfig {
    /// Simulated latency in milliseconds
    #[serde(default)]
    pub latency_ms: u64,
    /// Device paths reported by `list_devices`
    #[serde(default = "default_mock_devices")]
    pub devices: Vec<String>,
}

fn default_mock_devices() -> Vec<String> {
    vec!["/dev/ttyMOCK0".to_string()]
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            latency_ms: 0,
            devices: default_mock_devices(),
        }
    }
}

// =============================================================================
// Port / Queue / Recovery Configuration
// =============================================================================

/// Port to connect to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    /// Device path (e.g., "/dev/ttyUSB0", "COM3")
    pub path: String,
    #[serde(flatten)]
    pub options: ConnectionOptions,
}

/// Output queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of pending sends kept before the newest are dropped
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
}

fn default_queue_capacity() -> usize {
    crate::queue::DEFAULT_CAPACITY
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
        }
    }
}

/// Recovery configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Re-issue `connect` with the last parameters after an unrecoverable failure
    #[serde(default)]
    pub auto_reconnect: bool,
}
