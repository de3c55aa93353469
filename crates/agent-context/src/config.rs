//! Configuration for building an [`ExecutionContext`](crate::ExecutionContext).
//!
//! Defaults match what agent runners expect when nothing is configured:
//! a 30 second timeout, 512 MiB of memory and 4 CPU units. A config can be
//! assembled with the builder, read from environment variables, or
//! deserialized from a TOML/YAML section.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{ConfigError, Result};
use crate::ledger::{DEFAULT_MAX_CPU, DEFAULT_MAX_MEMORY};

/// Default context timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Execution context configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Local timeout measured from creation. `None` or zero means no local deadline.
    #[serde(with = "timeout_ms")]
    pub timeout: Option<Duration>,

    /// Memory limit in bytes
    pub max_memory: i64,

    /// CPU limit in cores
    pub max_cpu: i32,

    /// Initial metadata
    pub metadata: HashMap<String, serde_json::Value>,

    /// Trace id inherited by every span and engine context
    pub trace_id: String,

    /// Span id that root spans are parented to
    pub parent_span_id: String,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            timeout: Some(DEFAULT_TIMEOUT),
            max_memory: DEFAULT_MAX_MEMORY,
            max_cpu: DEFAULT_MAX_CPU,
            metadata: HashMap::new(),
            trace_id: String::new(),
            parent_span_id: String::new(),
        }
    }
}

impl ContextConfig {
    /// Create a new config builder
    pub fn builder() -> ContextConfigBuilder {
        ContextConfigBuilder::new()
    }

    /// Create config from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            timeout: std::env::var("AGENT_CONTEXT_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .or(defaults.timeout),
            max_memory: std::env::var("AGENT_CONTEXT_MAX_MEMORY")
                .map(|v| v.parse().unwrap_or(DEFAULT_MAX_MEMORY))
                .unwrap_or(DEFAULT_MAX_MEMORY),
            max_cpu: std::env::var("AGENT_CONTEXT_MAX_CPU")
                .map(|v| v.parse().unwrap_or(DEFAULT_MAX_CPU))
                .unwrap_or(DEFAULT_MAX_CPU),
            metadata: HashMap::new(),
            trace_id: std::env::var("AGENT_CONTEXT_TRACE_ID").unwrap_or_default(),
            parent_span_id: std::env::var("AGENT_CONTEXT_PARENT_SPAN_ID").unwrap_or_default(),
        }
    }

    /// Parse a config from TOML and validate it
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a config from YAML and validate it
    pub fn from_yaml_str(input: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject limits no context could run under
    pub fn validate(&self) -> Result<()> {
        if self.max_memory <= 0 {
            return Err(ConfigError::invalid(format!(
                "max_memory must be positive, got {}",
                self.max_memory
            )));
        }
        if self.max_cpu <= 0 {
            return Err(ConfigError::invalid(format!(
                "max_cpu must be positive, got {}",
                self.max_cpu
            )));
        }
        Ok(())
    }

    /// The timeout that actually produces a deadline
    pub fn effective_timeout(&self) -> Option<Duration> {
        self.timeout.filter(|t| !t.is_zero())
    }
}

/// Builder for ContextConfig
pub struct ContextConfigBuilder {
    config: ContextConfig,
}

impl ContextConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self {
            config: ContextConfig::default(),
        }
    }

    /// Set the timeout. A zero duration disables the local deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    /// Disable the local deadline
    pub fn no_timeout(mut self) -> Self {
        self.config.timeout = None;
        self
    }

    /// Set the memory limit in bytes
    pub fn max_memory(mut self, bytes: i64) -> Self {
        self.config.max_memory = bytes;
        self
    }

    /// Set the CPU limit in cores
    pub fn max_cpu(mut self, cores: i32) -> Self {
        self.config.max_cpu = cores;
        self
    }

    /// Merge initial metadata
    pub fn metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.config.metadata.extend(metadata);
        self
    }

    /// Add a single metadata entry
    pub fn metadata_entry(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.config.metadata.insert(key.into(), value.into());
        self
    }

    /// Set the trace id and the span id root spans are parented to
    pub fn tracing(mut self, trace_id: impl Into<String>, parent_span_id: impl Into<String>) -> Self {
        self.config.trace_id = trace_id.into();
        self.config.parent_span_id = parent_span_id.into();
        self
    }

    /// Start a fresh trace with a random trace id
    pub fn new_trace(mut self) -> Self {
        self.config.trace_id = uuid::Uuid::new_v4().to_string();
        self
    }

    /// Build the configuration
    pub fn build(self) -> ContextConfig {
        self.config
    }
}

impl Default for ContextConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

mod timeout_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(timeout: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match timeout {
            Some(t) if t.is_zero() => serializer.serialize_u64(0),
            // Round sub-millisecond timeouts up so they keep a deadline.
            Some(t) => serializer.serialize_u64(u64::try_from(t.as_millis()).unwrap_or(u64::MAX).max(1)),
            None => serializer.serialize_u64(0),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok((ms > 0).then(|| Duration::from_millis(ms)))
    }
}
