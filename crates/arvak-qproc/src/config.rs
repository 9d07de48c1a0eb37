//! Processor configuration.
//!
//! Loaded from YAML, from `ARVAK_QPROC_*` environment variables, or both:
//! environment variables override file values, which override defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::precision::Precision;

/// Largest chunk exponent considered when sizing chunks automatically.
const MAX_AUTO_PO2: u32 = 39;

/// Where amplitudes live and which workers process them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Host memory, parallel CPU dispatcher.
    #[default]
    Cpu,
    /// Accelerator devices, one worker thread per device.
    Devices,
}

/// Complete processor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Execution backend
    #[serde(default)]
    pub backend: BackendKind,

    /// Amplitude component precision
    #[serde(default)]
    pub precision: Precision,

    /// CPU worker threads (default: available hardware concurrency)
    #[serde(default)]
    pub n_workers: Option<usize>,

    /// log2 of the amplitudes per chunk (default: sized from device memory)
    #[serde(default)]
    pub max_po2_per_chunk: Option<u32>,

    /// Host memory budget for chunks on the CPU backend, in bytes
    #[serde(default = "default_host_memory")]
    pub host_memory_bytes: usize,

    /// Accelerator devices
    #[serde(default)]
    pub devices: DeviceConfig,

    /// Device-to-host transfer pipeline
    #[serde(default)]
    pub transfer: TransferConfig,
}

/// Accelerator device settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Number of devices
    #[serde(default = "default_device_count")]
    pub count: usize,

    /// Device memory per device, in bytes
    #[serde(default = "default_device_memory")]
    pub memory_bytes: usize,

    /// Temporary host memory store per device, in bytes
    #[serde(default = "default_host_store")]
    pub host_store_bytes: usize,
}

/// Transfer pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Staging contexts per device worker (at least 2)
    #[serde(default = "default_contexts_per_worker")]
    pub contexts_per_worker: usize,

    /// Host staging memory per worker, in bytes
    #[serde(default = "default_max_context_bytes")]
    pub max_context_bytes: usize,

    /// Upper bound on host copy threads per worker
    #[serde(default = "default_max_copy_workers")]
    pub max_copy_workers: usize,
}

fn default_host_memory() -> usize {
    8 << 30 // 8 GiB
}

fn default_device_count() -> usize {
    1
}

fn default_device_memory() -> usize {
    1 << 30 // 1 GiB
}

fn default_host_store() -> usize {
    64 << 20 // 64 MiB
}

fn default_contexts_per_worker() -> usize {
    2
}

fn default_max_context_bytes() -> usize {
    32 << 20 // 32 MiB
}

fn default_max_copy_workers() -> usize {
    4
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            count: default_device_count(),
            memory_bytes: default_device_memory(),
            host_store_bytes: default_host_store(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            contexts_per_worker: default_contexts_per_worker(),
            max_context_bytes: default_max_context_bytes(),
            max_copy_workers: default_max_copy_workers(),
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            precision: Precision::default(),
            n_workers: None,
            max_po2_per_chunk: None,
            host_memory_bytes: default_host_memory(),
            devices: DeviceConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

impl ProcessorConfig {
    /// CPU backend with defaults.
    pub fn cpu() -> Self {
        Self::default()
    }

    /// Device backend with `count` devices of `memory_bytes` each.
    pub fn devices(count: usize, memory_bytes: usize) -> Self {
        Self {
            backend: BackendKind::Devices,
            devices: DeviceConfig {
                count,
                memory_bytes,
                ..DeviceConfig::default()
            },
            ..Self::default()
        }
    }

    /// Set the precision.
    #[must_use]
    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    /// Set the chunk exponent.
    #[must_use]
    pub fn with_max_po2_per_chunk(mut self, po2: u32) -> Self {
        self.max_po2_per_chunk = Some(po2);
        self
    }

    /// Set the CPU worker count.
    #[must_use]
    pub fn with_workers(mut self, n_workers: usize) -> Self {
        self.n_workers = Some(n_workers);
        self
    }

    /// Parse YAML and validate.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml_ng::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_yaml_str(&contents)
    }

    /// Defaults overridden by environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::default().merge_env();
        config.validate()?;
        Ok(config)
    }

    /// Load with the following precedence:
    /// 1. Environment variables
    /// 2. Configuration file, if given
    /// 3. Defaults
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match config_file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let config = config.merge_env();
        config.validate()?;
        Ok(config)
    }

    fn merge_env(self) -> Self {
        self.merge_vars(|key| std::env::var(key).ok())
    }

    /// Apply overrides from a variable lookup. Unset or unparsable variables
    /// leave the field unchanged.
    fn merge_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = var("ARVAK_QPROC_BACKEND") {
            match v.as_str() {
                "cpu" => self.backend = BackendKind::Cpu,
                "devices" => self.backend = BackendKind::Devices,
                _ => {}
            }
        }
        if let Some(v) = var("ARVAK_QPROC_PRECISION") {
            match v.as_str() {
                "f32" => self.precision = Precision::F32,
                "f64" => self.precision = Precision::F64,
                _ => {}
            }
        }
        if let Some(val) = var("ARVAK_QPROC_WORKERS").and_then(|v| v.parse().ok()) {
            self.n_workers = Some(val);
        }
        if let Some(val) = var("ARVAK_QPROC_MAX_PO2_PER_CHUNK").and_then(|v| v.parse().ok()) {
            self.max_po2_per_chunk = Some(val);
        }
        if let Some(val) = var("ARVAK_QPROC_HOST_MEMORY").and_then(|v| v.parse().ok()) {
            self.host_memory_bytes = val;
        }

        // Devices
        if let Some(val) = var("ARVAK_QPROC_DEVICES").and_then(|v| v.parse().ok()) {
            self.devices.count = val;
        }
        if let Some(val) = var("ARVAK_QPROC_DEVICE_MEMORY").and_then(|v| v.parse().ok()) {
            self.devices.memory_bytes = val;
        }
        if let Some(val) = var("ARVAK_QPROC_HOST_STORE").and_then(|v| v.parse().ok()) {
            self.devices.host_store_bytes = val;
        }

        // Transfer
        if let Some(val) = var("ARVAK_QPROC_CONTEXTS_PER_WORKER").and_then(|v| v.parse().ok()) {
            self.transfer.contexts_per_worker = val;
        }
        if let Some(val) = var("ARVAK_QPROC_MAX_CONTEXT_BYTES").and_then(|v| v.parse().ok()) {
            self.transfer.max_context_bytes = val;
        }

        self
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_workers == Some(0) {
            return Err(ConfigError::ValidationError(
                "n_workers must be greater than 0".to_string(),
            ));
        }
        if let Some(po2) = self.max_po2_per_chunk {
            if po2 > 62 {
                return Err(ConfigError::ValidationError(format!(
                    "max_po2_per_chunk must be at most 62, got {po2}"
                )));
            }
        }
        if self.backend == BackendKind::Devices {
            if self.devices.count == 0 {
                return Err(ConfigError::ValidationError(
                    "devices.count must be greater than 0".to_string(),
                ));
            }
            if self.devices.memory_bytes == 0 {
                return Err(ConfigError::ValidationError(
                    "devices.memory_bytes must be greater than 0".to_string(),
                ));
            }
        }
        if self.transfer.contexts_per_worker < 2 {
            return Err(ConfigError::ValidationError(format!(
                "transfer.contexts_per_worker must be at least 2, got {}",
                self.transfer.contexts_per_worker
            )));
        }
        if self.transfer.max_context_bytes == 0 || self.transfer.max_copy_workers == 0 {
            return Err(ConfigError::ValidationError(
                "transfer limits must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Memory budget of the smallest compute unit for this backend.
    pub fn min_unit_memory(&self) -> usize {
        match self.backend {
            BackendKind::Cpu => self.host_memory_bytes,
            BackendKind::Devices => self.devices.memory_bytes,
        }
    }

    /// Chunk exponent: the configured value, or the largest power that still
    /// fits three chunks into the smallest unit.
    pub fn resolve_max_po2_per_chunk(&self) -> u32 {
        if let Some(po2) = self.max_po2_per_chunk {
            return po2;
        }
        let element = self.precision.complex_size();
        let memory = self.min_unit_memory();
        (0..=MAX_AUTO_PO2)
            .rev()
            .find(|&po2| memory / ((1usize << po2) * element) >= 3)
            .unwrap_or(0)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
