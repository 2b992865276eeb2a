use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::kv::{FileKvStore, KvLimits, KvStore, MemoryKvStore};
use crate::sandbox::{ExecutionBudget, RuntimeLimits};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub kv: KvConfig,
    #[serde(default)]
    pub responses: ResponsesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    #[serde(default = "default_max_execution_steps")]
    pub max_execution_steps: u64,
    /// Compute time per run, idle time excluded
    #[serde(default = "default_max_execution_duration_ms")]
    pub max_execution_duration_ms: u64,
    /// Hard wall-clock deadline per run
    #[serde(default = "default_max_total_duration_ms")]
    pub max_total_duration_ms: u64,
    #[serde(default = "default_max_call_levels")]
    pub max_call_levels: usize,
    #[serde(default = "default_max_string_size")]
    pub max_string_size: usize,
    /// Applies to both arrays and maps
    #[serde(default = "default_max_collection_size")]
    pub max_collection_size: usize,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KvBackend {
    Memory,
    File,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KvConfig {
    #[serde(default = "default_kv_backend")]
    pub backend: KvBackend,
    #[serde(default = "default_kv_path")]
    pub path: PathBuf,
    /// Keys per guild
    #[serde(default = "default_max_keys")]
    pub max_keys: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResponsesConfig {
    /// Sent to the user when a run does not complete
    #[serde(default = "default_error_message")]
    pub error_message: String,
}

fn default_max_execution_steps() -> u64 {
    ExecutionBudget::default().max_execution_steps
}

fn default_max_execution_duration_ms() -> u64 {
    ExecutionBudget::default().max_execution_duration.as_millis() as u64
}

fn default_max_total_duration_ms() -> u64 {
    ExecutionBudget::default().max_total_duration.as_millis() as u64
}

fn default_max_call_levels() -> usize {
    RuntimeLimits::default().max_call_levels
}

fn default_max_string_size() -> usize {
    RuntimeLimits::default().max_string_size
}

fn default_max_collection_size() -> usize {
    RuntimeLimits::default().max_array_size
}

fn default_kv_backend() -> KvBackend {
    KvBackend::Memory
}

fn default_kv_path() -> PathBuf {
    PathBuf::from("./data/kv")
}

fn default_max_keys() -> usize {
    1_000
}

fn default_error_message() -> String {
    "Something went wrong while running this script.".to_string()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_execution_steps: default_max_execution_steps(),
            max_execution_duration_ms: default_max_execution_duration_ms(),
            max_total_duration_ms: default_max_total_duration_ms(),
            max_call_levels: default_max_call_levels(),
            max_string_size: default_max_string_size(),
            max_collection_size: default_max_collection_size(),
        }
    }
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            backend: default_kv_backend(),
            path: default_kv_path(),
            max_keys: default_max_keys(),
        }
    }
}

impl Default for ResponsesConfig {
    fn default() -> Self {
        Self {
            error_message: default_error_message(),
        }
    }
}

impl SandboxConfig {
    /// Default budget for runs whose plan does not override it
    pub fn budget(&self) -> ExecutionBudget {
        ExecutionBudget {
            max_execution_steps: self.max_execution_steps,
            max_execution_duration: Duration::from_millis(self.max_execution_duration_ms),
            max_total_duration: Duration::from_millis(self.max_total_duration_ms),
        }
    }

    pub fn limits(&self) -> RuntimeLimits {
        RuntimeLimits {
            max_call_levels: self.max_call_levels,
            max_string_size: self.max_string_size,
            max_array_size: self.max_collection_size,
            max_map_size: self.max_collection_size,
            ..RuntimeLimits::default()
        }
    }
}

impl KvConfig {
    pub fn limits(&self) -> KvLimits {
        KvLimits::with_max_keys(self.max_keys)
    }

    /// Opens the configured backend
    pub fn open_store(&self) -> anyhow::Result<Arc<dyn KvStore>> {
        Ok(match self.backend {
            KvBackend::Memory => Arc::new(MemoryKvStore::new()),
            KvBackend::File => Arc::new(FileKvStore::open(&self.path)?),
        })
    }

    /// Human-readable description of the backend
    pub fn backend_description(&self) -> String {
        match self.backend {
            KvBackend::Memory => "memory".to_string(),
            KvBackend::File => format!("file ({})", self.path.display()),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Expand environment variables like ${GUILD_SCRIPTS_DATA}
        let expanded = shellexpand::env(&content)?;
        Self::parse(&expanded)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        if config.sandbox.max_execution_steps == 0 {
            anyhow::bail!("sandbox.max_execution_steps must be greater than zero");
        }
        if config.sandbox.max_total_duration_ms < config.sandbox.max_execution_duration_ms {
            anyhow::bail!(
                "sandbox.max_total_duration_ms must not be lower than max_execution_duration_ms"
            );
        }
        Ok(config)
    }
}
