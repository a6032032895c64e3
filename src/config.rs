//! Runtime configuration types.

use std::path::Path;

use serde::Deserialize;

/// JIT compilation mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitMode {
    /// JIT disabled, interpreter only
    Off,
    /// JIT enabled (compile hot functions)
    On,
    /// Automatic: JIT enabled if supported on this platform
    #[default]
    Auto,
}

impl JitMode {
    /// Whether hot functions should be handed to the JIT.
    pub fn enabled(self) -> bool {
        match self {
            JitMode::Off => false,
            JitMode::On => true,
            JitMode::Auto => cfg!(all(feature = "jit", target_arch = "x86_64")),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Runtime configuration for the VM
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub jit_mode: JitMode,
    /// Calls after which a function is compiled.
    pub jit_threshold: u32,
    /// Whether GC is enabled (default: true)
    pub gc_enabled: bool,
    /// Initial collection watermark, in live heap blocks.
    pub gc_threshold: usize,
    /// Print GC statistics after a run.
    pub gc_stats: bool,
    /// Size of the register array.
    pub stack_size: usize,
    pub max_call_depth: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            jit_mode: JitMode::Auto,
            jit_threshold: 1000,
            gc_enabled: true,
            gc_threshold: 1024,
            gc_stats: false,
            stack_size: 65_536,
            max_call_depth: 1024,
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load a TOML config file. Missing keys keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }
}
