//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment
//! variables with the `SHROUD` prefix and `__` as the section separator
//! (e.g. `SHROUD_PIPELINE__BLOCK_SIZE=1024`). Every section and every field
//! has a default, so an empty file (or no overrides at all) yields a working
//! configuration. An example file lives in `configs/` in the repository
//! root.

use std::path::Path;

use config::{Config, ConfigError, Environment};
use serde::Deserialize;
use thiserror::Error;
use tracing_subscriber::{filter::EnvFilter, FmtSubscriber};

#[derive(Debug, Error)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(String),
}

#[derive(Debug, Default, Clone, Deserialize)]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically
/// named settings field.
pub struct Settings {
    #[serde(default)]
    pub cipher: CipherSettings,
    #[serde(default)]
    pub scratch: ScratchSettings,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation
    /// failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Config::new();
        config.merge(config::File::from(path.as_ref()))?;
        config.merge(Environment::with_prefix("shroud").separator("__"))?;
        config.try_into()
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.pipeline.block_size == 0 {
            return Err(SettingsError::Validation(
                "pipeline.block_size must be at least 1".into(),
            ));
        }
        if self.scratch.provider == ProviderKind::Pool {
            if self.scratch.pool_buffers == 0 || self.scratch.pool_buffer_len == 0 {
                return Err(SettingsError::Validation(
                    "scratch.pool_buffers and scratch.pool_buffer_len must be at least 1".into(),
                ));
            }
            // Pipelined mode keeps two buffers in flight.
            if self.pipeline.enabled && self.scratch.pool_buffers < 2 {
                return Err(SettingsError::Validation(
                    "pipelined mode with a pooled provider needs scratch.pool_buffers >= 2".into(),
                ));
            }
        }
        EnvFilter::try_new(&self.log.filter)
            .map_err(|err| SettingsError::Validation(format!("invalid log.filter: {}", err)))?;
        Ok(())
    }
}

/// The keystream backend to mask payloads with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// The portable integer mixer.
    Reference,
    /// The `ChaCha20` stream cipher.
    Chacha20,
}

/// The scratch buffer provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Allocate per reduction.
    Heap,
    /// A bounded pool of pre-allocated buffers.
    Pool,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
/// The cipher settings.
///
/// ```text
/// [cipher]
/// backend = "chacha20"
/// strict = true
/// ```
pub struct CipherSettings {
    /// The keystream backend.
    pub backend: BackendKind,
    /// Whether an unsupported element/operation combination is an error
    /// (`true`) or falls back to the unprotected reduction (`false`).
    pub strict: bool,
}

impl Default for CipherSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Reference,
            strict: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
/// The scratch buffer settings.
///
/// ```text
/// [scratch]
/// provider = "pool"
/// pool_buffers = 4
/// pool_buffer_len = 2097152
/// ```
pub struct ScratchSettings {
    /// The provider kind.
    pub provider: ProviderKind,
    /// The number of buffers in a pooled provider.
    pub pool_buffers: usize,
    /// The length, in elements, of each pooled buffer. Bounds the largest
    /// single-shot payload and the largest pipeline block.
    pub pool_buffer_len: usize,
}

impl Default for ScratchSettings {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Heap,
            pool_buffers: 4,
            pool_buffer_len: 2_097_152,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
/// The pipelining settings.
///
/// ```text
/// [pipeline]
/// enabled = true
/// block_size = 65536
/// ```
pub struct PipelineSettings {
    /// Whether protected reductions run in pipelined mode.
    pub enabled: bool,
    /// The block size, in elements. Payloads no larger than one block run
    /// as a single shot even in pipelined mode.
    pub block_size: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            block_size: 65_536,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
/// The logging settings.
///
/// ```text
/// [log]
/// filter = "shroud=debug,info"
/// ```
pub struct LoggingSettings {
    /// A tracing filter directive string.
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "info".into(),
        }
    }
}

/// Sets up a structured logger from the logging settings.
///
/// Quietly does nothing if a global subscriber is already installed, so a
/// host application that configured its own logging wins.
pub fn init_logging(settings: &LoggingSettings) {
    let filter = EnvFilter::try_new(&settings.filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_ansi(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn from_toml(toml: &str) -> Result<Settings, SettingsError> {
        let mut config = Config::new();
        config
            .merge(config::File::from_str(toml, FileFormat::Toml))
            .map_err(SettingsError::Loading)?;
        let settings: Settings = config.try_into().map_err(SettingsError::Loading)?;
        settings.validate()?;
        Ok(settings)
    }

    #[test]
    fn test_defaults() {
        let settings = from_toml("").unwrap();
        assert_eq!(settings.cipher.backend, BackendKind::Reference);
        assert!(!settings.cipher.strict);
        assert_eq!(settings.scratch.provider, ProviderKind::Heap);
        assert!(!settings.pipeline.enabled);
        assert_eq!(settings.pipeline.block_size, 65_536);
        assert_eq!(settings.log.filter, "info");
    }

    #[test]
    fn test_full_file() {
        let settings = from_toml(
            r#"
            [cipher]
            backend = "chacha20"
            strict = true

            [scratch]
            provider = "pool"
            pool_buffers = 8
            pool_buffer_len = 1024

            [pipeline]
            enabled = true
            block_size = 256

            [log]
            filter = "shroud=trace"
            "#,
        )
        .unwrap();
        assert_eq!(settings.cipher.backend, BackendKind::Chacha20);
        assert!(settings.cipher.strict);
        assert_eq!(settings.scratch.provider, ProviderKind::Pool);
        assert_eq!(settings.scratch.pool_buffers, 8);
        assert_eq!(settings.scratch.pool_buffer_len, 1024);
        assert!(settings.pipeline.enabled);
        assert_eq!(settings.pipeline.block_size, 256);
    }

    #[test]
    fn test_zero_block_size_is_rejected() {
        let err = from_toml("[pipeline]\nblock_size = 0\n").unwrap_err();
        assert!(matches!(err, SettingsError::Validation(_)));
    }

    #[test]
    fn test_pipelined_pool_needs_two_buffers() {
        let err = from_toml(
            r#"
            [scratch]
            provider = "pool"
            pool_buffers = 1

            [pipeline]
            enabled = true
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, SettingsError::Validation(_)));
    }

    #[test]
    fn test_single_buffer_pool_is_fine_without_pipelining() {
        let settings = from_toml("[scratch]\nprovider = \"pool\"\npool_buffers = 1\n").unwrap();
        assert_eq!(settings.scratch.pool_buffers, 1);
    }

    #[test]
    fn test_bad_filter_is_rejected() {
        let err = from_toml("[log]\nfilter = \"shroud=notalevel\"\n").unwrap_err();
        assert!(matches!(err, SettingsError::Validation(_)));
    }

    #[test]
    fn test_init_logging_is_idempotent() {
        let settings = LoggingSettings::default();
        init_logging(&settings);
        // A second call loses against the installed subscriber instead of
        // panicking.
        init_logging(&settings);
    }

    #[test]
    fn test_unknown_backend_fails_to_load() {
        let err = from_toml("[cipher]\nbackend = \"rot13\"\n").unwrap_err();
        assert!(matches!(err, SettingsError::Loading(_)));
    }
}
