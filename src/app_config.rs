use crate::upload::{RetentionPolicy, UploadLimits};
use clap::ArgMatches;
use config::builder::DefaultState;
use config::{ConfigBuilder, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};

/// The application configuration.
#[derive(Default, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// The version of the configuration.
    version: u8,
    /// Where chunks and artifacts are kept.
    pub storage: StorageConfig,
    /// Limits applied to incoming chunks.
    pub limits: LimitsConfig,
    /// Removal of abandoned sessions.
    pub retention: RetentionConfig,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// The chunk storage backend.
    pub backend: StorageBackend,
    /// The directory holding the chunks of sessions in progress.
    pub temp_dir: PathBuf,
    /// The directory receiving merged files.
    pub complete_dir: PathBuf,
}

#[derive(Default, Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Chunks are files below `temp_dir`.
    #[default]
    Filesystem,
    /// Chunks are kept in process memory and lost on restart.
    Memory,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// The largest accepted request body, which bounds the chunk size.
    pub max_chunk_size_bytes: usize,
    /// The largest number of chunks a session may declare.
    pub max_chunks_per_session: u32,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Sessions without new chunks for this many seconds are removed.
    /// Abandoned sessions are kept forever if unset.
    pub abandon_after_secs: Option<u64>,
    /// Seconds between two sweeps.
    pub sweep_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            temp_dir: PathBuf::from("uploads/temp"),
            complete_dir: PathBuf::from("uploads/complete"),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_chunk_size_bytes: 64 * 1024 * 1024,
            max_chunks_per_session: UploadLimits::default().max_chunks_per_session,
        }
    }
}

impl LimitsConfig {
    pub fn upload_limits(&self) -> UploadLimits {
        UploadLimits {
            max_chunks_per_session: self.max_chunks_per_session,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            abandon_after_secs: None,
            sweep_interval_secs: 3600,
        }
    }
}

impl RetentionConfig {
    /// Gets the sweep policy, or `None` if sweeping is disabled.
    pub fn policy(&self) -> Option<RetentionPolicy> {
        self.abandon_after_secs.map(|secs| RetentionPolicy {
            abandon_after: Duration::from_secs(secs),
            interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
        })
    }
}

impl AppConfig {
    /// Loads the configuration from the default locations, the file given on the
    /// command line, and the directory overrides given on the command line.
    pub fn load(config_dir: &Path, matches: &ArgMatches) -> Result<Self, anyhow::Error> {
        let mut config_builder = ConfigBuilder::<DefaultState>::default();

        // Add default configuration.
        config_builder = config_builder
            .add_source(
                File::from(config_dir.join("default.yml"))
                    .format(FileFormat::Yaml)
                    .required(false),
            )
            .add_source(
                // The YAML FAQ requests `.yaml` to be used as the default.
                File::from(config_dir.join("default.yaml"))
                    .format(FileFormat::Yaml)
                    .required(false),
            );

        if let Some(path) = matches.get_one::<PathBuf>("config_file").cloned() {
            info!(
                "Loading configuration file from {config_path:?}",
                config_path = path
            );
            config_builder =
                config_builder.add_source(File::from(path).format(FileFormat::Yaml).required(true))
        }

        let config = match config_builder.build() {
            Ok(config) => config,
            Err(e) => {
                error!("Unable to load configuration: {error}", error = e);
                return Err(e.into());
            }
        };

        let mut config: AppConfig = match config.try_deserialize() {
            Ok(config) => config,
            Err(e) => {
                error!("Unable to deserialize configuration: {error}", error = e);
                return Err(e.into());
            }
        };

        config.apply_overrides(matches);
        Ok(config)
    }

    fn apply_overrides(&mut self, matches: &ArgMatches) {
        if let Some(dir) = matches.get_one::<PathBuf>("temp_dir") {
            self.storage.temp_dir = dir.clone();
        }

        if let Some(dir) = matches.get_one::<PathBuf>("complete_dir") {
            self.storage.complete_dir = dir.clone();
        }
    }
}
