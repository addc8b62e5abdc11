use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use super::backend::{BackendConfig, ExecutionProfile};
use super::constants::*;
use super::error::ConfigError;
use super::installation::{expand_home, InstallPaths};

/// What to do with the rest of a layer after a stage's blocks fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop the layer (and the run) at the first failed stage
    #[default]
    AbortLayer,
    /// Log the failure and carry on with the next stage
    Continue,
}

/// Structure representing the application configuration: where the data and results
/// live, which layers to run, and how to run them.
/// Configs are seralizable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub result_folder: PathBuf,
    pub param_file: Option<PathBuf>,
    pub data_file: Option<PathBuf>,
    pub n_cpus: usize,
    pub machine: ExecutionProfile,
    pub n_nodes: Option<usize>,
    pub n_frame_chunks: Option<u32>,
    pub pre_proc_thresh: Option<i32>,
    pub start_layer: u32,
    pub end_layer: u32,
    pub convert_files: bool,
    pub failure_policy: FailurePolicy,
    pub retries: u32,
    pub scratch_dir: PathBuf,
    pub install: InstallPaths,
}

impl Default for Config {
    /// Generate a new Config object. No inputs are set, so it will not validate as-is
    fn default() -> Self {
        Self {
            result_folder: PathBuf::new(),
            param_file: None,
            data_file: None,
            n_cpus: DEFAULT_N_CPUS,
            machine: ExecutionProfile::Local,
            n_nodes: None,
            n_frame_chunks: None,
            pre_proc_thresh: None,
            start_layer: 1,
            end_layer: 1,
            convert_files: true,
            failure_policy: FailurePolicy::AbortLayer,
            retries: 0,
            scratch_dir: PathBuf::from(DEFAULT_SCRATCH_DIR),
            install: InstallPaths::default(),
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    /// Write the configuration as YAML
    pub fn write_config_file(&self, config_path: &Path) -> Result<(), ConfigError> {
        let yaml_str = serde_yaml::to_string(self)?;
        std::fs::write(config_path, yaml_str)?;
        Ok(())
    }

    /// Check everything that can be checked without touching the filesystem
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.has_input() {
            return Err(ConfigError::MissingInput);
        }
        if self.start_layer < 1 || self.end_layer < self.start_layer {
            return Err(ConfigError::BadLayerRange(self.start_layer, self.end_layer));
        }
        if self.n_cpus < 1 {
            return Err(ConfigError::BadCpuCount(self.n_cpus));
        }
        Ok(())
    }

    pub fn has_input(&self) -> bool {
        self.param_file.is_some() || self.data_file.is_some()
    }

    /// Layers to process, in order
    pub fn layers(&self) -> RangeInclusive<u32> {
        self.start_layer..=self.end_layer
    }

    /// Absolute top-level result directory. An empty or `.` folder means the current one.
    pub fn get_result_directory(&self) -> Result<PathBuf, ConfigError> {
        let folder = expand_home(&self.result_folder);
        if folder.as_os_str().is_empty() || folder == Path::new(".") {
            return Ok(std::env::current_dir()?);
        }
        if folder.is_absolute() {
            Ok(folder)
        } else {
            Ok(std::env::current_dir()?.join(folder))
        }
    }

    /// Top-level log directory, shared by all layers
    pub fn get_log_directory(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.get_result_directory()?.join(LOG_DIR))
    }

    /// Resolve the execution backend record for this run
    pub fn backend_config(&self) -> BackendConfig {
        self.machine
            .backend_config(self.n_cpus, self.n_nodes, self.retries)
    }

    pub fn get_scratch_directory(&self) -> PathBuf {
        expand_home(&self.scratch_dir)
    }
}
