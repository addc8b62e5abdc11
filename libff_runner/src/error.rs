use std::path::PathBuf;
use thiserror::Error;

use super::stage::Stage;
use super::worker_status::LayerStatus;

#[derive(Debug, Error)]
pub enum ParameterFileError {
    #[error("Could not open parameter file {0:?} because it does not exist")]
    BadFilePath(PathBuf),
    #[error("Parameter file failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Parameter file is missing required key {0}")]
    MissingKey(&'static str),
    #[error("Parameter file has a bad value for key {key}: {value}")]
    BadValue { key: &'static str, value: String },
    #[error("Parameter file gives a raw file number for layer {0} that does not fit in 32 bits")]
    FileNumberOverflow(u32),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config must provide either a parameter file or a data file")]
    MissingInput,
    #[error("Config has an invalid layer range {0}..={1}; layers start at 1 and must not decrease")]
    BadLayerRange(u32, u32),
    #[error("Config requested {0} CPUs; at least one is required")]
    BadCpuCount(usize),
    #[error("Unknown execution profile {0}")]
    UnknownProfile(String),
    #[error("Library root {path:?} cannot be put on the library search path: {source}")]
    BadLibraryRoot {
        path: PathBuf,
        source: std::env::JoinPathsError,
    },
}

#[derive(Debug, Error)]
pub enum BlockTaskError {
    #[error("Block task could not create log file {path:?}: {source}")]
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Block task could not launch {program:?}: {source}")]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },
    #[error("Block task failed while waiting on {program:?}: {source}")]
    Wait {
        program: PathBuf,
        source: std::io::Error,
    },
    #[error("Block {0} was dropped by the execution backend before reporting")]
    Disconnected(usize),
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Backend failed to build its worker pool: {0}")]
    PoolError(#[from] rayon::ThreadPoolBuildError),
}

/// One block of a stage that did not finish cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockFailure {
    pub block_index: usize,
    pub reason: String,
}

impl std::fmt::Display for BlockFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "block {}: {}", self.block_index, self.reason)
    }
}

fn join_failures(failures: &[BlockFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("Stage {stage} failed in {} block(s): {}", .failures.len(), join_failures(.failures))]
    BlocksFailed {
        stage: Stage,
        failures: Vec<BlockFailure>,
    },
    #[error("Stage {stage} cannot start because {path:?} does not exist")]
    MissingPrecondition { stage: Stage, path: PathBuf },
    #[error("Stage {0} has no native binary and must be driven by the layer pipeline")]
    NoBinary(Stage),
    #[error("Stage {stage} requested {count} blocks; at least one is required")]
    BadBlockCount { stage: Stage, count: usize },
    #[error("Stage failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

impl StageError {
    /// Invocation failures may be stepped over under the legacy failure policy;
    /// every other error is fatal for the layer.
    pub fn is_invocation_failure(&self) -> bool {
        matches!(self, Self::BlocksFailed { .. })
    }
}

#[derive(Debug, Error)]
pub enum ScratchError {
    #[error("Scratch cleanup failed due to IO error in {path:?}: {source}")]
    IOError {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("Conversion did not report an OutputZipName line in {0:?}")]
    NoArtifact(PathBuf),
    #[error("Dataset artifact {0:?} does not exist")]
    MissingArtifact(PathBuf),
    #[error("Neither a data file nor a parameter file was given for layer {0}")]
    NoSource(u32),
    #[error("Conversion failed due to parameter file error: {0}")]
    ParameterError(#[from] ParameterFileError),
    #[error("Conversion failed due to stage error: {0}")]
    StageError(#[from] StageError),
    #[error("Conversion failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum LayerError {
    #[error("Layer {layer} failed to set up {path:?}: {source}")]
    Setup {
        layer: u32,
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Layer {layer} already has dataset {path:?}")]
    DatasetAlreadySet { layer: u32, path: PathBuf },
    #[error("Layer failed due to conversion error: {0}")]
    ConversionError(#[from] ConversionError),
    #[error("Layer failed due to stage error: {0}")]
    StageError(#[from] StageError),
    #[error("Layer failed due to scratch error: {0}")]
    ScratchError(#[from] ScratchError),
    #[error("Layer failed due to Send error: {0}")]
    SendError(#[from] std::sync::mpsc::SendError<LayerStatus>),
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Driver failed due to Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Driver failed due to Backend error: {0}")]
    BackendError(#[from] BackendError),
    #[error("Driver failed on layer {layer}: {source}")]
    LayerError { layer: u32, source: LayerError },
    #[error("Driver failed due to IO error: {0}")]
    IoError(#[from] std::io::Error),
}
