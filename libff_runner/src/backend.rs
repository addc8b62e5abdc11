use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::str::FromStr;
use std::sync::mpsc;

use super::block::{BlockOutcome, BlockTask};
use super::constants::SLURM_LAUNCHER;
use super::error::{BackendError, BlockTaskError, ConfigError};

/// The closed set of machines the runner knows how to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionProfile {
    #[default]
    Local,
    OrthrosNew,
    OrthrosAll,
    UMich,
    Marquette,
    Purdue,
}

impl ExecutionProfile {
    pub const ALL: [ExecutionProfile; 6] = [
        Self::Local,
        Self::OrthrosNew,
        Self::OrthrosAll,
        Self::UMich,
        Self::Marquette,
        Self::Purdue,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::OrthrosNew => "orthrosnew",
            Self::OrthrosAll => "orthrosall",
            Self::UMich => "umich",
            Self::Marquette => "marquette",
            Self::Purdue => "purdue",
        }
    }

    /// Map the profile to its backend record.
    ///
    /// `n_cpus` only matters for the local profile; cluster machines have a fixed core
    /// count per node. `n_nodes` is honored by the profiles whose allocation is sized
    /// at submission time and is ignored by the fixed-size ones.
    pub fn backend_config(&self, n_cpus: usize, n_nodes: Option<usize>, retries: u32) -> BackendConfig {
        let requested_nodes = n_nodes.unwrap_or(1).max(1);
        let (workers_per_node, node_count, placement) = match self {
            Self::Local => (n_cpus, 1, Placement::LocalThreads),
            Self::OrthrosNew => (32, 11, Placement::Slurm),
            Self::OrthrosAll => (64, 5, Placement::Slurm),
            Self::UMich => (36, requested_nodes, Placement::Slurm),
            Self::Marquette => (36, requested_nodes, Placement::Slurm),
            Self::Purdue => (128, requested_nodes, Placement::Slurm),
        };
        BackendConfig {
            profile: *self,
            workers_per_node,
            node_count,
            placement,
            retries,
        }
    }
}

impl FromStr for ExecutionProfile {
    type Err = ConfigError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|profile| profile.name() == s)
            .ok_or_else(|| ConfigError::UnknownProfile(s.to_string()))
    }
}

impl std::fmt::Display for ExecutionProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Where block tasks physically run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Child processes of this one, one pool thread per block
    LocalThreads,
    /// One Slurm job step per block
    Slurm,
}

/// Resolved once per process, never mutated afterwards
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub profile: ExecutionProfile,
    pub workers_per_node: usize,
    pub node_count: usize,
    pub placement: Placement,
    pub retries: u32,
}

impl BackendConfig {
    /// Launcher prepended to every block command
    pub fn launcher(&self) -> Vec<OsString> {
        match self.placement {
            Placement::LocalThreads => Vec::new(),
            Placement::Slurm => vec![
                OsString::from(SLURM_LAUNCHER),
                OsString::from("--nodes=1"),
                OsString::from("--ntasks=1"),
                OsString::from(format!("--cpus-per-task={}", self.workers_per_node)),
                OsString::from("--exclusive"),
            ],
        }
    }

    /// Build the backend this record describes
    pub fn build(&self) -> Result<PoolBackend, BackendError> {
        PoolBackend::new(self.clone())
    }
}

/// Handle to a submitted block; `wait` blocks until the block reports.
#[derive(Debug)]
pub struct BlockHandle {
    index: usize,
    rx: mpsc::Receiver<Result<BlockOutcome, BlockTaskError>>,
}

impl BlockHandle {
    /// Make a handle and the sender its executor reports on
    pub fn channel(index: usize) -> (mpsc::Sender<Result<BlockOutcome, BlockTaskError>>, Self) {
        let (tx, rx) = mpsc::channel();
        (tx, Self { index, rx })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn wait(self) -> Result<BlockOutcome, BlockTaskError> {
        match self.rx.recv() {
            Ok(result) => result,
            Err(_) => Err(BlockTaskError::Disconnected(self.index)),
        }
    }
}

/// Something that can run block tasks. Stage runners only ever see this trait.
pub trait Backend: Send + Sync {
    /// Start a block task. Must not block on the task itself.
    fn submit(&self, task: BlockTask) -> BlockHandle;

    /// Number of blocks each block-parallel stage is split into
    fn block_count(&self) -> usize;

    /// Worker threads handed to each block
    fn workers_per_block(&self) -> usize;
}

/// Thread-pool backend: one pool thread per concurrently running block. Cluster placement
/// uses the same pool, but each thread only babysits a remote job step.
pub struct PoolBackend {
    config: BackendConfig,
    launcher: Vec<OsString>,
    pool: rayon::ThreadPool,
}

impl PoolBackend {
    pub fn new(config: BackendConfig) -> Result<Self, BackendError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.node_count.max(1))
            .thread_name(|idx| format!("ff-block-{idx}"))
            .build()?;
        Ok(Self {
            launcher: config.launcher(),
            config,
            pool,
        })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }
}

impl Backend for PoolBackend {
    fn submit(&self, task: BlockTask) -> BlockHandle {
        let (tx, handle) = BlockHandle::channel(task.block.index);
        let launcher = self.launcher.clone();
        let retries = self.config.retries;
        self.pool.spawn(move || {
            let result = run_with_retries(&task, &launcher, retries);
            // The stage runner may have given up on us; nothing to report to then
            let _ = tx.send(result);
        });
        handle
    }

    fn block_count(&self) -> usize {
        self.config.node_count
    }

    fn workers_per_block(&self) -> usize {
        self.config.workers_per_node
    }
}

/// Re-run a block that exits non-zero, at most `retries` extra times.
/// Launch errors are not retried; a missing binary stays missing.
pub fn run_with_retries(
    task: &BlockTask,
    launcher: &[OsString],
    retries: u32,
) -> Result<BlockOutcome, BlockTaskError> {
    let mut attempt = 1;
    loop {
        let mut outcome = task.run_with_launcher(launcher)?;
        outcome.attempts = attempt;
        if outcome.success() || attempt > retries {
            return Ok(outcome);
        }
        log::warn!(
            "{} block {} {}; retrying ({}/{})",
            task.log_stem,
            task.block.index,
            outcome.failure_reason(),
            attempt,
            retries
        );
        attempt += 1;
    }
}
