use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use super::backend::{Backend, BlockHandle};
use super::block::{Block, BlockOutcome, BlockTask};
use super::constants::*;
use super::error::{BlockFailure, StageError};
use super::installation::Installation;
use super::layer::LayerContext;

/// The named steps of a layer, in the order they run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Convert,
    GenerateHkls,
    PeakSearch,
    MergePeaks,
    CalcRadius,
    FitSetup,
    BinData,
    Index,
    Refine,
    ProcessGrains,
}

/// What a stage's binary receives as its first positional argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryInput {
    /// The layer's converted dataset
    Dataset,
    /// `paramstest.txt`, relative to the layer directory
    FitParams,
}

impl Stage {
    /// Every stage of a layer, in pipeline order
    pub const SEQUENCE: [Stage; 10] = [
        Self::Convert,
        Self::GenerateHkls,
        Self::PeakSearch,
        Self::MergePeaks,
        Self::CalcRadius,
        Self::FitSetup,
        Self::BinData,
        Self::Index,
        Self::Refine,
        Self::ProcessGrains,
    ];

    /// Log file stem; also used as the stage's display name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Convert => "convert",
            Self::GenerateHkls => "hkls",
            Self::PeakSearch => "peaksearch",
            Self::MergePeaks => "merge_overlaps",
            Self::CalcRadius => "calc_radius",
            Self::FitSetup => "fit_setup",
            Self::BinData => "binning",
            Self::Index => "indexing",
            Self::Refine => "refining",
            Self::ProcessGrains => "process_grains",
        }
    }

    /// Native binary invoked by the stage. Conversion is driven by helper scripts instead.
    pub fn binary(&self) -> Option<&'static str> {
        match self {
            Self::Convert => None,
            Self::GenerateHkls => Some(HKL_BIN),
            Self::PeakSearch => Some(PEAKS_BIN),
            Self::MergePeaks => Some(MERGE_BIN),
            Self::CalcRadius => Some(RADIUS_BIN),
            Self::FitSetup => Some(FIT_SETUP_BIN),
            Self::BinData => Some(BIN_DATA_BIN),
            Self::Index => Some(INDEXER_BIN),
            Self::Refine => Some(REFINER_BIN),
            Self::ProcessGrains => Some(GRAINS_BIN),
        }
    }

    pub fn is_block_parallel(&self) -> bool {
        matches!(self, Self::PeakSearch | Self::Index | Self::Refine)
    }

    /// Stages that take the SpotsToIndex line count as an argument
    pub fn needs_spots_count(&self) -> bool {
        matches!(self, Self::Index | Self::Refine)
    }

    /// Stages whose binaries open files relative to the current directory
    pub fn runs_in_layer_dir(&self) -> bool {
        matches!(self, Self::BinData | Self::Index | Self::Refine)
    }

    pub fn primary_input(&self) -> PrimaryInput {
        match self {
            Self::BinData | Self::Index | Self::Refine => PrimaryInput::FitParams,
            _ => PrimaryInput::Dataset,
        }
    }

    /// Files (besides the dataset) that an earlier stage must have produced
    pub fn required_files(&self) -> &'static [&'static str] {
        match self {
            Self::PeakSearch => &[HKL_LIST_FILE],
            Self::BinData => &[FIT_PARAMS_FILE],
            Self::Index | Self::Refine => &[FIT_PARAMS_FILE, SPOTS_TO_INDEX_FILE],
            _ => &[],
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Everything that came back from one stage, ordered by block index
#[derive(Debug, Clone)]
pub struct StageReport {
    pub stage: Stage,
    pub outcomes: Vec<BlockOutcome>,
    pub elapsed: Duration,
}

/// Count the entries of the SpotsToIndex control file. Always read from disk: the file is
/// written once upstream and may have changed since any earlier read.
pub fn spots_to_index_count(layer_dir: &Path) -> Result<usize, StageError> {
    let path = layer_dir.join(SPOTS_TO_INDEX_FILE);
    let file = File::open(&path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => StageError::MissingPrecondition {
            stage: Stage::Index,
            path: path.clone(),
        },
        _ => StageError::IOError(e),
    })?;
    let mut count = 0;
    for line in BufReader::new(file).lines() {
        line?;
        count += 1;
    }
    Ok(count)
}

/// Runs one stage of one layer on a backend: fan out the blocks, then wait for every
/// one of them before returning.
pub struct StageRunner<'a> {
    backend: &'a dyn Backend,
    install: &'a Installation,
}

impl<'a> StageRunner<'a> {
    pub fn new(backend: &'a dyn Backend, install: &'a Installation) -> Self {
        Self { backend, install }
    }

    pub fn install(&self) -> &Installation {
        self.install
    }

    /// Run a native stage. Block-parallel stages are split into `block_count` blocks;
    /// every other stage runs as a single block.
    pub fn run_stage(
        &self,
        stage: Stage,
        layer: &LayerContext,
        block_count: usize,
    ) -> Result<StageReport, StageError> {
        let binary = stage.binary().ok_or(StageError::NoBinary(stage))?;
        if block_count == 0 {
            return Err(StageError::BadBlockCount {
                stage,
                count: block_count,
            });
        }
        let primary = self.check_preconditions(stage, layer)?;

        let line_count = if stage.needs_spots_count() {
            let count = spots_to_index_count(layer.dir())?;
            log::info!("{count} spots to index for stage {stage}");
            Some(count)
        } else {
            None
        };

        let workers = self.backend.workers_per_block();
        let blocks: Vec<Block> = if stage.is_block_parallel() {
            Block::partition(block_count, workers).collect()
        } else {
            vec![Block::single(workers)]
        };

        let program = self.install.binary(binary);
        let tasks = blocks
            .into_iter()
            .map(|block| {
                let mut task = BlockTask::new(stage.name(), program.clone(), block, layer.log_dir())
                    .arg(&primary)
                    .envs(self.install.environment());
                if stage.is_block_parallel() {
                    task = task
                        .arg(block.index.to_string())
                        .arg(block.count.to_string());
                    if let Some(lines) = line_count {
                        task = task.arg(lines.to_string());
                    }
                    task = task.arg(block.workers.to_string());
                }
                if stage.runs_in_layer_dir() {
                    task = task.working_dir(layer.dir());
                }
                task
            })
            .collect();

        self.dispatch(stage, tasks)
    }

    /// Submit tasks in order and block until all of them report. Any failed block fails
    /// the stage, but only after the barrier: no block is left running unobserved.
    ///
    /// Only block-parallel stages go to the backend. Serial stages run here, on the driver
    /// host, and never get a launcher prefix.
    pub fn dispatch(&self, stage: Stage, tasks: Vec<BlockTask>) -> Result<StageReport, StageError> {
        let start = Instant::now();
        let handles: Vec<_> = if stage.is_block_parallel() {
            tasks
                .into_iter()
                .map(|task| self.backend.submit(task))
                .collect()
        } else {
            tasks.into_iter().map(run_on_driver).collect()
        };

        let mut outcomes = Vec::with_capacity(handles.len());
        let mut failures = Vec::new();
        for handle in handles {
            let block_index = handle.index();
            match handle.wait() {
                Ok(outcome) => {
                    if !outcome.success() {
                        failures.push(BlockFailure {
                            block_index,
                            reason: outcome.failure_reason(),
                        });
                    }
                    outcomes.push(outcome);
                }
                Err(e) => failures.push(BlockFailure {
                    block_index,
                    reason: e.to_string(),
                }),
            }
        }

        if !failures.is_empty() {
            for failure in failures.iter() {
                log::error!("Stage {stage} {failure}");
            }
            return Err(StageError::BlocksFailed { stage, failures });
        }

        outcomes.sort_by_key(|outcome| outcome.block.index);
        Ok(StageReport {
            stage,
            outcomes,
            elapsed: start.elapsed(),
        })
    }

    /// Fail fast if an upstream artifact is missing. Returns the primary argument.
    fn check_preconditions(&self, stage: Stage, layer: &LayerContext) -> Result<PathBuf, StageError> {
        for name in stage.required_files() {
            let path = layer.dir().join(name);
            if !path.exists() {
                return Err(StageError::MissingPrecondition { stage, path });
            }
        }
        match stage.primary_input() {
            PrimaryInput::FitParams => Ok(PathBuf::from(FIT_PARAMS_FILE)),
            PrimaryInput::Dataset => match layer.dataset() {
                Some(path) if path.exists() => Ok(path.to_path_buf()),
                Some(path) => Err(StageError::MissingPrecondition {
                    stage,
                    path: path.to_path_buf(),
                }),
                None => Err(StageError::MissingPrecondition {
                    stage,
                    path: layer.dir().to_path_buf(),
                }),
            },
        }
    }
}

/// Run a task in this process and wrap the result in an already completed handle
fn run_on_driver(task: BlockTask) -> BlockHandle {
    let (tx, handle) = BlockHandle::channel(task.block.index);
    // The receiver is held by `handle`, so this cannot fail
    let _ = tx.send(task.run());
    handle
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::backend::{BackendConfig, ExecutionProfile, Placement, PoolBackend};
    use crate::error::BlockTaskError;
    use std::sync::mpsc::Sender;
    use crate::test_utils::{write_script, FakeInstall};
    use std::sync::Mutex;

    fn layer_with_dataset(top: &Path) -> LayerContext {
        let mut layer = LayerContext::create(top, 1).unwrap();
        let zip = layer.dir().join("data.MIDAS.zip");
        std::fs::write(&zip, b"zip").unwrap();
        layer.set_dataset(zip).unwrap();
        layer
    }

    #[test]
    fn test_stage_order_and_shape() {
        assert_eq!(Stage::SEQUENCE[0], Stage::Convert);
        assert_eq!(Stage::SEQUENCE[9], Stage::ProcessGrains);
        let parallel: Vec<Stage> = Stage::SEQUENCE
            .into_iter()
            .filter(|s| s.is_block_parallel())
            .collect();
        assert_eq!(parallel, vec![Stage::PeakSearch, Stage::Index, Stage::Refine]);
        assert!(Stage::Convert.binary().is_none());
        assert_eq!(Stage::SEQUENCE.iter().filter(|s| s.binary().is_some()).count(), 9);
    }

    #[test]
    fn test_spots_count() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SPOTS_TO_INDEX_FILE), "1\n2\n3\n4\n5\n").unwrap();
        assert_eq!(spots_to_index_count(dir.path()).unwrap(), 5);
        std::fs::write(dir.path().join(SPOTS_TO_INDEX_FILE), "1\n2").unwrap();
        assert_eq!(spots_to_index_count(dir.path()).unwrap(), 2);
    }

    #[test]
    fn test_spots_count_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            spots_to_index_count(dir.path()),
            Err(StageError::MissingPrecondition { .. })
        ));
    }

    #[test]
    fn test_single_block_stage() {
        let fake = FakeInstall::new();
        let backend = ExecutionProfile::Local.backend_config(4, None, 0).build().unwrap();
        let install = fake.installation();
        let runner = StageRunner::new(&backend, &install);
        let layer = layer_with_dataset(fake.results());

        let report = runner.run_stage(Stage::GenerateHkls, &layer, 7).unwrap();
        assert_eq!(report.outcomes.len(), 1);
        assert!(layer.log_dir().join("hkls_out0.csv").exists());
        assert!(layer.log_dir().join("hkls_err0.csv").exists());
        assert!(layer.dir().join(HKL_LIST_FILE).exists());
    }

    #[test]
    fn test_index_gets_line_count_in_every_block() {
        let fake = FakeInstall::new();
        let backend = ExecutionProfile::UMich.backend_config(4, Some(3), 0);
        let backend = PoolBackend::new(BackendConfig {
            placement: Placement::LocalThreads,
            ..backend
        })
        .unwrap();
        let install = fake.installation();
        let runner = StageRunner::new(&backend, &install);
        let layer = layer_with_dataset(fake.results());
        std::fs::write(layer.dir().join(FIT_PARAMS_FILE), "").unwrap();
        std::fs::write(layer.dir().join(SPOTS_TO_INDEX_FILE), "a\nb\nc\nd\ne\nf\ng\n").unwrap();

        let report = runner.run_stage(Stage::Index, &layer, 3).unwrap();
        assert_eq!(report.outcomes.len(), 3);
        for (idx, outcome) in report.outcomes.iter().enumerate() {
            assert_eq!(outcome.block.index, idx);
            let out = std::fs::read_to_string(&outcome.stdout_log).unwrap();
            assert_eq!(out.trim(), format!("IndexerOMP paramstest.txt {idx} 3 7 36"));
        }
    }

    #[test]
    fn test_missing_spots_fails_fast() {
        let fake = FakeInstall::new();
        let backend = ExecutionProfile::Local.backend_config(1, None, 0).build().unwrap();
        let install = fake.installation();
        let runner = StageRunner::new(&backend, &install);
        let layer = layer_with_dataset(fake.results());
        std::fs::write(layer.dir().join(FIT_PARAMS_FILE), "").unwrap();

        match runner.run_stage(Stage::Refine, &layer, 1) {
            Err(StageError::MissingPrecondition { stage, path }) => {
                assert_eq!(stage, Stage::Refine);
                assert!(path.ends_with(SPOTS_TO_INDEX_FILE));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!layer.log_dir().join("refining_out0.csv").exists());
    }

    #[test]
    fn test_peak_search_requires_hkls() {
        let fake = FakeInstall::new();
        let backend = ExecutionProfile::Local.backend_config(1, None, 0).build().unwrap();
        let install = fake.installation();
        let runner = StageRunner::new(&backend, &install);
        let layer = layer_with_dataset(fake.results());
        assert!(matches!(
            runner.run_stage(Stage::PeakSearch, &layer, 1),
            Err(StageError::MissingPrecondition { stage: Stage::PeakSearch, .. })
        ));
    }

    #[test]
    fn test_failed_block_fails_stage_after_barrier() {
        let fake = FakeInstall::new();
        // Block 1 fails immediately; the others must still run to completion
        write_script(
            &fake.bin(),
            PEAKS_BIN,
            "if [ \"$2\" = 1 ]; then echo boom >&2; exit 4; fi\nsleep 0.2\ntouch \"$(dirname \"$1\")/peaks_$2\"\n",
        );
        let config = BackendConfig {
            profile: ExecutionProfile::UMich,
            workers_per_node: 1,
            node_count: 3,
            placement: Placement::LocalThreads,
            retries: 0,
        };
        let backend = config.build().unwrap();
        let install = fake.installation();
        let runner = StageRunner::new(&backend, &install);
        let layer = layer_with_dataset(fake.results());
        std::fs::write(layer.dir().join(HKL_LIST_FILE), "").unwrap();

        match runner.run_stage(Stage::PeakSearch, &layer, 3) {
            Err(StageError::BlocksFailed { stage, failures }) => {
                assert_eq!(stage, Stage::PeakSearch);
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].block_index, 1);
                assert!(failures[0].reason.contains("boom"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(layer.dir().join("peaks_0").exists());
        assert!(layer.dir().join("peaks_2").exists());
    }

    /// Records submission order and completes blocks in reverse order
    struct ReversingBackend {
        submitted: Mutex<Vec<usize>>,
        pending: Mutex<Vec<(BlockTask, Sender<Result<BlockOutcome, BlockTaskError>>)>>,
        count: usize,
    }

    impl Backend for ReversingBackend {
        fn submit(&self, task: BlockTask) -> BlockHandle {
            let (tx, handle) = BlockHandle::channel(task.block.index);
            self.submitted.lock().unwrap().push(task.block.index);
            let mut pending = self.pending.lock().unwrap();
            pending.push((task, tx));
            if pending.len() == self.count {
                for (task, tx) in pending.drain(..).rev() {
                    tx.send(task.run()).unwrap();
                }
            }
            handle
        }

        fn block_count(&self) -> usize {
            self.count
        }

        fn workers_per_block(&self) -> usize {
            2
        }
    }

    #[test]
    fn test_completion_order_does_not_matter() {
        let fake = FakeInstall::new();
        let install = fake.installation();
        let backend = ReversingBackend {
            submitted: Mutex::new(vec![]),
            pending: Mutex::new(vec![]),
            count: 4,
        };
        let runner = StageRunner::new(&backend, &install);
        let layer = layer_with_dataset(fake.results());
        std::fs::write(layer.dir().join(HKL_LIST_FILE), "").unwrap();

        let report = runner.run_stage(Stage::PeakSearch, &layer, 4).unwrap();
        assert_eq!(*backend.submitted.lock().unwrap(), vec![0, 1, 2, 3]);
        let indices: Vec<usize> = report.outcomes.iter().map(|o| o.block.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        for idx in 0..4 {
            assert!(layer.log_dir().join(format!("peaksearch_out{idx}.csv")).exists());
        }
    }

    #[test]
    fn test_convert_has_no_binary() {
        let fake = FakeInstall::new();
        let backend = ExecutionProfile::Local.backend_config(1, None, 0).build().unwrap();
        let install = fake.installation();
        let runner = StageRunner::new(&backend, &install);
        let layer = layer_with_dataset(fake.results());
        assert!(matches!(
            runner.run_stage(Stage::Convert, &layer, 1),
            Err(StageError::NoBinary(Stage::Convert))
        ));
    }
}
