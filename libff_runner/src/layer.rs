use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

use super::backend::Backend;
use super::config::{Config, FailurePolicy};
use super::constants::*;
use super::dataset::acquire_dataset;
use super::error::{LayerError, StageError};
use super::installation::Installation;
use super::scratch::SharedScratch;
use super::stage::{Stage, StageReport, StageRunner};
use super::worker_status::LayerStatus;

/// The on-disk home of one layer: `<top>/LayerNr_<n>` with its `output/` logs and
/// `Temp/` scratch, plus the dataset once it is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerContext {
    layer_nr: u32,
    dir: PathBuf,
    log_dir: PathBuf,
    temp_dir: PathBuf,
    dataset: Option<PathBuf>,
}

impl LayerContext {
    /// Create the layer and log directories (existing ones are reused)
    pub fn create(top_dir: &Path, layer_nr: u32) -> Result<Self, LayerError> {
        let dir = top_dir.join(format!("{LAYER_DIR_PREFIX}{layer_nr}"));
        let log_dir = dir.join(LOG_DIR);
        std::fs::create_dir_all(&log_dir).map_err(|source| LayerError::Setup {
            layer: layer_nr,
            path: log_dir.clone(),
            source,
        })?;
        Ok(Self {
            layer_nr,
            temp_dir: dir.join(TEMP_DIR),
            dir,
            log_dir,
            dataset: None,
        })
    }

    pub fn create_temp_dir(&self) -> Result<(), LayerError> {
        std::fs::create_dir_all(&self.temp_dir).map_err(|source| LayerError::Setup {
            layer: self.layer_nr,
            path: self.temp_dir.clone(),
            source,
        })
    }

    pub fn layer_nr(&self) -> u32 {
        self.layer_nr
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn dataset(&self) -> Option<&Path> {
        self.dataset.as_deref()
    }

    /// The dataset is set once per layer; later stages only read it
    pub fn set_dataset(&mut self, dataset: PathBuf) -> Result<(), LayerError> {
        if let Some(existing) = &self.dataset {
            return Err(LayerError::DatasetAlreadySet {
                layer: self.layer_nr,
                path: existing.clone(),
            });
        }
        self.dataset = Some(dataset);
        Ok(())
    }
}

/// What a finished layer produced
#[derive(Debug)]
pub struct LayerReport {
    pub layer_nr: u32,
    pub dataset: PathBuf,
    pub stages: Vec<StageReport>,
    /// Stage failures that were stepped over under [`FailurePolicy::Continue`]
    pub failures: Vec<StageError>,
    pub scratch_cleared: usize,
    pub elapsed: Duration,
}

impl LayerReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Runs the fixed stage sequence for one layer at a time.
///
/// The pipeline borrows everything it needs; it holds no state between layers, so the
/// driver can reuse one pipeline for the whole layer range.
pub struct LayerPipeline<'a> {
    config: &'a Config,
    backend: &'a dyn Backend,
    runner: StageRunner<'a>,
    scratch: &'a SharedScratch,
    top_dir: PathBuf,
    status_tx: Option<Sender<LayerStatus>>,
}

// Bookkeeping for one run_layer call
struct LayerProgress {
    layer_nr: u32,
    start: Instant,
    steps_done: usize,
    stages: Vec<StageReport>,
    failures: Vec<StageError>,
}

impl<'a> LayerPipeline<'a> {
    pub fn new(
        config: &'a Config,
        backend: &'a dyn Backend,
        install: &'a Installation,
        scratch: &'a SharedScratch,
        top_dir: &Path,
    ) -> Self {
        Self {
            config,
            backend,
            runner: StageRunner::new(backend, install),
            scratch,
            top_dir: top_dir.to_path_buf(),
            status_tx: None,
        }
    }

    /// Send a [`LayerStatus`] after every stage
    pub fn with_status(mut self, tx: Sender<LayerStatus>) -> Self {
        self.status_tx = Some(tx);
        self
    }

    /// Run every stage of one layer, in order.
    pub fn run_layer(&self, layer_nr: u32) -> Result<LayerReport, LayerError> {
        let mut progress = LayerProgress {
            layer_nr,
            start: Instant::now(),
            steps_done: 0,
            stages: Vec::new(),
            failures: Vec::new(),
        };
        let mut layer = LayerContext::create(&self.top_dir, layer_nr)?;
        log::info!(
            "Doing Layer Nr: {layer_nr}, results will be saved in {}",
            layer.dir().display()
        );

        let dataset = acquire_dataset(self.config, &self.runner, &layer)?;
        layer.set_dataset(dataset.clone())?;
        self.finish_step(&mut progress, Stage::Convert, true)?;

        self.run_step(&layer, Stage::GenerateHkls, &mut progress)?;
        layer.create_temp_dir()?;
        self.run_step(&layer, Stage::PeakSearch, &mut progress)?;
        self.run_step(&layer, Stage::MergePeaks, &mut progress)?;
        self.run_step(&layer, Stage::CalcRadius, &mut progress)?;
        self.run_step(&layer, Stage::FitSetup, &mut progress)?;

        // Scratch belongs to this layer from binning until refinement is done. The guard
        // clears it if any of these stages bails out early.
        let scratch_cleared = {
            let guard = self.scratch.guard();
            self.run_step(&layer, Stage::BinData, &mut progress)?;
            self.run_step(&layer, Stage::Index, &mut progress)?;
            self.run_step(&layer, Stage::Refine, &mut progress)?;
            guard.release()?
        };
        log::info!("Cleared {scratch_cleared} scratch file(s) from {}", self.scratch.dir().display());

        self.run_step(&layer, Stage::ProcessGrains, &mut progress)?;

        let elapsed = progress.start.elapsed();
        log::info!(
            "Done Layer {layer_nr}. Total time elapsed: {:.1} seconds.",
            elapsed.as_secs_f64()
        );
        Ok(LayerReport {
            layer_nr,
            dataset,
            stages: progress.stages,
            failures: progress.failures,
            scratch_cleared,
            elapsed,
        })
    }

    fn run_step(
        &self,
        layer: &LayerContext,
        stage: Stage,
        progress: &mut LayerProgress,
    ) -> Result<(), LayerError> {
        log::info!(
            "Layer {}: running {stage}. Time till now: {:.1} seconds.",
            progress.layer_nr,
            progress.start.elapsed().as_secs_f64()
        );
        match self
            .runner
            .run_stage(stage, layer, self.backend.block_count())
        {
            Ok(report) => {
                progress.stages.push(report);
                self.finish_step(progress, stage, true)
            }
            Err(e)
                if e.is_invocation_failure()
                    && self.config.failure_policy == FailurePolicy::Continue =>
            {
                log::warn!("Layer {}: {e}; continuing with the next stage", progress.layer_nr);
                progress.failures.push(e);
                self.finish_step(progress, stage, false)
            }
            Err(e) => {
                log::error!("Layer {}: {e}", progress.layer_nr);
                Err(LayerError::StageError(e))
            }
        }
    }

    fn finish_step(
        &self,
        progress: &mut LayerProgress,
        stage: Stage,
        ok: bool,
    ) -> Result<(), LayerError> {
        progress.steps_done += 1;
        if let Some(tx) = &self.status_tx {
            tx.send(LayerStatus::new(
                progress.layer_nr,
                stage,
                progress.steps_done,
                Stage::SEQUENCE.len(),
                progress.start.elapsed(),
                ok,
            ))?;
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::backend::{BackendConfig, BlockHandle, ExecutionProfile, Placement, PoolBackend};
    use crate::block::BlockTask;
    use crate::test_utils::{write_script, FakeInstall};
    use std::sync::{mpsc, Mutex};

    fn pool(nodes: usize) -> PoolBackend {
        PoolBackend::new(BackendConfig {
            profile: ExecutionProfile::UMich,
            workers_per_node: 2,
            node_count: nodes,
            placement: Placement::LocalThreads,
            retries: 0,
        })
        .unwrap()
    }

    #[test]
    fn test_layer_runs_every_stage_once() {
        let fake = FakeInstall::new();
        let config = fake.config();
        let backend = pool(1);
        let install = fake.installation();
        let scratch = SharedScratch::new(&fake.scratch());
        let (tx, rx) = mpsc::channel();
        let pipeline =
            LayerPipeline::new(&config, &backend, &install, &scratch, fake.results()).with_status(tx);

        let report = pipeline.run_layer(1).unwrap();
        assert!(report.is_clean());
        let stages: Vec<Stage> = report.stages.iter().map(|r| r.stage).collect();
        assert_eq!(stages, Stage::SEQUENCE[1..].to_vec());

        let layer_dir = fake.results().join("LayerNr_1");
        for stage in &Stage::SEQUENCE[1..] {
            assert!(layer_dir.join("output").join(format!("{stage}_out0.csv")).exists());
            assert!(layer_dir.join("output").join(format!("{stage}_err0.csv")).exists());
        }
        assert!(layer_dir.join("Temp").is_dir());
        assert!(layer_dir.join("Grains.csv").exists());

        // Binning wrote scratch; it must be gone once refinement is over
        assert_eq!(report.scratch_cleared, 1);
        assert!(scratch.files().unwrap().is_empty());

        let statuses: Vec<LayerStatus> = rx.try_iter().collect();
        assert_eq!(statuses.len(), Stage::SEQUENCE.len());
        assert_eq!(statuses.last().unwrap().stage, Stage::ProcessGrains);
        assert_eq!(statuses.last().unwrap().progress(), 1.0);
    }

    #[test]
    fn test_stage_order_is_fixed() {
        let fake = FakeInstall::new();
        let config = fake.config();
        let backend = pool(2);
        let install = fake.installation();
        let scratch = SharedScratch::new(&fake.scratch());
        LayerPipeline::new(&config, &backend, &install, &scratch, fake.results())
            .run_layer(1)
            .unwrap();

        let journal = std::fs::read_to_string(fake.journal()).unwrap();
        let order: Vec<&str> = journal.lines().collect();
        let first = |name: &str| order.iter().position(|l| *l == name).unwrap();
        let last = |name: &str| order.iter().rposition(|l| *l == name).unwrap();
        assert!(last(HKL_BIN) < first(PEAKS_BIN));
        assert!(last(PEAKS_BIN) < first(MERGE_BIN));
        assert!(last(FIT_SETUP_BIN) < first(BIN_DATA_BIN));
        assert!(last(INDEXER_BIN) < first(REFINER_BIN));
        assert!(last(REFINER_BIN) < first(GRAINS_BIN));
        assert_eq!(order.iter().filter(|l| **l == PEAKS_BIN).count(), 2);
    }

    #[test]
    fn test_failed_stage_aborts_layer_and_clears_scratch() {
        let fake = FakeInstall::new();
        write_script(&fake.bin(), INDEXER_BIN, "echo indexer died >&2\nexit 1\n");
        let config = fake.config();
        let backend = pool(1);
        let install = fake.installation();
        let scratch = SharedScratch::new(&fake.scratch());

        let result = LayerPipeline::new(&config, &backend, &install, &scratch, fake.results())
            .run_layer(1);
        match result {
            Err(LayerError::StageError(StageError::BlocksFailed { stage, .. })) => {
                assert_eq!(stage, Stage::Index)
            }
            other => panic!("unexpected {other:?}"),
        }
        let output = fake.results().join("LayerNr_1").join("output");
        assert!(!output.join("refining_out0.csv").exists());
        assert!(!output.join("process_grains_out0.csv").exists());
        assert!(scratch.files().unwrap().is_empty());
    }

    #[test]
    fn test_continue_policy_runs_past_failures() {
        let fake = FakeInstall::new();
        write_script(&fake.bin(), MERGE_BIN, "exit 2\n");
        let config = Config {
            failure_policy: FailurePolicy::Continue,
            ..fake.config()
        };
        let backend = pool(1);
        let install = fake.installation();
        let scratch = SharedScratch::new(&fake.scratch());

        let report = LayerPipeline::new(&config, &backend, &install, &scratch, fake.results())
            .run_layer(1)
            .unwrap();
        assert!(!report.is_clean());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.stages.len(), 8);
        assert!(fake
            .results()
            .join("LayerNr_1/output/process_grains_out0.csv")
            .exists());
    }

    #[test]
    fn test_missing_precondition_is_fatal_even_when_continuing() {
        let fake = FakeInstall::new();
        // Fit setup "succeeds" without writing the control files
        write_script(&fake.bin(), FIT_SETUP_BIN, "exit 0\n");
        let config = Config {
            failure_policy: FailurePolicy::Continue,
            ..fake.config()
        };
        let backend = pool(1);
        let install = fake.installation();
        let scratch = SharedScratch::new(&fake.scratch());

        let result = LayerPipeline::new(&config, &backend, &install, &scratch, fake.results())
            .run_layer(1);
        assert!(matches!(
            result,
            Err(LayerError::StageError(StageError::MissingPrecondition {
                stage: Stage::BinData,
                ..
            }))
        ));
    }

    /// Runs blocks in place and remembers which stages reached the backend
    struct RecordingBackend {
        stems: Mutex<Vec<&'static str>>,
    }

    impl Backend for RecordingBackend {
        fn submit(&self, task: BlockTask) -> BlockHandle {
            self.stems.lock().unwrap().push(task.log_stem);
            let (tx, handle) = BlockHandle::channel(task.block.index);
            tx.send(task.run()).unwrap();
            handle
        }

        fn block_count(&self) -> usize {
            2
        }

        fn workers_per_block(&self) -> usize {
            1
        }
    }

    #[test]
    fn test_only_parallel_stages_reach_the_backend() {
        let fake = FakeInstall::new();
        let config = fake.config();
        let backend = RecordingBackend {
            stems: Mutex::new(vec![]),
        };
        let install = fake.installation();
        let scratch = SharedScratch::new(&fake.scratch());
        LayerPipeline::new(&config, &backend, &install, &scratch, fake.results())
            .run_layer(1)
            .unwrap();

        let mut stems = backend.stems.lock().unwrap().clone();
        assert_eq!(stems.len(), 6);
        stems.sort();
        stems.dedup();
        assert_eq!(stems, vec!["indexing", "peaksearch", "refining"]);

        // Serial stages still ran, on the driver
        let output = fake.results().join("LayerNr_1").join("output");
        for stem in ["convert", "hkls", "binning", "process_grains"] {
            assert!(output.join(format!("{stem}_out0.csv")).exists());
        }
    }

    #[test]
    fn test_layer_with_existing_dataset() {
        let fake = FakeInstall::new();
        let config = Config {
            convert_files: false,
            ..fake.config()
        };
        let backend = pool(1);
        let install = fake.installation();
        let scratch = SharedScratch::new(&fake.scratch());

        // StartFileNrFirstLayer 10 -> layer 1 is file 10
        let layer_dir = fake.results().join("LayerNr_1");
        std::fs::create_dir_all(&layer_dir).unwrap();
        let dataset = layer_dir.join("scan_000010.MIDAS.zip");
        std::fs::write(&dataset, b"zip").unwrap();

        let report = LayerPipeline::new(&config, &backend, &install, &scratch, fake.results())
            .run_layer(1)
            .unwrap();
        assert!(report.is_clean());
        assert_eq!(report.dataset, dataset);
        assert_eq!(report.stages.len(), Stage::SEQUENCE.len() - 1);
        assert!(layer_dir.join("update_args").exists());
        assert!(!layer_dir.join("convert_args").exists());
        assert!(layer_dir.join("Grains.csv").exists());
        assert!(scratch.files().unwrap().is_empty());
    }

    #[test]
    fn test_dataset_is_set_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut layer = LayerContext::create(dir.path(), 1).unwrap();
        layer.set_dataset(dir.path().join("a.MIDAS.zip")).unwrap();
        assert!(matches!(
            layer.set_dataset(dir.path().join("b.MIDAS.zip")),
            Err(LayerError::DatasetAlreadySet { layer: 1, .. })
        ));
        assert_eq!(layer.dataset(), Some(dir.path().join("a.MIDAS.zip").as_path()));
    }
}
