use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::mpsc::Sender;

use super::backend::Backend;
use super::config::Config;
use super::constants::LOG_DIR;
use super::error::{DriverError, LayerError};
use super::installation::Installation;
use super::layer::{LayerPipeline, LayerReport};
use super::scratch::SharedScratch;
use super::worker_status::LayerStatus;

/// Run `run` once per layer, strictly in increasing order, one at a time.
///
/// Stops at the first layer that fails and hands back its number with the error.
pub fn run_layers<T, E, F>(layers: RangeInclusive<u32>, mut run: F) -> Result<Vec<T>, (u32, E)>
where
    F: FnMut(u32) -> Result<T, E>,
{
    let mut results = Vec::new();
    for layer_nr in layers {
        match run(layer_nr) {
            Ok(result) => results.push(result),
            Err(e) => return Err((layer_nr, e)),
        }
    }
    Ok(results)
}

/// The main loop of ff_runner.
///
/// Validates the config, resolves the toolchain and the execution backend (once, for the
/// whole run) and then processes every requested layer in sequence.
pub fn process(config: &Config, tx: Sender<LayerStatus>) -> Result<Vec<LayerReport>, DriverError> {
    config.validate()?;
    let top_dir = config.get_result_directory()?;
    let log_dir = top_dir.join(LOG_DIR);
    std::fs::create_dir_all(&log_dir)?;

    let install = Installation::resolve(&config.install, &log_dir)?;
    let backend_config = config.backend_config();
    log::info!(
        "Execution profile {}: {} block(s) of {} worker(s) each",
        backend_config.profile,
        backend_config.node_count,
        backend_config.workers_per_node
    );
    let backend = backend_config.build()?;
    let scratch = SharedScratch::new(&config.get_scratch_directory());

    process_layers(config, &backend, &install, &scratch, &top_dir, tx)
}

/// Process the configured layer range on an already resolved backend
pub fn process_layers(
    config: &Config,
    backend: &dyn Backend,
    install: &Installation,
    scratch: &SharedScratch,
    top_dir: &Path,
    tx: Sender<LayerStatus>,
) -> Result<Vec<LayerReport>, DriverError> {
    let pipeline = LayerPipeline::new(config, backend, install, scratch, top_dir).with_status(tx);
    run_layers(config.layers(), |layer_nr| {
        let report = pipeline.run_layer(layer_nr)?;
        if !report.is_clean() {
            log::warn!(
                "Layer {layer_nr} finished with {} failed stage(s)",
                report.failures.len()
            );
        }
        Ok::<_, LayerError>(report)
    })
    .map_err(|(layer, source)| DriverError::LayerError { layer, source })
}
