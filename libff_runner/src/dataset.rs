use std::path::{Path, PathBuf};

use super::block::{Block, BlockTask};
use super::config::Config;
use super::constants::*;
use super::error::ConversionError;
use super::layer::LayerContext;
use super::params::ParameterFile;
use super::stage::{Stage, StageRunner};

/// Produce the layer's dataset artifact, either by converting raw frames or by adopting a
/// dataset that was converted earlier.
pub fn acquire_dataset(
    config: &Config,
    runner: &StageRunner,
    layer: &LayerContext,
) -> Result<PathBuf, ConversionError> {
    let dataset = if config.convert_files {
        if config.data_file.is_some() {
            log::info!("Generating combined MIDAS file from HDF and parameter files.");
        } else {
            log::info!("Generating combined MIDAS file from GE and parameter files.");
        }
        convert(config, runner, layer)?
    } else {
        adopt(config, runner, layer)?
    };

    match std::fs::metadata(&dataset) {
        Ok(meta) => log::info!(
            "Dataset for layer {} is {} ({})",
            layer.layer_nr(),
            dataset.display(),
            human_bytes::human_bytes(meta.len() as f64)
        ),
        Err(_) => return Err(ConversionError::MissingArtifact(dataset)),
    }
    Ok(dataset)
}

/// Run the conversion script; it reports the artifact it wrote on its last stdout line
fn convert(
    config: &Config,
    runner: &StageRunner,
    layer: &LayerContext,
) -> Result<PathBuf, ConversionError> {
    let install = runner.install();
    let mut task = BlockTask::new(
        Stage::Convert.name(),
        install.python().to_path_buf(),
        Block::single(1),
        layer.log_dir(),
    )
    .arg(install.script(GENERATE_ZIP_SCRIPT))
    .arg("-resultFolder")
    .arg(layer.dir())
    .arg("-LayerNr")
    .arg(layer.layer_nr().to_string())
    .envs(install.environment());
    if let Some(param_file) = &config.param_file {
        task = task.arg("-paramFN").arg(param_file);
    }
    if let Some(data_file) = &config.data_file {
        task = task.arg("-dataFN").arg(data_file);
    }
    if let Some(chunks) = config.n_frame_chunks {
        task = task.arg("-numFrameChunks").arg(chunks.to_string());
    }
    if let Some(thresh) = config.pre_proc_thresh {
        task = task.arg("-preProcThresh").arg(thresh.to_string());
    }

    let report = runner.dispatch(Stage::Convert, vec![task])?;
    let stdout_log = layer
        .log_dir()
        .join(format!("{}_out0.csv", Stage::Convert.name()));
    report
        .outcomes
        .first()
        .and_then(|outcome| outcome.last_stdout_line())
        .and_then(|line| parse_output_name(&line))
        .ok_or(ConversionError::NoArtifact(stdout_log))
}

/// `OutputZipName /path/to/file.MIDAS.zip` -> the path
fn parse_output_name(line: &str) -> Option<PathBuf> {
    let mut tokens = line.split_whitespace();
    if tokens.next()? != OUTPUT_ZIP_KEY {
        return None;
    }
    tokens.next().map(PathBuf::from)
}

/// Pick up an already converted dataset, place it in the layer directory and point its
/// embedded result folder at this layer.
fn adopt(
    config: &Config,
    runner: &StageRunner,
    layer: &LayerContext,
) -> Result<PathBuf, ConversionError> {
    let dataset = if let Some(data_file) = &config.data_file {
        let name = data_file
            .file_name()
            .ok_or_else(|| ConversionError::MissingArtifact(data_file.clone()))?;
        let target = layer.dir().join(name);
        if !target.exists() {
            if !data_file.exists() {
                return Err(ConversionError::MissingArtifact(data_file.clone()));
            }
            std::fs::copy(data_file, &target)?;
        }
        target
    } else if let Some(param_file) = &config.param_file {
        let params = ParameterFile::read(param_file)?;
        let target = layer.dir().join(params.dataset_name(layer.layer_nr())?);
        if !target.exists() {
            return Err(ConversionError::MissingArtifact(target));
        }
        target
    } else {
        return Err(ConversionError::NoSource(layer.layer_nr()));
    };

    update_result_folder(runner, layer, &dataset)?;
    Ok(dataset)
}

fn update_result_folder(
    runner: &StageRunner,
    layer: &LayerContext,
    dataset: &Path,
) -> Result<(), ConversionError> {
    let install = runner.install();
    let name = dataset
        .file_name()
        .ok_or_else(|| ConversionError::MissingArtifact(dataset.to_path_buf()))?;
    let mut updated_value = layer.dir().as_os_str().to_os_string();
    updated_value.push("/");
    let task = BlockTask::new(
        Stage::Convert.name(),
        install.python().to_path_buf(),
        Block::single(1),
        layer.log_dir(),
    )
    .arg(install.script(UPDATE_DSET_SCRIPT))
    .arg("-fn")
    .arg(name)
    .arg("-folder")
    .arg(layer.dir())
    .arg("-keyToUpdate")
    .arg("ResultFolder")
    .arg("-updatedValue")
    .arg(updated_value)
    .envs(install.environment());
    runner.dispatch(Stage::Convert, vec![task])?;
    Ok(())
}
