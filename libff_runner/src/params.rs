use std::path::Path;

use super::constants::*;
use super::error::ParameterFileError;

/// The subset of a MIDAS parameter file the runner needs to find raw data for a layer.
///
/// Parameter files are line oriented: a key, whitespace, then one or more values. Anything
/// the runner does not recognize is left for the native binaries to interpret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterFile {
    pub file_stem: String,
    pub start_file_nr: u32,
    pub files_per_sweep: u32,
}

impl ParameterFile {
    /// Read and parse a parameter file from disk
    pub fn read(path: &Path) -> Result<Self, ParameterFileError> {
        if !path.exists() {
            return Err(ParameterFileError::BadFilePath(path.to_path_buf()));
        }
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse parameter file contents. Later occurrences of a key override earlier ones.
    pub fn parse(contents: &str) -> Result<Self, ParameterFileError> {
        let mut file_stem: Option<String> = None;
        let mut start_file_nr: Option<u32> = None;
        let mut files_per_sweep: Option<u32> = None;

        for line in contents.lines() {
            let mut tokens = line.split_whitespace();
            let (Some(key), Some(value)) = (tokens.next(), tokens.next()) else {
                continue;
            };
            match key {
                KEY_FILE_STEM => file_stem = Some(value.to_string()),
                KEY_START_FILE_NR => start_file_nr = Some(parse_value(KEY_START_FILE_NR, value)?),
                KEY_FILES_PER_SWEEP => {
                    files_per_sweep = Some(parse_value(KEY_FILES_PER_SWEEP, value)?)
                }
                _ => (),
            }
        }

        Ok(Self {
            file_stem: file_stem.ok_or(ParameterFileError::MissingKey(KEY_FILE_STEM))?,
            start_file_nr: start_file_nr.ok_or(ParameterFileError::MissingKey(KEY_START_FILE_NR))?,
            files_per_sweep: files_per_sweep
                .ok_or(ParameterFileError::MissingKey(KEY_FILES_PER_SWEEP))?,
        })
    }

    /// The first raw file number belonging to a layer (layers count from 1)
    pub fn file_number(&self, layer_nr: u32) -> Result<u32, ParameterFileError> {
        layer_nr
            .saturating_sub(1)
            .checked_mul(self.files_per_sweep)
            .and_then(|offset| offset.checked_add(self.start_file_nr))
            .ok_or(ParameterFileError::FileNumberOverflow(layer_nr))
    }

    /// Name of the converted dataset for a layer, e.g. `Ti7_000042.MIDAS.zip`
    pub fn dataset_name(&self, layer_nr: u32) -> Result<String, ParameterFileError> {
        Ok(format!(
            "{}_{:0>width$}{}",
            self.file_stem,
            self.file_number(layer_nr)?,
            DATASET_SUFFIX,
            width = FILE_NUMBER_WIDTH
        ))
    }
}

fn parse_value(key: &'static str, value: &str) -> Result<u32, ParameterFileError> {
    value.parse().map_err(|_| ParameterFileError::BadValue {
        key,
        value: value.to_string(),
    })
}
