// Installation layout
pub const DEFAULT_BIN_DIR: &str = "~/opt/MIDAS/FF_HEDM/bin";
pub const DEFAULT_UTILS_DIR: &str = "~/opt/MIDAS/utils";
pub const DEFAULT_LIBRARY_ROOT: &str = "~/.MIDAS";
pub const DEFAULT_PYTHON: &str = "python";

/// Dependency directories (relative to the library root) that must be on the
/// library search path of every native binary. Order matters.
pub const LIBRARY_SUBDIRS: [&str; 7] = [
    "BLOSC/lib64",
    "FFTW/lib",
    "HDF5/lib",
    "LIBTIFF/lib",
    "LIBZIP/lib64",
    "NLOPT/lib",
    "ZLIB/lib",
];

#[cfg(target_os = "macos")]
pub const LIBRARY_PATH_VAR: &str = "DYLD_LIBRARY_PATH";
#[cfg(not(target_os = "macos"))]
pub const LIBRARY_PATH_VAR: &str = "LD_LIBRARY_PATH";

pub const SCRIPT_DIR_VAR: &str = "MIDAS_SCRIPT_DIR";

// Scripts
pub const GENERATE_ZIP_SCRIPT: &str = "ffGenerateZip.py";
pub const UPDATE_DSET_SCRIPT: &str = "updateZarrDset.py";
pub const OUTPUT_ZIP_KEY: &str = "OutputZipName";

// Native binaries
pub const HKL_BIN: &str = "GetHKLListZarr";
pub const PEAKS_BIN: &str = "PeaksFittingOMPZarr";
pub const MERGE_BIN: &str = "MergeOverlappingPeaksAllZarr";
pub const RADIUS_BIN: &str = "CalcRadiusAllZarr";
pub const FIT_SETUP_BIN: &str = "FitSetupZarr";
pub const BIN_DATA_BIN: &str = "SaveBinData";
pub const INDEXER_BIN: &str = "IndexerOMP";
pub const REFINER_BIN: &str = "FitPosOrStrainsOMP";
pub const GRAINS_BIN: &str = "ProcessGrainsZarr";

// Layer directory layout
pub const LAYER_DIR_PREFIX: &str = "LayerNr_";
pub const LOG_DIR: &str = "output";
pub const TEMP_DIR: &str = "Temp";
pub const RUNNER_LOG_FILE: &str = "ff_runner.log";

// Files exchanged between stages
pub const HKL_LIST_FILE: &str = "hkls.csv";
pub const SPOTS_TO_INDEX_FILE: &str = "SpotsToIndex.csv";
pub const FIT_PARAMS_FILE: &str = "paramstest.txt";
pub const DATASET_SUFFIX: &str = ".MIDAS.zip";
pub const FILE_NUMBER_WIDTH: usize = 6;

// Shared-memory scratch written by binning and read by index/refine
pub const DEFAULT_SCRATCH_DIR: &str = "/dev/shm";
pub const SCRATCH_EXTENSION: &str = "bin";

// Parameter file keys
pub const KEY_FILE_STEM: &str = "FileStem";
pub const KEY_START_FILE_NR: &str = "StartFileNrFirstLayer";
pub const KEY_FILES_PER_SWEEP: &str = "NrFilesPerSweep";

// Slurm launcher used by the cluster profiles
pub const SLURM_LAUNCHER: &str = "srun";

pub const DEFAULT_N_CPUS: usize = 10;
