//! # ff_runner
//!
//! ff_runner drives the MIDAS far-field HEDM reconstruction pipeline, written in Rust. It
//! takes a parameter file (or an already converted dataset) and, for each requested
//! layer, runs the native MIDAS binaries in a fixed order: dataset conversion, HKL
//! generation, peak search, peak merging, radius calculation, fit setup, binning,
//! indexing, refinement and grain processing. Peak search, indexing and refinement are
//! split into blocks and fanned out over an execution backend; every other stage runs as a
//! single invocation.
//!
//! ## Installation
//!
//! The only method of install is from source. If you have not used Rust before, you will
//! most likely need to install the Rust tool chain. See the
//! [Rust docs](https://www.rust-lang.org/tools/install) for installation instructions.
//!
//! ff_runner does not ship the reconstruction programs themselves. It expects a MIDAS
//! install with the native binaries in `~/opt/MIDAS/FF_HEDM/bin`, the Python helper
//! scripts in `~/opt/MIDAS/utils` and the shared library dependencies (BLOSC, NLOPT, HDF5,
//! ...) under `~/.MIDAS`. All three locations can be changed in the configuration file.
//!
//! ### Platform Support
//!
//! ff_runner targets Linux, which is where the MIDAS binaries are built. MacOS works for
//! local runs. Cluster profiles place blocks with Slurm's `srun`.
//!
//! ### Building & Install
//!
//! To build and install the CLI use `cargo install --path ./ff_runner_cli` from the top
//! level repository. See the `ff_runner_cli` help (`ff_runner_cli --help`) for usage.
//!
//! ## Configuration
//!
//! Every command line flag has a counterpart in the YAML configuration file. A template
//! can be written with `ff_runner_cli new -p config.yml`. The format is as follows:
//!
//! ```yml
//! result_folder: ''
//! param_file: null
//! data_file: null
//! n_cpus: 10
//! machine: local
//! n_nodes: null
//! n_frame_chunks: null
//! pre_proc_thresh: null
//! start_layer: 1
//! end_layer: 1
//! convert_files: true
//! failure_policy: abort_layer
//! retries: 0
//! scratch_dir: /dev/shm
//! install:
//!   bin_dir: ~/opt/MIDAS/FF_HEDM/bin
//!   utils_dir: ~/opt/MIDAS/utils
//!   python: python
//!   library_root: ~/.MIDAS
//! ```
//!
//! - `machine`: one of `local`, `orthrosnew`, `orthrosall`, `umich`, `marquette` or
//! `purdue`. It decides how many blocks a parallel stage is split into and how many
//! workers each block may use.
//! - `n_nodes`: overrides the block count of the `umich`, `marquette` and `purdue` profiles.
//! - `failure_policy`: `abort_layer` stops the run at the first failed stage, `continue`
//! logs the failure and goes on with the next stage of the layer.
//! - `retries`: how many times a block whose program exits non-zero is run again.
//!
//! ## Output
//!
//! ```text
//! <result_folder>
//! |---- output/ff_runner.log
//! |---- LayerNr_1
//! |    |---- <dataset>.MIDAS.zip
//! |    |---- output/<stage>_out<block>.csv, <stage>_err<block>.csv
//! |    |---- Temp/
//! |    |---- hkls.csv, SpotsToIndex.csv, paramstest.txt, Grains.csv, ...
//! |---- LayerNr_2
//! ```
//!
//! The binning stage writes `*.bin` files into the shared-memory scratch directory. They
//! are removed once refinement has finished, when a layer fails, and when the run is
//! interrupted.
pub mod backend;
pub mod block;
pub mod config;
pub mod constants;
pub mod dataset;
pub mod error;
pub mod installation;
pub mod interrupt;
pub mod layer;
pub mod params;
pub mod process;
pub mod scratch;
pub mod stage;
pub mod worker_status;

#[cfg(all(test, unix))]
mod test_utils;
