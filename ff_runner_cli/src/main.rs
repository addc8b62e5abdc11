use clap::{Arg, ArgAction, ArgMatches, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use indicatif_log_bridge::LogWrapper;
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc;

use libff_runner::backend::ExecutionProfile;
use libff_runner::config::{Config, FailurePolicy};
use libff_runner::constants::{DEFAULT_N_CPUS, RUNNER_LOG_FILE};
use libff_runner::error::ConfigError;
use libff_runner::interrupt::install_interrupt_handler;
use libff_runner::process::process;
use libff_runner::scratch::SharedScratch;
use libff_runner::worker_status::LayerStatus;

/// Integer flag value meaning "not set"
const DISABLED: i64 = -1;

fn make_template_config(path: &Path) -> Result<(), ConfigError> {
    let yaml_str = serde_yaml::to_string(&Config::default())?;
    let mut file = File::create(path)?;
    file.write_all(yaml_str.as_bytes())?;
    Ok(())
}

fn build_cli() -> Command {
    let profiles = ExecutionProfile::ALL.map(|p| p.name());
    Command::new("ff_runner_cli")
        .about("Run the MIDAS far-field HEDM pipeline over a range of layers")
        .subcommand(
            Command::new("new")
                .about("Make a template configuration yaml file")
                .arg(
                    Arg::new("path")
                        .short('p')
                        .long("path")
                        .required(true)
                        .value_parser(clap::value_parser!(PathBuf))
                        .help("Path to the file"),
                ),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_parser(clap::value_parser!(PathBuf))
                .help("Load all settings from a YAML configuration file"),
        )
        .arg(
            Arg::new("resultFolder")
                .long("resultFolder")
                .default_value("")
                .value_parser(clap::value_parser!(PathBuf))
                .help("Folder where you want to save results"),
        )
        .arg(
            Arg::new("paramFN")
                .long("paramFN")
                .value_parser(clap::value_parser!(PathBuf))
                .help("Parameter file name"),
        )
        .arg(
            Arg::new("dataFN")
                .long("dataFN")
                .value_parser(clap::value_parser!(PathBuf))
                .help("Data file name"),
        )
        .arg(
            Arg::new("nCPUs")
                .long("nCPUs")
                .default_value("10")
                .value_parser(clap::value_parser!(usize))
                .help("Number of CPU cores to use if running locally"),
        )
        .arg(
            Arg::new("machineName")
                .long("machineName")
                .default_value("local")
                .value_parser(clap::builder::PossibleValuesParser::new(profiles))
                .help("Machine name for execution"),
        )
        .arg(
            Arg::new("numFrameChunks")
                .long("numFrameChunks")
                .default_value("-1")
                .allow_negative_numbers(true)
                .value_parser(clap::value_parser!(i64).range(DISABLED..))
                .help("Number of chunks to use when reading the data file if RAM is smaller than expanded data. -1 will disable"),
        )
        .arg(
            Arg::new("preProcThresh")
                .long("preProcThresh")
                .default_value("-1")
                .allow_negative_numbers(true)
                .value_parser(clap::value_parser!(i64).range(DISABLED..))
                .help("If want to save the dark corrected data, then put to whatever threshold wanted above dark. -1 will disable"),
        )
        .arg(
            Arg::new("nNodes")
                .long("nNodes")
                .default_value("-1")
                .allow_negative_numbers(true)
                .value_parser(clap::value_parser!(i64).range(DISABLED..))
                .help("Number of nodes for execution, omit if want to automatically select"),
        )
        .arg(
            Arg::new("startLayerNr")
                .long("startLayerNr")
                .default_value("1")
                .value_parser(clap::value_parser!(u32))
                .help("Start LayerNr to process"),
        )
        .arg(
            Arg::new("endLayerNr")
                .long("endLayerNr")
                .default_value("1")
                .value_parser(clap::value_parser!(u32))
                .help("End LayerNr to process"),
        )
        .arg(
            Arg::new("convertFiles")
                .long("convertFiles")
                .default_value("1")
                .value_parser(clap::value_parser!(u8).range(0..=1))
                .help("If want to convert to zarr, if zarr files exist already, put to 0"),
        )
        .arg(
            Arg::new("continueOnFailure")
                .long("continueOnFailure")
                .action(ArgAction::SetTrue)
                .help("Keep going with the next stage when a stage fails"),
        )
}

/// `-1` means "not set". Anything below it is rejected by the parser.
fn unless_disabled<T: TryFrom<i64>>(value: i64) -> Option<T> {
    if value == DISABLED {
        None
    } else {
        T::try_from(value).ok()
    }
}

fn config_from_matches(matches: &ArgMatches) -> Result<Config, ConfigError> {
    if let Some(path) = matches.get_one::<PathBuf>("config") {
        let mut config = Config::read_config_file(path)?;
        if matches.get_flag("continueOnFailure") {
            config.failure_policy = FailurePolicy::Continue;
        }
        return Ok(config);
    }

    let machine: ExecutionProfile = matches
        .get_one::<String>("machineName")
        .map(String::as_str)
        .unwrap_or("local")
        .parse()?;
    let number = |id: &str| matches.get_one::<i64>(id).copied().unwrap_or(DISABLED);

    Ok(Config {
        result_folder: matches
            .get_one::<PathBuf>("resultFolder")
            .cloned()
            .unwrap_or_default(),
        param_file: matches.get_one::<PathBuf>("paramFN").cloned(),
        data_file: matches.get_one::<PathBuf>("dataFN").cloned(),
        n_cpus: matches
            .get_one::<usize>("nCPUs")
            .copied()
            .unwrap_or(DEFAULT_N_CPUS),
        machine,
        n_nodes: unless_disabled(number("nNodes")),
        n_frame_chunks: unless_disabled(number("numFrameChunks")),
        pre_proc_thresh: unless_disabled(number("preProcThresh")),
        start_layer: matches.get_one::<u32>("startLayerNr").copied().unwrap_or(1),
        end_layer: matches.get_one::<u32>("endLayerNr").copied().unwrap_or(1),
        convert_files: matches.get_one::<u8>("convertFiles").copied().unwrap_or(1) == 1,
        failure_policy: if matches.get_flag("continueOnFailure") {
            FailurePolicy::Continue
        } else {
            FailurePolicy::AbortLayer
        },
        ..Default::default()
    })
}

fn init_logging(log_path: &Path, pb_manager: &MultiProgress) -> Result<(), String> {
    let log_file = File::create(log_path).map_err(|e| format!("{log_path:?}: {e}"))?;
    let logger = simplelog::CombinedLogger::new(vec![
        simplelog::TermLogger::new(
            simplelog::LevelFilter::Info,
            simplelog::Config::default(),
            simplelog::TerminalMode::Mixed,
            simplelog::ColorChoice::Auto,
        ),
        simplelog::WriteLogger::new(
            simplelog::LevelFilter::Info,
            simplelog::Config::default(),
            log_file,
        ),
    ]);

    LogWrapper::new(pb_manager.clone(), logger)
        .try_init()
        .map_err(|e| e.to_string())?;
    log::set_max_level(log::LevelFilter::Info);
    Ok(())
}

fn layer_bar(pb_manager: &MultiProgress, status: &LayerStatus) -> ProgressBar {
    let style = ProgressStyle::default_bar()
        .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    let pb = pb_manager.add(ProgressBar::new(status.steps_total as u64));
    pb.set_style(style);
    pb
}

fn main() {
    // Create a cli
    let cli = build_cli();
    let matches = cli.clone().get_matches();

    if let Some(("new", sub_matches)) = matches.subcommand() {
        let Some(path) = sub_matches.get_one::<PathBuf>("path") else {
            std::process::exit(2);
        };
        println!("Making a template config at {}...", path.to_string_lossy());
        if let Err(e) = make_template_config(path) {
            eprintln!("{e}");
            std::process::exit(1);
        }
        println!("Done.");
        return;
    }

    let config = match config_from_matches(&matches) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    // Nothing to do; say how to use us before anything touches the disk
    if !config.has_input() {
        eprintln!("{}", cli.clone().render_help());
        std::process::exit(1);
    }

    let log_dir = match config.get_log_directory() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("Could not create log directory {log_dir:?}: {e}");
        std::process::exit(1);
    }

    // Initialize feedback
    let pb_manager = MultiProgress::new();
    if let Err(e) = init_logging(&log_dir.join(RUNNER_LOG_FILE), &pb_manager) {
        eprintln!("Could not create logging/progress: {e}");
        std::process::exit(1);
    }

    let scratch = SharedScratch::new(&config.get_scratch_directory());
    if let Err(e) = install_interrupt_handler(scratch) {
        log::warn!("Could not install interrupt handler, scratch will not be cleared on Ctrl-C: {e}");
    }

    log::info!("Result Folder: {}", log_dir.parent().unwrap_or(&log_dir).display());
    if let Some(path) = &config.param_file {
        log::info!("Parameter File: {}", path.to_string_lossy());
    }
    if let Some(path) = &config.data_file {
        log::info!("Data File: {}", path.to_string_lossy());
    }
    log::info!(
        "First Layer: {} Last Layer: {}",
        config.start_layer,
        config.end_layer
    );
    log::info!("Machine: {} CPUs: {}", config.machine, config.n_cpus);
    log::info!("Convert Files: {}", config.convert_files);

    // Spawn the task!
    let (tx, rx) = mpsc::channel::<LayerStatus>();
    let handle = std::thread::spawn(move || process(&config, tx));

    let mut bars: HashMap<u32, ProgressBar> = HashMap::new();
    // The sender is dropped when the driver returns, which ends this loop
    for status in rx.iter() {
        let pb = bars
            .entry(status.layer_nr)
            .or_insert_with(|| layer_bar(&pb_manager, &status));
        pb.set_position(status.steps_done as u64);
        pb.set_message(format!("Layer {} {}", status.layer_nr, status.stage));
        if status.steps_done >= status.steps_total {
            pb.finish();
        }
    }

    let success = match handle.join() {
        Ok(result) => match result {
            Ok(reports) => {
                let failed: usize = reports.iter().map(|r| r.failures.len()).sum();
                if failed > 0 {
                    log::warn!("Finished {} layer(s) with {failed} failed stage(s)", reports.len());
                } else {
                    log::info!("Successfully processed {} layer(s)!", reports.len());
                }
                true
            }
            Err(e) => {
                log::error!("Processing failed with error: {e}");
                false
            }
        },
        Err(_) => {
            log::error!("Failed to join processing task!");
            false
        }
    };

    for pb in bars.values() {
        if !pb.is_finished() {
            pb.abandon();
        }
    }

    if !success {
        std::process::exit(1);
    }
    log::info!("Done.");
}
