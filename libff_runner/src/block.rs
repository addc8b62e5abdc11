use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use super::error::BlockTaskError;

/// One partition of a stage's work: `index` of `count`, with `workers` threads inside
/// the native binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block {
    pub index: usize,
    pub count: usize,
    pub workers: usize,
}

impl Block {
    /// The only block of a stage that is not partitioned
    pub fn single(workers: usize) -> Self {
        Self {
            index: 0,
            count: 1,
            workers,
        }
    }

    /// All blocks of a partitioned stage, in submission order
    pub fn partition(count: usize, workers: usize) -> impl Iterator<Item = Block> {
        (0..count).map(move |index| Self {
            index,
            count,
            workers,
        })
    }
}

/// A fully described invocation of a native binary over one block.
///
/// The task owns everything the process needs so that it can be handed to a worker
/// thread: the program, its positional arguments, the environment and where the two
/// log streams go.
#[derive(Debug, Clone)]
pub struct BlockTask {
    pub log_stem: &'static str,
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub block: Block,
    pub working_dir: Option<PathBuf>,
    pub log_dir: PathBuf,
    pub env: Vec<(OsString, OsString)>,
}

impl BlockTask {
    pub fn new(log_stem: &'static str, program: PathBuf, block: Block, log_dir: &Path) -> Self {
        Self {
            log_stem,
            program,
            args: Vec::new(),
            block,
            working_dir: None,
            log_dir: log_dir.to_path_buf(),
            env: Vec::new(),
        }
    }

    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn working_dir(mut self, dir: &Path) -> Self {
        self.working_dir = Some(dir.to_path_buf());
        self
    }

    pub fn envs(mut self, env: Vec<(OsString, OsString)>) -> Self {
        self.env = env;
        self
    }

    /// `<log_dir>/<stem>_out<index>.csv`
    pub fn stdout_log(&self) -> PathBuf {
        self.log_dir
            .join(format!("{}_out{}.csv", self.log_stem, self.block.index))
    }

    /// `<log_dir>/<stem>_err<index>.csv`
    pub fn stderr_log(&self) -> PathBuf {
        self.log_dir
            .join(format!("{}_err{}.csv", self.log_stem, self.block.index))
    }

    /// Run the task in this process
    pub fn run(&self) -> Result<BlockOutcome, BlockTaskError> {
        self.run_with_launcher(&[])
    }

    /// Run the task, optionally prefixed by a launcher command (e.g. `srun ...`).
    ///
    /// Both log files are truncated first. The exit status is returned as-is; deciding
    /// what a non-zero code means is the caller's job.
    pub fn run_with_launcher(&self, launcher: &[OsString]) -> Result<BlockOutcome, BlockTaskError> {
        let stdout_path = self.stdout_log();
        let stderr_path = self.stderr_log();
        let stdout = create_log(&stdout_path)?;
        let stderr = create_log(&stderr_path)?;

        let mut command = match launcher.split_first() {
            Some((launch_program, launch_args)) => {
                let mut cmd = Command::new(launch_program);
                cmd.args(launch_args).arg(&self.program);
                cmd
            }
            None => Command::new(&self.program),
        };
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        log::debug!(
            "Launching {} block {}/{}: {:?} {:?}",
            self.log_stem,
            self.block.index,
            self.block.count,
            self.program,
            self.args
        );

        let mut child = command.spawn().map_err(|source| BlockTaskError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        let status = child.wait().map_err(|source| BlockTaskError::Wait {
            program: self.program.clone(),
            source,
        })?;

        Ok(BlockOutcome {
            block: self.block,
            exit_code: status.code(),
            stdout_log: stdout_path,
            stderr_log: stderr_path,
            attempts: 1,
        })
    }
}

fn create_log(path: &Path) -> Result<File, BlockTaskError> {
    File::create(path).map_err(|source| BlockTaskError::LogFile {
        path: path.to_path_buf(),
        source,
    })
}

/// What a finished block reports back through the fan-in barrier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockOutcome {
    pub block: Block,
    /// None when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
    pub attempts: u32,
}

impl BlockOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Human readable reason for a failed block, including the tail of its error log
    pub fn failure_reason(&self) -> String {
        let status = match self.exit_code {
            Some(code) => format!("exited with status {code}"),
            None => String::from("was terminated by a signal"),
        };
        match last_line(&self.stderr_log) {
            Some(line) => format!("{status} ({line})"),
            None => status,
        }
    }

    /// Last non-empty line the binary wrote to stdout
    pub fn last_stdout_line(&self) -> Option<String> {
        last_line(&self.stdout_log)
    }
}

fn last_line(path: &Path) -> Option<String> {
    let file = File::open(path).ok()?;
    BufReader::new(file)
        .lines()
        .map_while(Result::ok)
        .filter(|line| !line.trim().is_empty())
        .last()
}
