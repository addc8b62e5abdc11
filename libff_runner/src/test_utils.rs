// Stand-ins for the MIDAS toolchain: every native binary and helper script is a tiny
// shell script that echoes its arguments and leaves behind the files the next stage
// looks for.
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::constants::*;
use crate::installation::{InstallPaths, Installation};

/// Write an executable `/bin/sh` script and return its path
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub struct FakeInstall {
    root: tempfile::TempDir,
}

impl FakeInstall {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let fake = Self { root };
        for dir in [fake.bin(), fake.utils(), fake.scratch()] {
            std::fs::create_dir_all(dir).unwrap();
        }
        std::fs::write(
            fake.param_file(),
            "FileStem scan\nStartFileNrFirstLayer 10\nNrFilesPerSweep 5\n",
        )
        .unwrap();

        let journal = fake.journal();
        let scratch = fake.scratch().to_path_buf();
        let native = |name: &str, extra: &str| {
            let body = format!(
                "echo \"{name} $*\"\necho {name} >> \"{}\"\n{extra}",
                journal.display()
            );
            write_script(&fake.bin(), name, &body);
        };
        native(HKL_BIN, "touch \"$(dirname \"$1\")/hkls.csv\"\n");
        native(PEAKS_BIN, "");
        native(MERGE_BIN, "");
        native(RADIUS_BIN, "");
        native(
            FIT_SETUP_BIN,
            "d=$(dirname \"$1\")\nprintf '1\\n2\\n3\\n' > \"$d/SpotsToIndex.csv\"\ntouch \"$d/paramstest.txt\"\n",
        );
        native(
            BIN_DATA_BIN,
            &format!("touch \"{}/Spots.bin\"\n", scratch.display()),
        );
        native(INDEXER_BIN, "");
        native(REFINER_BIN, "");
        native(GRAINS_BIN, "touch \"$(dirname \"$1\")/Grains.csv\"\n");

        // Run as `/bin/sh <script> args`, so $1 is the first real argument
        write_script(
            &fake.utils(),
            GENERATE_ZIP_SCRIPT,
            "echo \"$@\" > \"$2/convert_args\"\ntouch \"$2/converted.MIDAS.zip\"\necho \"OutputZipName $2/converted.MIDAS.zip\"\n",
        );
        write_script(
            &fake.utils(),
            UPDATE_DSET_SCRIPT,
            "echo \"$@\" > \"$4/update_args\"\n",
        );
        fake
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn bin(&self) -> PathBuf {
        self.root().join("bin")
    }

    pub fn utils(&self) -> PathBuf {
        self.root().join("utils")
    }

    /// Layer directories land directly in the root
    pub fn results(&self) -> &Path {
        self.root.path()
    }

    pub fn scratch(&self) -> PathBuf {
        self.root().join("shm")
    }

    pub fn journal(&self) -> PathBuf {
        self.root().join("journal")
    }

    pub fn param_file(&self) -> PathBuf {
        self.root().join("ps.txt")
    }

    pub fn install_paths(&self) -> InstallPaths {
        InstallPaths {
            bin_dir: self.bin(),
            utils_dir: self.utils(),
            python: PathBuf::from("/bin/sh"),
            library_root: self.root().join("deps"),
        }
    }

    pub fn installation(&self) -> Installation {
        Installation::resolve(&self.install_paths(), &self.results().join(LOG_DIR)).unwrap()
    }

    pub fn config(&self) -> Config {
        Config {
            result_folder: self.results().to_path_buf(),
            param_file: Some(self.param_file()),
            n_cpus: 2,
            scratch_dir: self.scratch(),
            install: self.install_paths(),
            ..Default::default()
        }
    }
}
