use std::path::{Path, PathBuf};

/// Container binaries directory, relative to the container directory.
const BIN_DIR: &str = "bin";
/// Per-process daemon directories, relative to the container directory.
const PROCESSES_DIR: &str = "processes";

/// Paths inside one container's depot directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerPaths {
    dir: PathBuf,
}

impl ContainerPaths {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.dir.join(BIN_DIR)
    }

    pub fn iodaemon(&self) -> PathBuf {
        self.bin_dir().join("iodaemon")
    }

    pub fn wsh(&self) -> PathBuf {
        self.bin_dir().join("wsh")
    }

    /// Socket of the in-container shell daemon: `run/wshd.sock`.
    pub fn wshd_socket(&self) -> PathBuf {
        self.dir.join("run").join("wshd.sock")
    }

    /// Directory for one process: `processes/<id>/`.
    pub fn process_dir(&self, id: &str) -> PathBuf {
        self.dir.join(PROCESSES_DIR).join(id)
    }

    pub fn process_socket(&self, id: &str) -> PathBuf {
        self.process_dir(id).join("iodaemon.sock")
    }

    /// PID file written by `wsh` for a namespaced process.
    pub fn pid_file(&self, id: &str) -> PathBuf {
        self.process_dir(id).join("ps.pid")
    }
}
