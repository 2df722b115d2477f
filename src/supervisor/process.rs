use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use sysinfo::System;
use tracing::{error, warn};

use crate::error::{Error, Result};

/// View of the host's running processes.
pub trait ProcessTable: Send + Sync {
    /// PIDs of processes whose executable name is exactly `name`
    fn pids_of(&self, name: &str) -> Vec<u32>;
}

/// Starts the engine in the background.
pub trait Launcher: Send + Sync {
    /// Spawn `executable` detached and return its PID.
    fn launch(&self, executable: &Path, args: &[String]) -> Result<u32>;
}

/// Process table read through sysinfo
pub struct SystemProcessTable {
    system: Mutex<System>,
}

impl SystemProcessTable {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SystemProcessTable {
    fn pids_of(&self, name: &str) -> Vec<u32> {
        let mut system = match self.system.lock() {
            Ok(system) => system,
            Err(poisoned) => poisoned.into_inner(),
        };
        system.refresh_processes();
        system
            .processes_by_exact_name(name)
            .map(|process| process.pid().as_u32())
            .collect()
    }
}

/// Launches through `std::process::Command` with inherited stdio.
///
/// A reaper thread waits on the child so it never lingers as a zombie, and logs how it ended.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandLauncher;

impl Launcher for CommandLauncher {
    fn launch(&self, executable: &Path, args: &[String]) -> Result<u32> {
        let mut child = Command::new(executable)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| Error::ProcessLaunch {
                path: executable.to_path_buf(),
                source,
            })?;

        let pid = child.id();
        let path: PathBuf = executable.to_path_buf();
        std::thread::Builder::new()
            .name("engine-reaper".to_string())
            .spawn(move || match child.wait() {
                Ok(status) => warn!(
                    event = "supervisor:engine:exit",
                    pid,
                    status = %status,
                    "{} exited",
                    path.display()
                ),
                Err(e) => error!(event = "supervisor:engine:wait_error", pid, error = %e, "Failed to wait for engine"),
            })
            .map_err(|source| Error::ProcessLaunch {
                path: executable.to_path_buf(),
                source,
            })?;

        Ok(pid)
    }
}
