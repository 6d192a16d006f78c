// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The hypervisor process boundary.
//!
//! The spawned emulator daemonizes and writes its own pidfile; control
//! traffic goes over the monitor socket afterwards. This module only
//! defines the launch/signal seam and the well-known runtime paths derived
//! from a VM id.

use std::io;
use std::path::{Path, PathBuf};

use bridle_types::VmId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("spawning hypervisor process: {0}")]
    Spawn(#[source] io::Error),

    #[error("hypervisor process exited during startup: {0}")]
    EarlyExit(String),

    #[error("no pidfile appeared for VM {0}")]
    NoPidfile(VmId),

    #[error("signalling pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

/// Resource-controller limits applied to the spawned process.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CgroupLimits {
    /// Relative CPU weight (`cpuunits`).
    pub cpu_shares: Option<u32>,
    /// Absolute CPU cap in cores (`cpulimit`); fractional values allowed.
    pub cpu_quota: Option<f64>,
}

pub trait Launcher: Send + Sync {
    /// Spawn the emulator. It daemonizes itself; the returned pid is read
    /// back from its pidfile.
    fn spawn(
        &self,
        vmid: VmId,
        argv: &[String],
        env: &[(String, String)],
        umask: u32,
        limits: &CgroupLimits,
    ) -> Result<u32, ProcessError>;

    fn alive(&self, pid: u32) -> bool;

    /// SIGTERM.
    fn terminate(&self, pid: u32) -> Result<(), ProcessError>;

    /// SIGKILL.
    fn kill(&self, pid: u32) -> Result<(), ProcessError>;
}

/// The well-known runtime file layout for one VM under the run directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunPaths {
    pub pidfile: PathBuf,
    pub qmp_socket: PathBuf,
    pub qga_socket: PathBuf,
    pub vnc_socket: PathBuf,
    pub serial_socket: PathBuf,
}

impl RunPaths {
    pub fn new(run_dir: &Path, vmid: VmId) -> Self {
        let base = |ext: &str| run_dir.join(format!("{}.{}", vmid, ext));
        Self {
            pidfile: base("pid"),
            qmp_socket: base("qmp"),
            qga_socket: base("qga"),
            vnc_socket: base("vnc"),
            serial_socket: base("serial"),
        }
    }

    /// Transient files to clear away after the instance is gone.
    pub fn sockets(&self) -> Vec<PathBuf> {
        vec![
            self.qmp_socket.clone(),
            self.qga_socket.clone(),
            self.vnc_socket.clone(),
            self.serial_socket.clone(),
        ]
    }
}
