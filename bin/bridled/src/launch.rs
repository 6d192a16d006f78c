// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Process launching, signalling, and host capability probes.

use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use bridle::compile::HostCaps;
use bridle::process::{CgroupLimits, Launcher, ProcessError, RunPaths};
use bridle_types::{HypervisorVersion, VmId};

const PIDFILE_WAIT: Duration = Duration::from_secs(10);

pub struct OsLauncher {
    emulator: PathBuf,
    run_dir: PathBuf,
}

impl OsLauncher {
    pub fn new(emulator: PathBuf, run_dir: PathBuf) -> Self {
        Self { emulator, run_dir }
    }

    /// Best-effort cgroup v2 assignment; hosts without a writable
    /// hierarchy just run unconstrained.
    fn apply_limits(vmid: VmId, pid: u32, limits: &CgroupLimits) {
        let group =
            PathBuf::from(format!("/sys/fs/cgroup/bridle/{}", vmid));
        if std::fs::create_dir_all(&group).is_err() {
            return;
        }
        if let Some(shares) = limits.cpu_shares {
            let _ =
                std::fs::write(group.join("cpu.weight"), shares.to_string());
        }
        if let Some(quota) = limits.cpu_quota {
            let period = 100_000u64;
            let max = (quota * period as f64) as u64;
            let _ = std::fs::write(
                group.join("cpu.max"),
                format!("{} {}", max, period),
            );
        }
        let _ = std::fs::write(group.join("cgroup.procs"), pid.to_string());
    }
}

impl Launcher for OsLauncher {
    fn spawn(
        &self,
        vmid: VmId,
        argv: &[String],
        env: &[(String, String)],
        umask: u32,
        limits: &CgroupLimits,
    ) -> Result<u32, ProcessError> {
        let paths = RunPaths::new(&self.run_dir, vmid);
        let mut command = Command::new(&self.emulator);
        command.args(argv);
        for (key, value) in env {
            command.env(key, value);
        }
        unsafe {
            command.pre_exec(move || {
                libc::umask(umask as libc::mode_t);
                Ok(())
            });
        }
        let mut child =
            command.spawn().map_err(ProcessError::Spawn)?;
        // the emulator daemonizes; its foreground half exits once the
        // daemon is up and the pidfile written
        let status = child.wait().map_err(ProcessError::Spawn)?;
        if !status.success() {
            return Err(ProcessError::EarlyExit(format!(
                "forking emulator exited with {}",
                status
            )));
        }
        let deadline = Instant::now() + PIDFILE_WAIT;
        let pid = loop {
            if let Some(pid) = read_pidfile(&paths.pidfile) {
                break pid;
            }
            if Instant::now() >= deadline {
                return Err(ProcessError::NoPidfile(vmid));
            }
            std::thread::sleep(Duration::from_millis(100));
        };
        Self::apply_limits(vmid, pid, limits);
        Ok(pid)
    }

    fn alive(&self, pid: u32) -> bool {
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    fn terminate(&self, pid: u32) -> Result<(), ProcessError> {
        signal(pid, libc::SIGTERM)
    }

    fn kill(&self, pid: u32) -> Result<(), ProcessError> {
        signal(pid, libc::SIGKILL)
    }
}

fn signal(pid: u32, sig: libc::c_int) -> Result<(), ProcessError> {
    let rv = unsafe { libc::kill(pid as libc::pid_t, sig) };
    if rv == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    // already gone is what every caller wants anyway
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(ProcessError::Signal { pid, source: err })
}

fn read_pidfile(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Probe the host's logical CPU count and virtualization support.
pub fn probe_host() -> HostCaps {
    let logical_cpus = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1);
    HostCaps {
        logical_cpus,
        hw_virt: Path::new("/dev/kvm").exists(),
    }
}

/// Probe the installed emulator's version from its banner.
pub fn probe_version(
    emulator: &Path,
) -> anyhow::Result<HypervisorVersion> {
    let output = Command::new(emulator).arg("--version").output()?;
    let banner = String::from_utf8_lossy(&output.stdout);
    Ok(HypervisorVersion::from_banner(&banner)?)
}
