// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The config store boundary and the advisory per-VM file lock.
//!
//! The store is the only shared mutable state in the system. Operations
//! re-read the config after every lock acquisition and never carry a copy
//! across a re-lock point, so whatever another node wrote in between is
//! always observed.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bridle_config::record::RecordError;
use bridle_config::VmConfig;
use bridle_types::VmId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no configuration for VM {0}")]
    NotFound(VmId),

    #[error("reading configuration for VM {vmid}: {source}")]
    Parse {
        vmid: VmId,
        #[source]
        source: RecordError,
    },

    #[error("config store I/O: {0}")]
    Io(#[from] io::Error),
}

pub trait ConfigStore: Send + Sync {
    fn read(&self, vmid: VmId) -> Result<VmConfig, StoreError>;
    fn write(&self, vmid: VmId, config: &VmConfig) -> Result<(), StoreError>;
    fn exists(&self, vmid: VmId) -> bool;
}

#[derive(Debug, Error)]
pub enum LockError {
    /// Another operation holds the lock; callers decide whether to wait
    /// longer or give up.
    #[error("VM {0} is busy: another operation holds its lock")]
    Busy(VmId),

    #[error("acquiring lock for VM {0}: {1}")]
    Io(VmId, #[source] io::Error),
}

const LOCK_POLL: Duration = Duration::from_millis(100);

/// An advisory flock over a per-VM lock file, held for the duration of a
/// critical section. Released on drop.
#[derive(Debug)]
pub struct VmLockFile {
    file: File,
    path: PathBuf,
}

impl VmLockFile {
    /// Blocking acquire with a bounded wait; [`LockError::Busy`] after the
    /// timeout rather than hanging.
    pub fn acquire(
        lock_dir: &Path,
        vmid: VmId,
        timeout: Duration,
    ) -> Result<Self, LockError> {
        let path = lock_dir.join(format!("lock-{}.conf", vmid));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| LockError::Io(vmid, e))?;
        let deadline = Instant::now() + timeout;
        loop {
            let rv = unsafe {
                libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB)
            };
            if rv == 0 {
                return Ok(Self { file, path });
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EWOULDBLOCK) {
                return Err(LockError::Io(vmid, err));
            }
            if Instant::now() >= deadline {
                return Err(LockError::Busy(vmid));
            }
            std::thread::sleep(LOCK_POLL.min(
                deadline.saturating_duration_since(Instant::now()),
            ));
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for VmLockFile {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}
