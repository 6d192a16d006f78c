// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Directory-backed config store: one record file per VM.

use std::fs;
use std::path::PathBuf;

use bridle::store::{ConfigStore, StoreError};
use bridle_config::VmConfig;
use bridle_types::VmId;

pub struct DirConfigStore {
    dir: PathBuf,
}

impl DirConfigStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path(&self, vmid: VmId) -> PathBuf {
        self.dir.join(format!("{}.conf", vmid))
    }
}

impl ConfigStore for DirConfigStore {
    fn read(&self, vmid: VmId) -> Result<VmConfig, StoreError> {
        let text = match fs::read_to_string(self.path(vmid)) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(vmid))
            }
            Err(e) => return Err(e.into()),
        };
        VmConfig::parse(&text)
            .map_err(|source| StoreError::Parse { vmid, source })
    }

    fn write(&self, vmid: VmId, config: &VmConfig) -> Result<(), StoreError> {
        // write-then-rename keeps a crash from leaving a torn record
        let tmp = self.dir.join(format!(".{}.conf.tmp", vmid));
        fs::write(&tmp, config.print())?;
        fs::rename(&tmp, self.path(vmid))?;
        Ok(())
    }

    fn exists(&self, vmid: VmId) -> bool {
        self.path(vmid).exists()
    }
}
