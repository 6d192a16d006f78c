// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! File-backed volume manager.
//!
//! Pools are subdirectories under one root; a volume is a raw or qcow2
//! image file inside its pool. Snapshot operations shell out to
//! `qemu-img`, which owns the image formats. Activation is a no-op for
//! plain files.

use std::path::{Path, PathBuf};
use std::process::Command;

use bridle::volume::{VolumeError, VolumeManager};
use bridle_config::devspec::VolumeRef;
use bridle_types::{ByteQty, VmId};

pub struct FileVolumes {
    root: PathBuf,
}

impl FileVolumes {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_of(&self, volume: &VolumeRef) -> PathBuf {
        match volume {
            VolumeRef::Path(p) => PathBuf::from(p),
            VolumeRef::Volume { store, name } => {
                self.root.join(store).join(name)
            }
        }
    }

    fn qemu_img(
        volume: &VolumeRef,
        path: &Path,
        args: &[&str],
    ) -> Result<(), VolumeError> {
        let output = Command::new("qemu-img")
            .args(args)
            .arg(path)
            .output()
            .map_err(|e| VolumeError::Storage {
                volume: volume.clone(),
                msg: format!("running qemu-img: {}", e),
            })?;
        if !output.status.success() {
            return Err(VolumeError::Storage {
                volume: volume.clone(),
                msg: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }
}

impl VolumeManager for FileVolumes {
    fn resolve_path(
        &self,
        _vmid: VmId,
        volume: &VolumeRef,
    ) -> Result<PathBuf, VolumeError> {
        let path = self.path_of(volume);
        if !path.exists() {
            return Err(VolumeError::NotFound(volume.clone()));
        }
        Ok(path)
    }

    fn allocate(
        &self,
        pool: &str,
        vmid: VmId,
        format: &str,
        size: ByteQty,
        name: Option<&str>,
    ) -> Result<VolumeRef, VolumeError> {
        let pool_dir = self.root.join(pool);
        std::fs::create_dir_all(&pool_dir).map_err(|e| {
            VolumeError::Pool(pool.to_string(), e.to_string())
        })?;
        let name = match name {
            Some(name) => name.to_string(),
            None => {
                // first free disk index for this VM
                let mut index = 0;
                while pool_dir
                    .join(format!("vm-{}-disk-{}", vmid, index))
                    .exists()
                {
                    index += 1;
                }
                format!("vm-{}-disk-{}", vmid, index)
            }
        };
        let volume =
            VolumeRef::Volume { store: pool.to_string(), name };
        let path = self.path_of(&volume);
        if path.exists() {
            return Err(VolumeError::Storage {
                volume,
                msg: "volume already exists".to_string(),
            });
        }
        let status = Command::new("qemu-img")
            .arg("create")
            .arg("-f")
            .arg(format)
            .arg(&path)
            .arg(size.bytes().to_string())
            .status()
            .map_err(|e| VolumeError::Storage {
                volume: volume.clone(),
                msg: format!("running qemu-img: {}", e),
            })?;
        if !status.success() {
            return Err(VolumeError::Storage {
                volume,
                msg: "qemu-img create failed".to_string(),
            });
        }
        Ok(volume)
    }

    fn free(&self, _vmid: VmId, volume: &VolumeRef) -> Result<(), VolumeError> {
        match std::fs::remove_file(self.path_of(volume)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VolumeError::Storage {
                volume: volume.clone(),
                msg: e.to_string(),
            }),
        }
    }

    fn activate(
        &self,
        _vmid: VmId,
        _volumes: &[VolumeRef],
    ) -> Result<(), VolumeError> {
        Ok(())
    }

    fn deactivate(
        &self,
        _vmid: VmId,
        _volumes: &[VolumeRef],
    ) -> Result<(), VolumeError> {
        Ok(())
    }

    fn snapshot(
        &self,
        vmid: VmId,
        volume: &VolumeRef,
        snap: &str,
    ) -> Result<(), VolumeError> {
        let path = self.resolve_path(vmid, volume)?;
        Self::qemu_img(volume, &path, &["snapshot", "-c", snap])
    }

    fn delete_snapshot(
        &self,
        vmid: VmId,
        volume: &VolumeRef,
        snap: &str,
    ) -> Result<(), VolumeError> {
        let path = self.resolve_path(vmid, volume)?;
        Self::qemu_img(volume, &path, &["snapshot", "-d", snap])
    }

    fn rollback_snapshot(
        &self,
        vmid: VmId,
        volume: &VolumeRef,
        snap: &str,
    ) -> Result<(), VolumeError> {
        let path = self.resolve_path(vmid, volume)?;
        Self::qemu_img(volume, &path, &["snapshot", "-a", snap])
    }

    fn volume_size(
        &self,
        vmid: VmId,
        volume: &VolumeRef,
    ) -> Result<ByteQty, VolumeError> {
        let path = self.resolve_path(vmid, volume)?;
        let meta = std::fs::metadata(path).map_err(|e| {
            VolumeError::Storage {
                volume: volume.clone(),
                msg: e.to_string(),
            }
        })?;
        Ok(ByteQty::from_bytes(meta.len()))
    }
}
