// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The storage subsystem boundary.
//!
//! Volume lifecycles are owned elsewhere; this crate only resolves,
//! activates, and snapshots volumes through this trait. Implementations
//! are expected to be cheap enough to call synchronously from the
//! operation paths.

use std::path::PathBuf;

use bridle_config::devspec::VolumeRef;
use bridle_types::{ByteQty, VmId};
use thiserror::Error;

#[derive(Clone, Debug, Error)]
pub enum VolumeError {
    #[error("volume {0} does not exist")]
    NotFound(VolumeRef),

    #[error("storage operation on {volume} failed: {msg}")]
    Storage { volume: VolumeRef, msg: String },

    #[error("storage pool {0:?} is not usable: {1}")]
    Pool(String, String),
}

pub trait VolumeManager: Send + Sync {
    /// Resolve a volume reference to the host path backing it.
    fn resolve_path(
        &self,
        vmid: VmId,
        volume: &VolumeRef,
    ) -> Result<PathBuf, VolumeError>;

    /// Allocate a fresh volume of `size` in the named pool.
    fn allocate(
        &self,
        pool: &str,
        vmid: VmId,
        format: &str,
        size: ByteQty,
        name: Option<&str>,
    ) -> Result<VolumeRef, VolumeError>;

    /// Destroy a volume and its backing data.
    fn free(&self, vmid: VmId, volume: &VolumeRef) -> Result<(), VolumeError>;

    fn activate(
        &self,
        vmid: VmId,
        volumes: &[VolumeRef],
    ) -> Result<(), VolumeError>;

    fn deactivate(
        &self,
        vmid: VmId,
        volumes: &[VolumeRef],
    ) -> Result<(), VolumeError>;

    /// Take a storage-level snapshot of one volume.
    fn snapshot(
        &self,
        vmid: VmId,
        volume: &VolumeRef,
        snap: &str,
    ) -> Result<(), VolumeError>;

    fn delete_snapshot(
        &self,
        vmid: VmId,
        volume: &VolumeRef,
        snap: &str,
    ) -> Result<(), VolumeError>;

    /// Roll one volume back to a previously taken snapshot.
    fn rollback_snapshot(
        &self,
        vmid: VmId,
        volume: &VolumeRef,
        snap: &str,
    ) -> Result<(), VolumeError>;

    fn volume_size(
        &self,
        vmid: VmId,
        volume: &VolumeRef,
    ) -> Result<ByteQty, VolumeError>;
}
