// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Snapshot create, delete, and rollback.
//!
//! Each operation is a three-phase commit: *prepare* stamps the intent
//! into the config under the file lock, the *data phase* touches storage
//! and the instance outside the lock, and *commit* finalizes under the
//! lock again. Crashing between phases leaves a persisted `snapstate`
//! tag, which a later delete recognizes and cleans up instead of failing
//! on. A failed create deletes exactly the per-drive snapshots it already
//! took before re-raising.

use bridle_config::devspec::VolumeRef;
use bridle_config::record::{valid_snapshot_name, SnapState, SnapshotRegion};
use bridle_config::OperationLock;
use bridle_types::ByteQty;
use chrono::Utc;
use slog::warn;

use crate::monitor::Mon;

use super::{drives_of, LifecycleError, VmManager};

impl VmManager<'_> {
    /// Create a snapshot, optionally saving the running guest's memory
    /// state into a dedicated volume.
    pub async fn snapshot_create(
        &self,
        name: &str,
        with_vmstate: bool,
    ) -> Result<(), LifecycleError> {
        if !valid_snapshot_name(name) {
            return Err(LifecycleError::BadSnapshotName(name.to_string()));
        }

        // prepare: clone the active region into the named slot
        let (running, vmstate_volume) = {
            let _flock = self.flock()?;
            let mut cfg = self.read_fresh()?;
            self.check_lock(&cfg, false)?;
            if cfg.snapshots.contains_key(name) {
                return Err(LifecycleError::SnapshotExists(
                    name.to_string(),
                ));
            }
            let running = self.running().await;
            let mut snap = SnapshotRegion {
                parent: cfg.parent.clone(),
                snaptime: Some(Utc::now().timestamp()),
                vmstate: None,
                snapstate: Some(SnapState::Prepare),
                runningmachine: running.then(|| {
                    cfg.active
                        .get("machine")
                        .cloned()
                        .unwrap_or_else(|| self.defaults.machine.to_string())
                }),
                options: cfg.active.clone(),
            };
            let vmstate_volume = if with_vmstate && running {
                let pool = self.state_pool(&cfg)?;
                let memory_mib = cfg
                    .active
                    .get("memory")
                    .and_then(|m| m.parse::<u64>().ok())
                    .unwrap_or(self.defaults.memory_mib);
                let volume = self.volumes.allocate(
                    &pool,
                    self.vmid,
                    "raw",
                    ByteQty::from_mib(memory_mib + memory_mib / 10 + 32),
                    Some(&format!("vm-{}-state-{}", self.vmid, name)),
                )?;
                snap.vmstate = Some(volume.to_string());
                Some(volume)
            } else {
                None
            };
            cfg.lock = Some(OperationLock::Snapshot);
            cfg.snapshots.insert(name.to_string(), snap);
            self.store.write(self.vmid, &cfg)?;
            (running, vmstate_volume)
        };

        // data phase, outside the lock
        match self
            .snapshot_data_phase(name, running, vmstate_volume.as_ref())
            .await
        {
            Ok(()) => {
                let _flock = self.flock()?;
                let mut cfg = self.read_fresh()?;
                if let Some(snap) = cfg.snapshots.get_mut(name) {
                    snap.snapstate = None;
                }
                cfg.parent = Some(name.to_string());
                cfg.lock = None;
                self.store.write(self.vmid, &cfg)?;
                Ok(())
            }
            Err((err, taken)) => {
                // undo exactly the per-drive snapshots already taken
                for volume in &taken {
                    if let Err(e) =
                        self.volumes.delete_snapshot(self.vmid, volume, name)
                    {
                        warn!(self.log, "undo of drive snapshot failed";
                            "volume" => %volume, "error" => %e);
                    }
                }
                if let Some(volume) = &vmstate_volume {
                    if let Err(e) = self.volumes.free(self.vmid, volume) {
                        warn!(self.log, "undo of state volume failed";
                            "volume" => %volume, "error" => %e);
                    }
                }
                let _flock = self.flock()?;
                let mut cfg = self.read_fresh()?;
                cfg.snapshots.remove(name);
                cfg.lock = None;
                self.store.write(self.vmid, &cfg)?;
                Err(err)
            }
        }
    }

    /// Save memory state (when asked) and snapshot every non-cdrom drive,
    /// accumulating the volumes done so far so the caller can undo them.
    async fn snapshot_data_phase(
        &self,
        name: &str,
        running: bool,
        vmstate: Option<&VolumeRef>,
    ) -> Result<(), (LifecycleError, Vec<VolumeRef>)> {
        let mut taken = Vec::new();
        let cfg = match self.read_fresh() {
            Ok(cfg) => cfg,
            Err(err) => return Err((err, taken)),
        };
        if running {
            if let Some(volume) = vmstate {
                let path =
                    match self.volumes.resolve_path(self.vmid, volume) {
                        Ok(path) => path,
                        Err(err) => return Err((err.into(), taken)),
                    };
                let mon = Mon(self.monitor);
                if let Err(err) =
                    mon.savevm_start(&path.display().to_string()).await
                {
                    return Err((err.into(), taken));
                }
                if let Err(err) = mon.savevm_end().await {
                    return Err((err.into(), taken));
                }
            }
        }
        let drives = match drives_of(&cfg.active) {
            Ok(drives) => drives,
            Err(err) => return Err((err.into(), taken)),
        };
        for (_, spec) in drives {
            if spec.is_cdrom() {
                continue;
            }
            if let Err(err) =
                self.volumes.snapshot(self.vmid, &spec.volume, name)
            {
                return Err((err.into(), taken));
            }
            taken.push(spec.volume.clone());
        }
        Ok(())
    }

    /// Delete a snapshot. `force` presses on past per-drive errors,
    /// which also makes it the cleanup path for snapshots left with
    /// `snapstate` residue by a crashed operation.
    pub async fn snapshot_delete(
        &self,
        name: &str,
        force: bool,
    ) -> Result<(), LifecycleError> {
        {
            let _flock = self.flock()?;
            let mut cfg = self.read_fresh()?;
            let snap = cfg
                .snapshots
                .get(name)
                .ok_or_else(|| {
                    LifecycleError::NoSuchSnapshot(name.to_string())
                })?;
            // resuming cleanup after a crash mid-snapshot is allowed
            // despite the stale operation lock
            let resuming = snap.snapstate.is_some()
                && matches!(
                    cfg.lock,
                    Some(OperationLock::Snapshot)
                        | Some(OperationLock::SnapshotDelete)
                );
            if !resuming {
                self.check_lock(&cfg, false)?;
            }
            let snap = cfg.snapshots.get_mut(name).expect("checked above");
            snap.snapstate = Some(SnapState::Delete);
            cfg.lock = Some(OperationLock::SnapshotDelete);
            self.store.write(self.vmid, &cfg)?;
        }

        // data phase: release the state volume and per-drive snapshots
        let cfg = self.read_fresh()?;
        let snap = cfg.snapshots.get(name).cloned().unwrap_or_default();
        let mut failure: Option<LifecycleError> = None;
        if let Some(raw) = &snap.vmstate {
            match raw.parse::<VolumeRef>() {
                Ok(volume) => {
                    if let Err(err) = self.volumes.free(self.vmid, &volume)
                    {
                        if force {
                            warn!(self.log, "state volume removal failed";
                                "volume" => %volume, "error" => %err);
                        } else {
                            failure = Some(err.into());
                        }
                    }
                }
                Err(err) => warn!(self.log, "unparseable vmstate";
                    "value" => raw, "error" => %err),
            }
        }
        if failure.is_none() {
            match drives_of(&snap.options) {
                Ok(drives) => {
                    for (_, spec) in drives {
                        if spec.is_cdrom() {
                            continue;
                        }
                        if let Err(err) = self.volumes.delete_snapshot(
                            self.vmid,
                            &spec.volume,
                            name,
                        ) {
                            if force {
                                warn!(self.log,
                                    "drive snapshot removal failed";
                                    "volume" => %spec.volume,
                                    "error" => %err);
                            } else {
                                failure = Some(err.into());
                                break;
                            }
                        }
                    }
                }
                Err(err) => failure = Some(err.into()),
            }
        }

        let _flock = self.flock()?;
        let mut cfg = self.read_fresh()?;
        if let Some(err) = failure {
            // leave the Delete sub-state as detectable residue; only the
            // lock is released so the operator can retry with force
            cfg.lock = None;
            self.store.write(self.vmid, &cfg)?;
            return Err(err);
        }
        let parent =
            cfg.snapshots.get(name).and_then(|s| s.parent.clone());
        for snap in cfg.snapshots.values_mut() {
            if snap.parent.as_deref() == Some(name) {
                snap.parent = parent.clone();
            }
        }
        if cfg.parent.as_deref() == Some(name) {
            cfg.parent = parent;
        }
        cfg.snapshots.remove(name);
        cfg.lock = None;
        self.store.write(self.vmid, &cfg)?;
        Ok(())
    }

    /// Roll the VM back to a snapshot. The instance must be stopped; the
    /// active region becomes a copy of the snapshot's, staged edits are
    /// discarded, and a saved memory state re-arms the suspended-resume
    /// path for the next start.
    pub async fn snapshot_rollback(
        &self,
        name: &str,
    ) -> Result<(), LifecycleError> {
        {
            let _flock = self.flock()?;
            let mut cfg = self.read_fresh()?;
            self.check_lock(&cfg, false)?;
            let snap = cfg.snapshots.get(name).ok_or_else(|| {
                LifecycleError::NoSuchSnapshot(name.to_string())
            })?;
            if let Some(state) = snap.snapstate {
                return Err(LifecycleError::SnapshotBusy {
                    name: name.to_string(),
                    state,
                });
            }
            if self.running().await {
                return Err(LifecycleError::AlreadyRunning);
            }
            cfg.lock = Some(OperationLock::Rollback);
            self.store.write(self.vmid, &cfg)?;
        }

        let cfg = self.read_fresh()?;
        let snap = cfg.snapshots.get(name).cloned().unwrap_or_default();
        let mut failure: Option<LifecycleError> = None;
        match drives_of(&snap.options) {
            Ok(drives) => {
                for (_, spec) in drives {
                    if spec.is_cdrom() {
                        continue;
                    }
                    if let Err(err) = self.volumes.rollback_snapshot(
                        self.vmid,
                        &spec.volume,
                        name,
                    ) {
                        failure = Some(err.into());
                        break;
                    }
                }
            }
            Err(err) => failure = Some(err.into()),
        }

        let _flock = self.flock()?;
        let mut cfg = self.read_fresh()?;
        if let Some(err) = failure {
            cfg.lock = None;
            self.store.write(self.vmid, &cfg)?;
            return Err(err);
        }
        let snap = cfg.snapshots.get(name).cloned().unwrap_or_default();
        cfg.active = snap.options.clone();
        cfg.pending = Default::default();
        cfg.parent = Some(name.to_string());
        cfg.lock = None;
        if let Some(vmstate) = snap.vmstate.clone() {
            cfg.active.insert("vmstate".to_string(), vmstate);
            if let Some(machine) = snap.runningmachine.clone() {
                cfg.active.insert("runningmachine".to_string(), machine);
            }
            // next start resumes from the saved memory state
            cfg.lock = Some(OperationLock::Suspended);
        }
        self.store.write(self.vmid, &cfg)?;
        Ok(())
    }
}
