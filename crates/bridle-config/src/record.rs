// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The persisted VM configuration record.
//!
//! The record is line-oriented `key: value` text. `#`-prefixed lines before
//! the first section header form a free-text description. A `[PENDING]`
//! header opens the region of edits not yet applied to a running instance,
//! including the `delete:` pseudo-key listing options marked for removal
//! (`!`-prefixed entries destroy backing data on apply). Any other
//! `[name]` header opens a frozen snapshot region with the same option
//! schema plus its bookkeeping keys (`parent`, `snaptime`, `snapstate`,
//! `vmstate`, `runningmachine`).
//!
//! Option keys are validated against the closed schema at parse time, so a
//! typo fails the whole record instead of surfacing as a mystery key much
//! later. `parse(print(config))` yields an identical structure.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::str::FromStr;

use bridle_types::DeviceId;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum RecordError {
    #[error("line {0}: malformed config line {1:?}")]
    Syntax(usize, String),

    #[error("line {0}: unknown option key {1:?}")]
    UnknownKey(usize, String),

    #[error("line {0}: key {1:?} given more than once")]
    DuplicateKey(usize, String),

    #[error("line {0}: section {1:?} declared more than once")]
    DuplicateSection(usize, String),

    #[error("line {0}: invalid section name {1:?}")]
    BadSection(usize, String),

    #[error("line {0}: {1:?} is only valid in the pending section")]
    PendingOnly(usize, &'static str),

    #[error("line {0}: {1:?} is not valid in this section")]
    MisplacedKey(usize, &'static str),

    #[error("invalid value {value:?} for option {key}")]
    Value { key: String, value: String },

    #[error("unknown option key {0:?}")]
    BadKey(String),
}

/// A named mutual-exclusion flag stored in the config itself, hence visible
/// cluster-wide. Orthogonal to the short-lived advisory file lock.
#[derive(
    Clone, Copy, PartialEq, Eq, Debug, strum::EnumString, strum::Display,
)]
pub enum OperationLock {
    #[strum(serialize = "migrate")]
    Migrate,
    #[strum(serialize = "backup")]
    Backup,
    #[strum(serialize = "snapshot")]
    Snapshot,
    #[strum(serialize = "snapshot-delete")]
    SnapshotDelete,
    #[strum(serialize = "rollback")]
    Rollback,
    #[strum(serialize = "suspending")]
    Suspending,
    #[strum(serialize = "suspended")]
    Suspended,
    #[strum(serialize = "create")]
    Create,
    #[strum(serialize = "clone")]
    Clone,
}

/// Mid-operation snapshot sub-state, persisted so crash recovery can
/// pattern-match on exactly where a snapshot operation stopped.
#[derive(
    Clone, Copy, PartialEq, Eq, Debug, strum::EnumString, strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum SnapState {
    Prepare,
    Delete,
}

/// How a pending delete treats the option's backing data when applied.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DeleteMode {
    /// Detach only; backing data stays around.
    Soft,
    /// Destroy backing data on apply.
    Force,
}

pub type OptionMap = BTreeMap<String, String>;

/// Parse an option's value with the target type's `FromStr`.
pub fn typed_opt<T: FromStr>(
    map: &OptionMap,
    key: &str,
) -> Result<Option<T>, RecordError> {
    match map.get(key) {
        None => Ok(None),
        Some(v) => v.parse().map(Some).map_err(|_| RecordError::Value {
            key: key.to_string(),
            value: v.clone(),
        }),
    }
}

/// Edits not yet reconciled with a running instance.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct PendingRegion {
    pub options: OptionMap,
    pub delete: BTreeMap<String, DeleteMode>,
}

impl PendingRegion {
    pub fn is_empty(&self) -> bool {
        self.options.is_empty() && self.delete.is_empty()
    }
}

/// A frozen copy of the active region plus snapshot bookkeeping.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct SnapshotRegion {
    pub parent: Option<String>,
    /// Creation time, unix seconds.
    pub snaptime: Option<i64>,
    /// Volume holding the saved memory state, when one was taken.
    pub vmstate: Option<String>,
    pub snapstate: Option<SnapState>,
    /// Machine profile the instance was running when frozen; rollback pins
    /// the compile to this.
    pub runningmachine: Option<String>,
    pub options: OptionMap,
}

/// The full configuration of one VM.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct VmConfig {
    pub description: String,
    pub lock: Option<OperationLock>,
    /// Parent pointer: the snapshot the active config descends from.
    pub parent: Option<String>,
    pub active: OptionMap,
    pub pending: PendingRegion,
    pub snapshots: BTreeMap<String, SnapshotRegion>,
}

/// Scalar option keys the schema accepts, beyond device identities.
const SCALAR_OPTIONS: &[&str] = &[
    "agent", "args", "balloon", "bios", "boot", "cores", "cpu", "cpulimit",
    "cpuunits", "hotplug", "kvm", "machine", "memory", "name", "numa",
    "onboot", "ostype", "runningmachine", "scsihw", "shares", "sockets",
    "tablet", "vcpus", "vga", "vmstate",
];

fn key_in_schema(key: &str) -> bool {
    SCALAR_OPTIONS.binary_search(&key).is_ok()
        || DeviceId::from_str(key).is_ok()
}

/// Snapshot names share a namespace with section headers, so they are
/// restricted to simple identifiers.
pub fn valid_snapshot_name(name: &str) -> bool {
    !name.is_empty()
        && name != "PENDING"
        && name.chars().next().unwrap().is_ascii_alphanumeric()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn escape_desc(line: &str) -> String {
    line.replace('%', "%25").replace('\r', "%0D")
}

fn unescape_desc(line: &str) -> String {
    line.replace("%0D", "\r").replace("%25", "%")
}

enum Section {
    Active,
    Pending,
    Snapshot(String),
}

impl VmConfig {
    pub fn parse(text: &str) -> Result<Self, RecordError> {
        let mut cfg = VmConfig::default();
        let mut section = Section::Active;
        let mut desc_lines: Vec<String> = Vec::new();

        for (idx, raw_line) in text.lines().enumerate() {
            let lineno = idx + 1;
            let line = raw_line.trim_end();
            if line.trim().is_empty() {
                continue;
            }
            if let Some(desc) = line.strip_prefix('#') {
                if matches!(section, Section::Active) {
                    let desc = desc.strip_prefix(' ').unwrap_or(desc);
                    desc_lines.push(unescape_desc(desc));
                    continue;
                }
                return Err(RecordError::Syntax(lineno, line.to_string()));
            }
            if let Some(name) = line
                .strip_prefix('[')
                .and_then(|rest| rest.strip_suffix(']'))
            {
                section = if name == "PENDING" {
                    if !cfg.pending.is_empty() {
                        return Err(RecordError::DuplicateSection(
                            lineno,
                            name.to_string(),
                        ));
                    }
                    Section::Pending
                } else {
                    if !valid_snapshot_name(name) {
                        return Err(RecordError::BadSection(
                            lineno,
                            name.to_string(),
                        ));
                    }
                    if cfg.snapshots.contains_key(name) {
                        return Err(RecordError::DuplicateSection(
                            lineno,
                            name.to_string(),
                        ));
                    }
                    cfg.snapshots
                        .insert(name.to_string(), SnapshotRegion::default());
                    Section::Snapshot(name.to_string())
                };
                continue;
            }

            let (key, value) = line
                .split_once(':')
                .map(|(k, v)| (k.trim(), v.trim()))
                .ok_or_else(|| {
                    RecordError::Syntax(lineno, line.to_string())
                })?;
            if key.is_empty() || value.is_empty() {
                return Err(RecordError::Syntax(lineno, line.to_string()));
            }

            match &section {
                Section::Active => {
                    Self::parse_active_key(&mut cfg, lineno, key, value)?
                }
                Section::Pending => {
                    Self::parse_pending_key(&mut cfg, lineno, key, value)?
                }
                Section::Snapshot(name) => {
                    let snap = cfg.snapshots.get_mut(name).unwrap();
                    Self::parse_snapshot_key(snap, lineno, key, value)?
                }
            }
        }

        cfg.description = desc_lines.join("\n");
        Ok(cfg)
    }

    fn parse_active_key(
        cfg: &mut VmConfig,
        lineno: usize,
        key: &str,
        value: &str,
    ) -> Result<(), RecordError> {
        match key {
            "lock" => {
                if cfg.lock.is_some() {
                    return Err(RecordError::DuplicateKey(
                        lineno,
                        key.to_string(),
                    ));
                }
                cfg.lock =
                    Some(value.parse().map_err(|_| RecordError::Value {
                        key: key.to_string(),
                        value: value.to_string(),
                    })?);
            }
            "parent" => {
                if cfg.parent.is_some() {
                    return Err(RecordError::DuplicateKey(
                        lineno,
                        key.to_string(),
                    ));
                }
                cfg.parent = Some(value.to_string());
            }
            "delete" => {
                return Err(RecordError::PendingOnly(lineno, "delete"))
            }
            _ => {
                if !key_in_schema(key) {
                    return Err(RecordError::UnknownKey(
                        lineno,
                        key.to_string(),
                    ));
                }
                if cfg
                    .active
                    .insert(key.to_string(), value.to_string())
                    .is_some()
                {
                    return Err(RecordError::DuplicateKey(
                        lineno,
                        key.to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    fn parse_pending_key(
        cfg: &mut VmConfig,
        lineno: usize,
        key: &str,
        value: &str,
    ) -> Result<(), RecordError> {
        if key == "delete" {
            for entry in value.split(',') {
                let entry = entry.trim();
                let (mode, name) = match entry.strip_prefix('!') {
                    Some(name) => (DeleteMode::Force, name),
                    None => (DeleteMode::Soft, entry),
                };
                if !key_in_schema(name) {
                    return Err(RecordError::UnknownKey(
                        lineno,
                        name.to_string(),
                    ));
                }
                cfg.pending.delete.insert(name.to_string(), mode);
                // delete and a pending value are mutually exclusive
                cfg.pending.options.remove(name);
            }
            return Ok(());
        }
        if !key_in_schema(key) {
            return Err(RecordError::UnknownKey(lineno, key.to_string()));
        }
        if cfg.pending.delete.contains_key(key) {
            cfg.pending.delete.remove(key);
        }
        if cfg
            .pending
            .options
            .insert(key.to_string(), value.to_string())
            .is_some()
        {
            return Err(RecordError::DuplicateKey(lineno, key.to_string()));
        }
        Ok(())
    }

    fn parse_snapshot_key(
        snap: &mut SnapshotRegion,
        lineno: usize,
        key: &str,
        value: &str,
    ) -> Result<(), RecordError> {
        match key {
            "parent" => snap.parent = Some(value.to_string()),
            "snaptime" => {
                snap.snaptime =
                    Some(value.parse().map_err(|_| RecordError::Value {
                        key: key.to_string(),
                        value: value.to_string(),
                    })?)
            }
            "vmstate" => snap.vmstate = Some(value.to_string()),
            "snapstate" => {
                snap.snapstate =
                    Some(value.parse().map_err(|_| RecordError::Value {
                        key: key.to_string(),
                        value: value.to_string(),
                    })?)
            }
            "runningmachine" => {
                snap.runningmachine = Some(value.to_string())
            }
            "delete" => {
                return Err(RecordError::PendingOnly(lineno, "delete"))
            }
            "lock" => return Err(RecordError::MisplacedKey(lineno, "lock")),
            _ => {
                if !key_in_schema(key) {
                    return Err(RecordError::UnknownKey(
                        lineno,
                        key.to_string(),
                    ));
                }
                if snap
                    .options
                    .insert(key.to_string(), value.to_string())
                    .is_some()
                {
                    return Err(RecordError::DuplicateKey(
                        lineno,
                        key.to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn print(&self) -> String {
        let mut out = String::new();
        for line in self.description.lines() {
            let _ = writeln!(out, "#{}", escape_desc(line));
        }
        if !self.description.is_empty() && self.description.ends_with('\n') {
            out.push_str("#\n");
        }
        if let Some(lock) = self.lock {
            let _ = writeln!(out, "lock: {}", lock);
        }
        if let Some(parent) = &self.parent {
            let _ = writeln!(out, "parent: {}", parent);
        }
        for (key, value) in &self.active {
            let _ = writeln!(out, "{}: {}", key, value);
        }
        if !self.pending.is_empty() {
            out.push_str("\n[PENDING]\n");
            if !self.pending.delete.is_empty() {
                let list = self
                    .pending
                    .delete
                    .iter()
                    .map(|(k, mode)| match mode {
                        DeleteMode::Soft => k.clone(),
                        DeleteMode::Force => format!("!{}", k),
                    })
                    .collect::<Vec<_>>()
                    .join(",");
                let _ = writeln!(out, "delete: {}", list);
            }
            for (key, value) in &self.pending.options {
                let _ = writeln!(out, "{}: {}", key, value);
            }
        }
        for (name, snap) in &self.snapshots {
            let _ = writeln!(out, "\n[{}]", name);
            if let Some(parent) = &snap.parent {
                let _ = writeln!(out, "parent: {}", parent);
            }
            if let Some(machine) = &snap.runningmachine {
                let _ = writeln!(out, "runningmachine: {}", machine);
            }
            if let Some(state) = snap.snapstate {
                let _ = writeln!(out, "snapstate: {}", state);
            }
            if let Some(time) = snap.snaptime {
                let _ = writeln!(out, "snaptime: {}", time);
            }
            if let Some(vmstate) = &snap.vmstate {
                let _ = writeln!(out, "vmstate: {}", vmstate);
            }
            for (key, value) in &snap.options {
                let _ = writeln!(out, "{}: {}", key, value);
            }
        }
        out
    }

    /// Stage an edit: the key gets a pending value and leaves the pending
    /// delete set, maintaining the at-most-one-region invariant.
    pub fn set_pending(
        &mut self,
        key: &str,
        value: String,
    ) -> Result<(), RecordError> {
        if !key_in_schema(key) {
            return Err(RecordError::BadKey(key.to_string()));
        }
        self.pending.delete.remove(key);
        self.pending.options.insert(key.to_string(), value);
        Ok(())
    }

    /// Stage a removal: the key joins the pending delete set and loses any
    /// staged value.
    pub fn mark_pending_delete(
        &mut self,
        key: &str,
        mode: DeleteMode,
    ) -> Result<(), RecordError> {
        if !key_in_schema(key) {
            return Err(RecordError::BadKey(key.to_string()));
        }
        self.pending.options.remove(key);
        self.pending.delete.insert(key.to_string(), mode);
        Ok(())
    }

    /// Promote one key's staged value into the active region. Returns the
    /// value now in effect, if any remains.
    pub fn apply_pending_key(&mut self, key: &str) -> Option<String> {
        if let Some(value) = self.pending.options.remove(key) {
            self.active.insert(key.to_string(), value.clone());
            return Some(value);
        }
        if self.pending.delete.remove(key).is_some() {
            self.active.remove(key);
        }
        None
    }

    /// Device options in the active region, in identity order.
    pub fn active_devices(&self) -> Vec<(DeviceId, &str)> {
        let mut out: Vec<(DeviceId, &str)> = self
            .active
            .iter()
            .filter_map(|(k, v)| {
                DeviceId::from_str(k).ok().map(|id| (id, v.as_str()))
            })
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SAMPLE: &str = "\
# Build host for the website.
# Keep 50%25 of RAM free.
lock: snapshot
parent: clean
agent: 1
cores: 4
memory: 8192
net0: virtio,bridge=vmbr0,macaddr=BC:24:11:2A:2B:2C
scsi0: mytank:vm-100-disk-0,cache=writeback
scsihw: virtio-scsi-pci
sockets: 1

[PENDING]
delete: net0,!scsi1
memory: 16384

[clean]
cores: 4
memory: 8192
snaptime: 1722873600
";

    #[test]
    fn parses_sample() {
        let cfg = VmConfig::parse(SAMPLE).unwrap();
        assert_eq!(
            cfg.description,
            "Build host for the website.\nKeep 50% of RAM free."
        );
        assert_eq!(cfg.lock, Some(OperationLock::Snapshot));
        assert_eq!(cfg.parent.as_deref(), Some("clean"));
        assert_eq!(cfg.active.get("memory").unwrap(), "8192");
        assert_eq!(
            cfg.pending.options.get("memory").unwrap(),
            "16384"
        );
        assert_eq!(
            cfg.pending.delete.get("net0"),
            Some(&DeleteMode::Soft)
        );
        assert_eq!(
            cfg.pending.delete.get("scsi1"),
            Some(&DeleteMode::Force)
        );
        let snap = cfg.snapshots.get("clean").unwrap();
        assert_eq!(snap.snaptime, Some(1722873600));
        assert_eq!(snap.options.get("cores").unwrap(), "4");
    }

    #[test]
    fn round_trips() {
        let cfg = VmConfig::parse(SAMPLE).unwrap();
        let printed = cfg.print();
        assert_eq!(VmConfig::parse(&printed).unwrap(), cfg);
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(matches!(
            VmConfig::parse("flavour: grape\n"),
            Err(RecordError::UnknownKey(1, _))
        ));
        assert!(matches!(
            VmConfig::parse("memory: 1024\nmemory: 2048\n"),
            Err(RecordError::DuplicateKey(2, _))
        ));
    }

    #[test]
    fn delete_only_in_pending() {
        assert!(matches!(
            VmConfig::parse("delete: net0\n"),
            Err(RecordError::PendingOnly(1, "delete"))
        ));
    }

    #[test]
    fn pending_value_and_delete_exclusive() {
        let mut cfg = VmConfig::default();
        cfg.set_pending("net0", "virtio".to_string()).unwrap();
        cfg.mark_pending_delete("net0", DeleteMode::Soft).unwrap();
        assert!(!cfg.pending.options.contains_key("net0"));
        cfg.set_pending("net0", "virtio".to_string()).unwrap();
        assert!(!cfg.pending.delete.contains_key("net0"));
    }

    #[test]
    fn apply_pending_key_moves_values() {
        let mut cfg = VmConfig::default();
        cfg.active.insert("memory".to_string(), "1024".to_string());
        cfg.set_pending("memory", "2048".to_string()).unwrap();
        cfg.mark_pending_delete("net0", DeleteMode::Soft).unwrap();
        assert_eq!(cfg.apply_pending_key("memory").as_deref(), Some("2048"));
        assert_eq!(cfg.active.get("memory").unwrap(), "2048");
        assert_eq!(cfg.apply_pending_key("net0"), None);
        assert!(cfg.pending.is_empty());
    }

    #[test]
    fn bad_section_names() {
        assert!(matches!(
            VmConfig::parse("[bad name]\n"),
            Err(RecordError::BadSection(1, _))
        ));
        assert!(matches!(
            VmConfig::parse("[snap1]\nmemory: 1\n[snap1]\n"),
            Err(RecordError::DuplicateSection(3, _))
        ));
    }

    #[test]
    fn snapshot_bookkeeping_keys() {
        let cfg = VmConfig::parse(
            "[s1]\nsnapstate: prepare\nvmstate: tank:vm-100-state-s1\n",
        )
        .unwrap();
        let snap = cfg.snapshots.get("s1").unwrap();
        assert_eq!(snap.snapstate, Some(SnapState::Prepare));
        assert_eq!(snap.vmstate.as_deref(), Some("tank:vm-100-state-s1"));

        assert!(matches!(
            VmConfig::parse("[s1]\nsnapstate: melted\n"),
            Err(RecordError::Value { .. })
        ));
        assert!(matches!(
            VmConfig::parse("[s1]\nlock: backup\n"),
            Err(RecordError::MisplacedKey(2, "lock"))
        ));
    }

    #[test]
    fn active_devices_sorted() {
        let cfg = VmConfig::parse(
            "net0: virtio,macaddr=BC:24:11:2A:2B:2C\nscsi1: t:d1\nscsi0: t:d0\n",
        )
        .unwrap();
        let ids: Vec<String> = cfg
            .active_devices()
            .iter()
            .map(|(id, _)| id.to_string())
            .collect();
        assert_eq!(ids, ["scsi0", "scsi1", "net0"]);
    }
}
