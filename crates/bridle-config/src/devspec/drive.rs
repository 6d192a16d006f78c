// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Drive descriptors.
//!
//! A drive's compact form leads with its backing volume reference, followed
//! by tunables: `mytank:vm-100-disk-0,cache=writeback,discard=on`. The
//! canonical print order is the volume first, then fields alphabetically;
//! flags keep their explicit presence so a round-trip never drops a field
//! the operator wrote.

use std::str::FromStr;

use bridle_types::{ByteQty, DeviceKind};

use super::{push_field, push_flag, Fields, ParseError, VolumeRef};

/// What the drive presents to the guest.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Media {
    #[default]
    Disk,
    Cdrom,
}

impl FromStr for Media {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "disk" => Ok(Media::Disk),
            "cdrom" => Ok(Media::Cdrom),
            _ => Err(()),
        }
    }
}

#[derive(
    Clone, Copy, PartialEq, Eq, Debug, strum::EnumString, strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum CacheMode {
    None,
    WriteThrough,
    WriteBack,
    Unsafe,
    DirectSync,
}

impl CacheMode {
    /// Direct modes bypass the host page cache; only these permit native
    /// async I/O on the backing store.
    pub fn is_direct(&self) -> bool {
        matches!(self, CacheMode::None | CacheMode::DirectSync)
    }
}

#[derive(
    Clone, Copy, PartialEq, Eq, Debug, strum::EnumString, strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum AioMode {
    Native,
    Threads,
    #[strum(serialize = "io_uring")]
    IoUring,
}

#[derive(
    Clone, Copy, PartialEq, Eq, Debug, strum::EnumString, strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum DiscardMode {
    On,
    Ignore,
}

#[derive(
    Clone, Copy, PartialEq, Eq, Debug, strum::EnumString, strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum DriveFormat {
    Raw,
    Qcow2,
    Vmdk,
}

/// One throttle limit: the plain sustained form, the burst-pool form, and
/// the burst length. The plain and burst forms of the same direction are
/// mutually exclusive; a burst length without its burst is meaningless.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct LimitPair {
    pub plain: Option<u64>,
    pub burst: Option<u64>,
    pub burst_length: Option<u32>,
}

impl LimitPair {
    pub fn is_set(&self) -> bool {
        self.plain.is_some() || self.burst.is_some()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct DirectionalLimits {
    pub total: LimitPair,
    pub read: LimitPair,
    pub write: LimitPair,
}

/// Per-drive I/O throttling, in bytes/sec and ops/sec.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct ThrottleGroup {
    pub bps: DirectionalLimits,
    pub iops: DirectionalLimits,
}

impl ThrottleGroup {
    pub fn is_empty(&self) -> bool {
        self == &ThrottleGroup::default()
    }
}

fn take_pair(
    f: &mut Fields,
    plain: &'static str,
    burst: &'static str,
    length: &'static str,
) -> Result<LimitPair, ParseError> {
    let pair = LimitPair {
        plain: f.take(plain)?,
        burst: f.take(burst)?,
        burst_length: f.take(length)?,
    };
    if pair.plain.is_some() && pair.burst.is_some() {
        return Err(ParseError::Exclusive(plain, burst));
    }
    if pair.burst_length.is_some() && pair.burst.is_none() {
        return Err(ParseError::Requires(length, burst));
    }
    Ok(pair)
}

fn take_directional(
    f: &mut Fields,
    unit: &'static str,
    names: &'static [(&'static str, &'static str, &'static str); 3],
) -> Result<DirectionalLimits, ParseError> {
    let [total, read, write] = *names;
    let limits = DirectionalLimits {
        total: take_pair(f, total.0, total.1, total.2)?,
        read: take_pair(f, read.0, read.1, read.2)?,
        write: take_pair(f, write.0, write.1, write.2)?,
    };
    // The combined limit and the split read/write limits are exclusive.
    if limits.total.is_set() && (limits.read.is_set() || limits.write.is_set())
    {
        return Err(ParseError::Exclusive(
            unit,
            if limits.read.is_set() { read.0 } else { write.0 },
        ));
    }
    Ok(limits)
}

const BPS_NAMES: [(&str, &str, &str); 3] = [
    ("bps", "bps_max", "bps_max_length"),
    ("bps_rd", "bps_rd_max", "bps_rd_max_length"),
    ("bps_wr", "bps_wr_max", "bps_wr_max_length"),
];

const IOPS_NAMES: [(&str, &str, &str); 3] = [
    ("iops", "iops_max", "iops_max_length"),
    ("iops_rd", "iops_rd_max", "iops_rd_max_length"),
    ("iops_wr", "iops_wr_max", "iops_wr_max_length"),
];

fn print_pair(
    out: &mut String,
    pair: &LimitPair,
    names: (&'static str, &'static str, &'static str),
) {
    if let Some(v) = pair.plain {
        push_field(out, names.0, v);
    }
    if let Some(v) = pair.burst {
        push_field(out, names.1, v);
    }
    if let Some(v) = pair.burst_length {
        push_field(out, names.2, v);
    }
}

fn print_directional(
    out: &mut String,
    limits: &DirectionalLimits,
    names: &[(&'static str, &'static str, &'static str); 3],
) {
    print_pair(out, &limits.total, names[0]);
    print_pair(out, &limits.read, names[1]);
    print_pair(out, &limits.write, names[2]);
}

/// A fully parsed drive descriptor.
#[derive(Clone, PartialEq, Debug)]
pub struct DriveSpec {
    /// The storage bus this drive sits on, fixed by the option key.
    pub bus: DeviceKind,
    pub volume: VolumeRef,
    pub media: Media,
    pub cache: Option<CacheMode>,
    pub aio: Option<AioMode>,
    pub discard: Option<DiscardMode>,
    pub format: Option<DriveFormat>,
    pub size: Option<ByteQty>,
    pub serial: Option<String>,
    pub ssd: Option<bool>,
    pub iothread: Option<bool>,
    pub snapshot: Option<bool>,
    pub backup: Option<bool>,
    pub replicate: Option<bool>,
    pub throttle: ThrottleGroup,
}

impl DriveSpec {
    pub fn parse(bus: DeviceKind, raw: &str) -> Result<Self, ParseError> {
        assert!(bus.is_drive());
        let mut f = Fields::split(raw)?;
        let volume = match f.positional() {
            Some(v) => v.parse()?,
            None => match f.take::<VolumeRef>("file")? {
                Some(v) => v,
                None => return Err(ParseError::MissingVolume),
            },
        };
        let spec = DriveSpec {
            bus,
            volume,
            media: f.take("media")?.unwrap_or_default(),
            cache: f.take("cache")?,
            aio: f.take("aio")?,
            discard: f.take("discard")?,
            format: f.take("format")?,
            size: f.take("size")?,
            serial: f.take("serial")?,
            ssd: f.take_bool("ssd")?,
            iothread: f.take_bool("iothread")?,
            snapshot: f.take_bool("snapshot")?,
            backup: f.take_bool("backup")?,
            replicate: f.take_bool("replicate")?,
            throttle: ThrottleGroup {
                bps: take_directional(&mut f, "bps", &BPS_NAMES)?,
                iops: take_directional(&mut f, "iops", &IOPS_NAMES)?,
            },
        };
        f.finish()?;
        spec.validate()?;
        Ok(spec)
    }

    fn validate(&self) -> Result<(), ParseError> {
        if self.media == Media::Cdrom {
            if self.bus == DeviceKind::Virtio {
                return Err(ParseError::CdromBus("virtio"));
            }
            for (set, name) in [
                (self.format.is_some(), "format"),
                (self.ssd.is_some(), "ssd"),
                (self.iothread.is_some(), "iothread"),
                (self.snapshot.is_some(), "snapshot"),
            ] {
                if set {
                    return Err(ParseError::CdromField(name));
                }
            }
        }
        Ok(())
    }

    /// Whether a backup of this VM should include the drive.
    pub fn backup_enabled(&self) -> bool {
        self.backup.unwrap_or(true)
    }

    pub fn is_cdrom(&self) -> bool {
        self.media == Media::Cdrom
    }

    /// Canonical print: volume first, remaining fields in fixed order.
    pub fn print(&self) -> String {
        let mut out = self.volume.to_string();
        if let Some(v) = self.aio {
            push_field(&mut out, "aio", v);
        }
        if let Some(v) = self.backup {
            push_flag(&mut out, "backup", v);
        }
        print_directional(&mut out, &self.throttle.bps, &BPS_NAMES);
        if let Some(v) = self.cache {
            push_field(&mut out, "cache", v);
        }
        if let Some(v) = self.discard {
            push_field(&mut out, "discard", v);
        }
        if let Some(v) = self.format {
            push_field(&mut out, "format", v);
        }
        print_directional(&mut out, &self.throttle.iops, &IOPS_NAMES);
        if let Some(v) = self.iothread {
            push_flag(&mut out, "iothread", v);
        }
        if self.media == Media::Cdrom {
            push_field(&mut out, "media", "cdrom");
        }
        if let Some(v) = self.replicate {
            push_flag(&mut out, "replicate", v);
        }
        if let Some(v) = &self.serial {
            push_field(&mut out, "serial", v);
        }
        if let Some(v) = self.size {
            push_field(&mut out, "size", v);
        }
        if let Some(v) = self.snapshot {
            push_flag(&mut out, "snapshot", v);
        }
        if let Some(v) = self.ssd {
            push_flag(&mut out, "ssd", v);
        }
        out
    }
}
