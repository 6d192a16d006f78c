// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The device boot-order map.
//!
//! The `boot` option takes one of two forms. The explicit form lists device
//! identities in priority order: `order=scsi0;ide2;net0`. The legacy form
//! is a string of class letters (`c` disk, `d` cdrom, `n` net) assigning
//! one priority band per class, with devices ranked by discovery order
//! within their band.
//!
//! The resolved priorities only ever annotate generated device arguments
//! with a `bootindex`; nothing else consults them.

use std::collections::BTreeMap;
use std::str::FromStr;

use bridle_types::DeviceId;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum BootOrderError {
    #[error("boot order names {0} which is not a configured device")]
    UnknownDevice(DeviceId),

    #[error("boot order names {0} more than once")]
    DuplicateDevice(DeviceId),

    #[error("invalid boot order entry {0:?}")]
    BadEntry(String),

    #[error("invalid legacy boot class {0:?}")]
    BadClass(char),
}

/// The class a discovered device competes in for legacy letter ordering.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BootClass {
    Disk,
    Cdrom,
    Net,
}

/// Width of one legacy priority band.
const BAND: u32 = 100;

/// Resolve a `boot` option value against the devices actually configured,
/// yielding a bootindex per device identity. Devices not mentioned receive
/// no entry and thus no annotation.
pub fn resolve(
    boot: &str,
    devices: &[(DeviceId, BootClass)],
) -> Result<BTreeMap<DeviceId, u32>, BootOrderError> {
    if let Some(list) = boot.strip_prefix("order=") {
        resolve_explicit(list, devices)
    } else {
        resolve_legacy(boot, devices)
    }
}

fn resolve_explicit(
    list: &str,
    devices: &[(DeviceId, BootClass)],
) -> Result<BTreeMap<DeviceId, u32>, BootOrderError> {
    let mut map = BTreeMap::new();
    for (pos, entry) in list.split(';').enumerate() {
        let id = DeviceId::from_str(entry)
            .map_err(|_| BootOrderError::BadEntry(entry.to_string()))?;
        if !devices.iter().any(|(d, _)| *d == id) {
            return Err(BootOrderError::UnknownDevice(id));
        }
        if map.insert(id, pos as u32 + 1).is_some() {
            return Err(BootOrderError::DuplicateDevice(id));
        }
    }
    Ok(map)
}

fn resolve_legacy(
    letters: &str,
    devices: &[(DeviceId, BootClass)],
) -> Result<BTreeMap<DeviceId, u32>, BootOrderError> {
    let mut map = BTreeMap::new();
    for (band, letter) in letters.chars().enumerate() {
        let class = match letter {
            'c' => BootClass::Disk,
            'd' => BootClass::Cdrom,
            'n' => BootClass::Net,
            other => return Err(BootOrderError::BadClass(other)),
        };
        let base = (band as u32 + 1) * BAND;
        let mut offset = 0;
        for (id, dev_class) in devices {
            if *dev_class == class && !map.contains_key(id) {
                map.insert(*id, base + offset);
                offset += 1;
            }
        }
    }
    Ok(map)
}
