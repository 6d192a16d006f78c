// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host PCI and USB passthrough descriptors.

use std::fmt::{self, Display};
use std::str::FromStr;

use super::{push_field, push_flag, Fields, ParseError};

/// A host PCI function address, `[domain:]bus:dev[.func]`. Omitting the
/// function selects every function of the device (multifunction
/// passthrough).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct PciHostAddr {
    pub domain: u16,
    pub bus: u8,
    pub dev: u8,
    pub func: Option<u8>,
}

impl FromStr for PciHostAddr {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, ()> {
        let (rest, func) = match s.split_once('.') {
            Some((rest, func)) => {
                let func = u8::from_str_radix(func, 16).map_err(|_| ())?;
                if func > 7 {
                    return Err(());
                }
                (rest, Some(func))
            }
            None => (s, None),
        };
        let parts: Vec<&str> = rest.split(':').collect();
        let (domain, bus, dev) = match parts.as_slice() {
            [bus, dev] => ("0", *bus, *dev),
            [domain, bus, dev] => (*domain, *bus, *dev),
            _ => return Err(()),
        };
        Ok(Self {
            domain: u16::from_str_radix(domain, 16).map_err(|_| ())?,
            bus: u8::from_str_radix(bus, 16).map_err(|_| ())?,
            dev: {
                let dev = u8::from_str_radix(dev, 16).map_err(|_| ())?;
                if dev > 0x1f {
                    return Err(());
                }
                dev
            },
            func,
        })
    }
}

impl Display for PciHostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.domain != 0 {
            write!(f, "{:04x}:", self.domain)?;
        }
        write!(f, "{:02x}:{:02x}", self.bus, self.dev)?;
        if let Some(func) = self.func {
            write!(f, ".{:x}", func)?;
        }
        Ok(())
    }
}

/// A host PCI passthrough descriptor: `01:00.0,pcie=1,rombar=0`.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct HostPciSpec {
    pub host: PciHostAddr,
    pub pcie: Option<bool>,
    pub rombar: Option<bool>,
    pub romfile: Option<String>,
    /// Mediated device type name carved out of the host device.
    pub mdev: Option<String>,
}

impl HostPciSpec {
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let mut f = Fields::split(raw)?;
        let host = match f.positional() {
            Some(v) => v.parse().map_err(|_| ParseError::Value {
                field: "host",
                value: v,
            })?,
            None => f.take::<PciHostAddr>("host")?.ok_or(
                ParseError::Value { field: "host", value: String::new() },
            )?,
        };
        let spec = HostPciSpec {
            host,
            pcie: f.take_bool("pcie")?,
            rombar: f.take_bool("rombar")?,
            romfile: f.take("romfile")?,
            mdev: f.take("mdev")?,
        };
        f.finish()?;
        Ok(spec)
    }

    /// All functions of the host device pass through together when no
    /// explicit function was selected.
    pub fn multifunction(&self) -> bool {
        self.host.func.is_none()
    }

    pub fn print(&self) -> String {
        let mut out = self.host.to_string();
        if let Some(v) = &self.mdev {
            push_field(&mut out, "mdev", v);
        }
        if let Some(v) = self.pcie {
            push_flag(&mut out, "pcie", v);
        }
        if let Some(v) = self.rombar {
            push_flag(&mut out, "rombar", v);
        }
        if let Some(v) = &self.romfile {
            push_field(&mut out, "romfile", v);
        }
        out
    }
}

/// How a USB passthrough selects its host device.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum UsbSelector {
    /// `host=046d:c52b` - by vendor and product id.
    VendorProduct { vendor: u16, product: u16 },
    /// `host=1-2.1` - by physical bus and port path.
    BusPort { bus: u8, port: String },
}

impl FromStr for UsbSelector {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, ()> {
        if let Some((vendor, product)) = s.split_once(':') {
            if vendor.len() == 4 && product.len() == 4 {
                return Ok(UsbSelector::VendorProduct {
                    vendor: u16::from_str_radix(vendor, 16).map_err(|_| ())?,
                    product: u16::from_str_radix(product, 16)
                        .map_err(|_| ())?,
                });
            }
            return Err(());
        }
        let (bus, port) = s.split_once('-').ok_or(())?;
        let bus: u8 = bus.parse().map_err(|_| ())?;
        if port.is_empty()
            || !port.split('.').all(|p| {
                !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit())
            })
        {
            return Err(());
        }
        Ok(UsbSelector::BusPort { bus, port: port.to_string() })
    }
}

impl Display for UsbSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsbSelector::VendorProduct { vendor, product } => {
                write!(f, "{:04x}:{:04x}", vendor, product)
            }
            UsbSelector::BusPort { bus, port } => {
                write!(f, "{}-{}", bus, port)
            }
        }
    }
}

/// A USB passthrough descriptor: `host=046d:c52b,usb3=1`.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct UsbSpec {
    pub host: UsbSelector,
    pub usb3: Option<bool>,
}

impl UsbSpec {
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let mut f = Fields::split(raw)?;
        let host = match f.positional() {
            Some(v) => v.parse().map_err(|_| ParseError::Value {
                field: "host",
                value: v,
            })?,
            None => f.take::<UsbSelector>("host")?.ok_or(
                ParseError::Value { field: "host", value: String::new() },
            )?,
        };
        let spec = UsbSpec { host, usb3: f.take_bool("usb3")? };
        f.finish()?;
        Ok(spec)
    }

    pub fn print(&self) -> String {
        let mut out = format!("host={}", self.host);
        if let Some(v) = self.usb3 {
            push_flag(&mut out, "usb3", v);
        }
        out
    }
}
