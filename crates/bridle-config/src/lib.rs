// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! VM configuration model.
//!
//! This crate owns everything between the persisted config text and the
//! typed structures the compiler and hotplug engine consume:
//!
//! - [`record`]: the line-oriented config record with its active, pending,
//!   and per-snapshot regions, the pending-delete set, and the operation
//!   lock field.
//! - [`devspec`]: the descriptor codec, parsing the compact string form of
//!   a drive, NIC, PCI-passthrough, USB, or watchdog device into a
//!   structured descriptor and printing it back canonically.
//! - [`options`]: typed values for the scalar option keys (SCSI adapter
//!   model, guest OS type, hotplug classes, ...).
//! - [`boot`]: the device boot-order map derived from the `boot` option.
//!
//! Nothing in this crate performs I/O; the config store collaborator hands
//! the record text in and out.

pub mod boot;
pub mod devspec;
pub mod options;
pub mod record;

pub use devspec::{Descriptor, ParseError};
pub use record::{OperationLock, RecordError, SnapState, VmConfig};
