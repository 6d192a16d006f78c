// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Control plane for a single QEMU/KVM virtual machine.
//!
//! The library turns a declarative [`bridle_config::VmConfig`] into a
//! concrete hypervisor process invocation ([`compile`]), keeps a running
//! instance in sync with configuration edits over the QMP monitor
//! ([`hotplug`]), and serializes the state-changing operations that touch
//! that instance ([`lifecycle`]).
//!
//! External machinery is consumed through the collaborator traits in
//! [`monitor`], [`volume`], [`store`], and [`process`]; the binary wires in
//! real implementations, the tests wire in fakes.

pub mod compile;
pub mod hotplug;
pub mod lifecycle;
pub mod monitor;
pub mod process;
pub mod slots;
pub mod store;
pub mod volume;

#[cfg(test)]
mod testutil;
