// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The monitor (QMP) transport boundary and typed command helpers.
//!
//! The transport itself is a single `call` seam; everything the hotplug
//! engine and lifecycle manager say to a running instance goes through it.
//! Commands default to a short timeout; migration-class commands (state
//! save, mirroring) legitimately block for a long time and carry an
//! hour-scale one instead.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Clone, Debug, Error)]
pub enum MonitorError {
    /// No instance is reachable on the monitor socket.
    #[error("instance is not running")]
    NotRunning,

    #[error("monitor command {0:?} timed out")]
    Timeout(String),

    /// The hypervisor rejected the command; carries its own error class
    /// and message.
    #[error("monitor error {class}: {desc}")]
    Protocol { class: String, desc: String },

    #[error("monitor transport: {0}")]
    Transport(String),
}

impl MonitorError {
    /// The hypervisor reports detaching an already-gone device this way;
    /// removal paths treat it as success.
    pub fn is_device_not_found(&self) -> bool {
        matches!(self, MonitorError::Protocol { class, .. }
            if class == "DeviceNotFound")
    }
}

pub const SHORT_TIMEOUT: Duration = Duration::from_secs(5);
pub const MIGRATE_TIMEOUT: Duration = Duration::from_secs(3600);

#[async_trait]
pub trait Monitor: Send + Sync {
    /// Issue one structured command and wait for its structured response.
    async fn call(
        &self,
        command: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<Value, MonitorError>;
}

/// Typed wrappers over the raw transport.
pub struct Mon<'a>(pub &'a dyn Monitor);

impl Mon<'_> {
    async fn short(
        &self,
        command: &str,
        args: Value,
    ) -> Result<Value, MonitorError> {
        self.0.call(command, args, SHORT_TIMEOUT).await
    }

    pub async fn ping(&self) -> Result<(), MonitorError> {
        self.short("query-status", json!({})).await.map(|_| ())
    }

    /// Ids of the devices currently present in the instance.
    pub async fn device_list(&self) -> Result<Vec<String>, MonitorError> {
        let rv = self
            .short("qom-list", json!({"path": "/machine/peripheral"}))
            .await?;
        Ok(rv
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|entry| entry.get("name"))
            .filter_map(Value::as_str)
            .filter(|name| *name != "type")
            .map(str::to_string)
            .collect())
    }

    pub async fn device_add(&self, args: Value) -> Result<(), MonitorError> {
        self.short("device_add", args).await.map(|_| ())
    }

    pub async fn device_del(&self, id: &str) -> Result<(), MonitorError> {
        self.short("device_del", json!({"id": id})).await.map(|_| ())
    }

    pub async fn blockdev_add(
        &self,
        args: Value,
    ) -> Result<(), MonitorError> {
        self.short("blockdev-add", args).await.map(|_| ())
    }

    pub async fn blockdev_del(
        &self,
        node_name: &str,
    ) -> Result<(), MonitorError> {
        self.short("blockdev-del", json!({"node-name": node_name}))
            .await
            .map(|_| ())
    }

    pub async fn netdev_add(&self, args: Value) -> Result<(), MonitorError> {
        self.short("netdev_add", args).await.map(|_| ())
    }

    pub async fn netdev_del(&self, id: &str) -> Result<(), MonitorError> {
        self.short("netdev_del", json!({"id": id})).await.map(|_| ())
    }

    pub async fn object_add(&self, args: Value) -> Result<(), MonitorError> {
        self.short("object-add", args).await.map(|_| ())
    }

    pub async fn object_del(&self, id: &str) -> Result<(), MonitorError> {
        self.short("object-del", json!({"id": id})).await.map(|_| ())
    }

    pub async fn block_resize(
        &self,
        node_name: &str,
        size_bytes: u64,
    ) -> Result<(), MonitorError> {
        self.short(
            "block_resize",
            json!({"node-name": node_name, "size": size_bytes}),
        )
        .await
        .map(|_| ())
    }

    pub async fn block_set_io_throttle(
        &self,
        args: Value,
    ) -> Result<(), MonitorError> {
        self.short("block_set_io_throttle", args).await.map(|_| ())
    }

    pub async fn set_link(
        &self,
        name: &str,
        up: bool,
    ) -> Result<(), MonitorError> {
        self.short("set_link", json!({"name": name, "up": up}))
            .await
            .map(|_| ())
    }

    /// Ask the balloon driver to settle at `target` bytes.
    pub async fn balloon(&self, target: u64) -> Result<(), MonitorError> {
        self.short("balloon", json!({"value": target})).await.map(|_| ())
    }

    pub async fn system_powerdown(&self) -> Result<(), MonitorError> {
        self.short("system_powerdown", json!({})).await.map(|_| ())
    }

    /// Tear the emulator process down immediately.
    pub async fn quit(&self) -> Result<(), MonitorError> {
        self.short("quit", json!({})).await.map(|_| ())
    }

    pub async fn pause(&self) -> Result<(), MonitorError> {
        self.short("stop", json!({})).await.map(|_| ())
    }

    pub async fn resume(&self) -> Result<(), MonitorError> {
        self.short("cont", json!({})).await.map(|_| ())
    }

    /// Begin an internal live state save into the given state file. Long
    /// timeout: the save legitimately runs for as long as dirty memory
    /// keeps it busy.
    pub async fn savevm_start(
        &self,
        statefile: &str,
    ) -> Result<(), MonitorError> {
        self.0
            .call(
                "savevm-start",
                json!({"statefile": statefile}),
                MIGRATE_TIMEOUT,
            )
            .await
            .map(|_| ())
    }

    pub async fn savevm_end(&self) -> Result<(), MonitorError> {
        self.short("savevm-end", json!({})).await.map(|_| ())
    }
}

/// The guest agent channel. Distinct from the monitor: it only works when
/// the guest cooperates, so callers probe before relying on it.
#[async_trait]
pub trait GuestAgent: Send + Sync {
    /// Whether the agent channel is confirmed live right now.
    async fn ping(&self) -> bool;

    /// Cooperative in-guest shutdown.
    async fn shutdown(&self) -> Result<(), MonitorError>;
}
