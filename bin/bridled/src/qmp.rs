// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! QMP and guest-agent transports over the instance's unix sockets.
//!
//! Each call opens a fresh connection: the control plane is synchronous
//! per VM, command volume is low, and a stateless transport cannot get
//! wedged by a half-dead persistent session.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bridle::monitor::{GuestAgent, Monitor, MonitorError};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

pub struct QmpMonitor {
    socket: PathBuf,
}

impl QmpMonitor {
    pub fn new(socket: PathBuf) -> Self {
        Self { socket }
    }

    async fn exchange(
        &self,
        command: &str,
        args: Value,
    ) -> Result<Value, MonitorError> {
        let stream = UnixStream::connect(&self.socket)
            .await
            .map_err(|_| MonitorError::NotRunning)?;
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        let transport =
            |msg: String| MonitorError::Transport(msg.to_string());

        // greeting, then capability negotiation
        let greeting = lines
            .next_line()
            .await
            .map_err(|e| transport(e.to_string()))?
            .ok_or_else(|| transport("connection closed".to_string()))?;
        if !greeting.contains("QMP") {
            return Err(transport(format!(
                "unexpected greeting {:?}",
                greeting
            )));
        }
        Self::send(&mut writer, &json!({"execute": "qmp_capabilities"}))
            .await?;
        Self::read_response(&mut lines).await?;

        Self::send(
            &mut writer,
            &json!({"execute": command, "arguments": args}),
        )
        .await?;
        Self::read_response(&mut lines).await
    }

    async fn send(
        writer: &mut (impl AsyncWriteExt + Unpin),
        message: &Value,
    ) -> Result<(), MonitorError> {
        let mut line = message.to_string();
        line.push('\n');
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| MonitorError::Transport(e.to_string()))
    }

    async fn read_response(
        lines: &mut tokio::io::Lines<
            BufReader<tokio::net::unix::OwnedReadHalf>,
        >,
    ) -> Result<Value, MonitorError> {
        loop {
            let line = lines
                .next_line()
                .await
                .map_err(|e| MonitorError::Transport(e.to_string()))?
                .ok_or_else(|| {
                    MonitorError::Transport(
                        "connection closed mid-response".to_string(),
                    )
                })?;
            let msg: Value = serde_json::from_str(&line)
                .map_err(|e| MonitorError::Transport(e.to_string()))?;
            if let Some(rv) = msg.get("return") {
                return Ok(rv.clone());
            }
            if let Some(err) = msg.get("error") {
                return Err(MonitorError::Protocol {
                    class: err
                        .get("class")
                        .and_then(Value::as_str)
                        .unwrap_or("GenericError")
                        .to_string(),
                    desc: err
                        .get("desc")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                });
            }
            // asynchronous events interleave with responses; skip them
            if msg.get("event").is_some() {
                continue;
            }
            return Err(MonitorError::Transport(format!(
                "unrecognized message {:?}",
                line
            )));
        }
    }
}

#[async_trait]
impl Monitor for QmpMonitor {
    async fn call(
        &self,
        command: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<Value, MonitorError> {
        match tokio::time::timeout(timeout, self.exchange(command, args))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(MonitorError::Timeout(command.to_string())),
        }
    }
}

/// Guest agent channel. Same line framing as QMP, without the greeting.
pub struct QgaChannel {
    socket: PathBuf,
}

impl QgaChannel {
    pub fn new(socket: PathBuf) -> Self {
        Self { socket }
    }

    async fn exchange(
        &self,
        message: Value,
        want_reply: bool,
    ) -> Result<(), MonitorError> {
        let stream = UnixStream::connect(&self.socket)
            .await
            .map_err(|_| MonitorError::NotRunning)?;
        let (reader, mut writer) = stream.into_split();
        QmpMonitor::send(&mut writer, &message).await?;
        if want_reply {
            let mut lines = BufReader::new(reader).lines();
            QmpMonitor::read_response(&mut lines).await?;
        }
        Ok(())
    }
}

const AGENT_PING_TIMEOUT: Duration = Duration::from_secs(3);

#[async_trait]
impl GuestAgent for QgaChannel {
    async fn ping(&self) -> bool {
        matches!(
            tokio::time::timeout(
                AGENT_PING_TIMEOUT,
                self.exchange(json!({"execute": "guest-ping"}), true),
            )
            .await,
            Ok(Ok(()))
        )
    }

    async fn shutdown(&self) -> Result<(), MonitorError> {
        // the guest powers off before it can answer; fire and forget
        self.exchange(json!({"execute": "guest-shutdown"}), false).await
    }
}
