//! QMP monitor client
//!
//! One request object per line, replies terminated by newline. Asynchronous
//! event objects (e.g. `STOP` when the guest pauses for the final migration
//! phase) may arrive between replies and are skipped.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::QmpError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for stray events when draining between polls.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Client connected to a QEMU monitor socket.
pub struct QmpClient {
    stream: UnixStream,
    buf: Vec<u8>,
}

/// Payload of a `query-migrate` reply.
#[derive(Debug, Clone, Deserialize)]
pub struct MigrationStatus {
    #[serde(default)]
    pub status: String,
    pub ram: Option<RamStats>,
    #[serde(rename = "expected-downtime")]
    pub expected_downtime: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RamStats {
    #[serde(default)]
    pub transferred: u64,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub mbps: f64,
}

/// Build a QMP command object.
pub(crate) fn make_command(execute: &str, arguments: Option<Value>) -> Value {
    match arguments {
        Some(arguments) => json!({ "execute": execute, "arguments": arguments }),
        None => json!({ "execute": execute }),
    }
}

impl QmpClient {
    /// Connect to the monitor socket, consume the greeting and negotiate
    /// capabilities. The client is ready for commands afterwards.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, QmpError> {
        let stream = timeout(CONNECT_TIMEOUT, UnixStream::connect(path.as_ref()))
            .await
            .map_err(|_| QmpError::Timeout)??;

        let mut client = Self {
            stream,
            buf: Vec::new(),
        };

        let greeting = timeout(CONNECT_TIMEOUT, client.next_message())
            .await
            .map_err(|_| QmpError::Timeout)??;
        debug!(greeting = %greeting, "connected to monitor");

        client.execute("qmp_capabilities", None).await?;
        Ok(client)
    }

    /// Issue `migrate` with a detached transfer to the given URI.
    pub async fn migrate(&mut self, uri: &str) -> Result<(), QmpError> {
        self.execute("migrate", Some(json!({ "uri": uri, "detach": true })))
            .await?;
        Ok(())
    }

    /// Issue `query-migrate` and decode the reply.
    pub async fn query_migrate(&mut self) -> Result<MigrationStatus, QmpError> {
        let reply = self.execute("query-migrate", None).await?;
        Ok(serde_json::from_value(reply)?)
    }

    /// Send a command and return its `return` payload. Event objects that
    /// arrive before the reply are logged and skipped.
    pub async fn execute(
        &mut self,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<Value, QmpError> {
        let cmd = make_command(command, arguments);
        debug!(%cmd, "qmp command");

        let mut line = serde_json::to_vec(&cmd)?;
        line.push(b'\n');
        self.stream.write_all(&line).await?;

        loop {
            let reply = self.next_message().await?;
            if let Some(event) = reply.get("event") {
                debug!(%event, "skipping monitor event");
                continue;
            }
            if let Some(error) = reply.get("error") {
                return Err(QmpError::Command(error.to_string()));
            }
            match reply.get("return") {
                Some(ret) => return Ok(ret.clone()),
                None => {
                    debug!(%reply, "ignoring unrecognized monitor message");
                    continue;
                }
            }
        }
    }

    /// Read and discard any pending messages, returning once the socket is
    /// quiet. Used between polls to consume events such as `STOP`.
    pub async fn drain_events(&mut self) -> Result<(), QmpError> {
        loop {
            match timeout(DRAIN_TIMEOUT, self.next_message()).await {
                Ok(Ok(message)) => debug!(%message, "drained monitor message"),
                Ok(Err(e)) => return Err(e),
                Err(_) => return Ok(()),
            }
        }
    }

    /// Read the next newline-terminated JSON object. Partially received
    /// lines survive cancellation because the buffer lives on the client.
    async fn next_message(&mut self) -> Result<Value, QmpError> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                let text = String::from_utf8_lossy(&line);
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                return Ok(serde_json::from_str(text)?);
            }

            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(QmpError::ConnectionClosed);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_without_arguments() {
        let cmd = make_command("qmp_capabilities", None);
        assert_eq!(cmd.to_string(), r#"{"execute":"qmp_capabilities"}"#);
    }

    #[test]
    fn migrate_command_carries_uri_and_detach() {
        let cmd = make_command(
            "migrate",
            Some(json!({ "uri": "tcp:10.0.0.7:44123", "detach": true })),
        );
        assert_eq!(cmd["execute"], "migrate");
        assert_eq!(cmd["arguments"]["uri"], "tcp:10.0.0.7:44123");
        assert_eq!(cmd["arguments"]["detach"], true);
    }

    #[test]
    fn migration_status_parses_active_reply() {
        let reply = json!({
            "status": "active",
            "ram": { "transferred": 123_u64, "total": 1024_u64, "mbps": 812.5 },
            "expected-downtime": 300
        });
        let status: MigrationStatus = serde_json::from_value(reply).unwrap();
        assert_eq!(status.status, "active");
        let ram = status.ram.unwrap();
        assert_eq!(ram.transferred, 123);
        assert_eq!(ram.total, 1024);
        assert_eq!(status.expected_downtime, Some(300));
    }

    #[test]
    fn migration_status_parses_completed_reply_without_ram() {
        let status: MigrationStatus =
            serde_json::from_value(json!({ "status": "completed" })).unwrap();
        assert_eq!(status.status, "completed");
        assert!(status.ram.is_none());
    }
}
