//! Guest Agent Client (C2) — freezes/thaws guest filesystems over the same
//! line-delimited JSON framing as the monitor, but on a separate socket and
//! without any capability handshake (§6): every command is a plain
//! `guest-*`-prefixed `execute`.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;
use tokio::net::UnixStream;
use tracing::warn;

use qmpbackup_proto::Request;

use crate::error::MonitorError;

/// Result of `guest-fsfreeze-status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezeStatus {
    /// Filesystems are frozen.
    Frozen,
    /// Filesystems are writable.
    Thawed,
}

/// Client for the guest agent socket.
#[derive(Debug, Clone)]
pub struct GuestAgentClient {
    socket_path: PathBuf,
}

impl GuestAgentClient {
    /// Creates a client for the guest-agent socket at `socket_path`.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self { socket_path: socket_path.into() }
    }

    /// Pings the guest agent, failing if no reply arrives within `timeout`
    /// (default 5s per §5).
    pub async fn ping(&self, timeout: Duration) -> Result<(), MonitorError> {
        tokio::time::timeout(timeout, self.call("guest-ping", None))
            .await
            .map_err(|_| MonitorError::Connect {
                path: self.socket_path.display().to_string(),
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "guest-agent ping"),
            })??;
        Ok(())
    }

    /// Queries `guest-fsfreeze-status`.
    pub async fn status(&self) -> Result<FreezeStatus, MonitorError> {
        let value = self.call("guest-fsfreeze-status", None).await?;
        Ok(match value.as_str() {
            Some("frozen") => FreezeStatus::Frozen,
            _ => FreezeStatus::Thawed,
        })
    }

    /// Freezes guest filesystems, skipping the call if already frozen
    /// (mirrors the historic double-freeze guard).
    pub async fn freeze(&self) -> Result<(), MonitorError> {
        if self.status().await? == FreezeStatus::Frozen {
            warn!("guest filesystems already frozen, skipping freeze");
            return Ok(());
        }
        self.call("guest-fsfreeze-freeze", None).await?;
        Ok(())
    }

    /// Thaws guest filesystems, skipping the call if already thawed.
    pub async fn thaw(&self) -> Result<(), MonitorError> {
        if self.status().await? == FreezeStatus::Thawed {
            warn!("guest filesystems already thawed, skipping thaw");
            return Ok(());
        }
        self.call("guest-fsfreeze-thaw", None).await?;
        Ok(())
    }

    /// Lists commands the guest agent supports, via `guest-info`.
    pub async fn supports(&self, command: &str) -> Result<bool, MonitorError> {
        let info = self.call("guest-info", None).await?;
        let supported = info["supported_commands"]
            .as_array()
            .is_some_and(|cmds| cmds.iter().any(|c| c["name"] == command && c["enabled"] == true));
        Ok(supported)
    }

    async fn call(&self, command: &str, arguments: Option<Value>) -> Result<Value, MonitorError> {
        let mut stream = UnixStream::connect(&self.socket_path).await.map_err(|source| {
            MonitorError::Connect { path: self.socket_path.display().to_string(), source }
        })?;
        let request = arguments
            .map_or_else(|| Request::new(command), |args| Request::with_arguments(command, args));
        qmpbackup_proto::send(&mut stream, &request).await?;
        let (read_half, _write_half) = stream.into_split();
        let mut reader = tokio::io::BufReader::new(read_half);
        qmpbackup_proto::recv_reply(&mut reader)
            .await?
            .into_result()
            .map_err(|e| MonitorError::Command {
                command: command.to_owned(),
                class: e.class,
                desc: e.desc,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::UnixListener;

    async fn respond_once(listener: UnixListener, reply: Value) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        qmpbackup_proto::send(&mut write_half, &reply).await.unwrap();
    }

    #[tokio::test]
    async fn status_reports_frozen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(respond_once(listener, json!({"return": "frozen"})));

        let client = GuestAgentClient::new(&path);
        assert_eq!(client.status().await.unwrap(), FreezeStatus::Frozen);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn status_defaults_to_thawed_on_an_unrecognized_value() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(respond_once(listener, json!({"return": "unknown"})));

        let client = GuestAgentClient::new(&path);
        assert_eq!(client.status().await.unwrap(), FreezeStatus::Thawed);
        server.await.unwrap();
    }
}
