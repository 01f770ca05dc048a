//! Monitor Client (C1) — drives the hypervisor's line-delimited JSON
//! request/response/event channel over a local Unix stream socket.
//!
//! Two connection patterns are exposed, matching §5 of the design: most
//! control-plane calls use [`MonitorClient::call`], which opens a fresh
//! connection per command so a transient hypervisor restart never wedges
//! the orchestrator. The job-watch loop instead holds one
//! [`MonitorSession`] open for its whole lifetime via
//! [`MonitorClient::open_session`], so it cannot miss a rapid status
//! transition between polls.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::sleep;
use tracing::{debug, warn};

use qmpbackup_proto::{CodecError, Request};

use crate::error::MonitorError;

/// Handle to a monitor socket. Cheap to clone; holds no connection state.
#[derive(Debug, Clone)]
pub struct MonitorClient {
    socket_path: PathBuf,
    connect_retry: u32,
}

impl MonitorClient {
    /// Creates a client for the monitor socket at `socket_path` with no
    /// connection retry (fails immediately if the socket is unreachable).
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self { socket_path: socket_path.into(), connect_retry: 0 }
    }

    /// Sets the number of one-second-spaced retries attempted before a
    /// connection failure is surfaced as fatal.
    #[must_use]
    pub const fn with_connect_retry(mut self, connect_retry: u32) -> Self {
        self.connect_retry = connect_retry;
        self
    }

    /// Issues one command over a fresh connection and returns its `return`
    /// payload, or the monitor's `{"error": ...}` translated to
    /// [`MonitorError::Command`].
    pub async fn call(
        &self,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<Value, MonitorError> {
        let stream = self.connect().await?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        send_command(&mut write_half, command, arguments).await?;
        let value = qmpbackup_proto::recv_reply(&mut reader)
            .await
            .map_err(CodecError::from)?
            .into_result()
            .map_err(|e| MonitorError::Command {
                command: command.to_owned(),
                class: e.class,
                desc: e.desc,
            })?;
        let _ = write_half.shutdown().await;
        Ok(value)
    }

    /// Opens a persistent session for the job-watch loop.
    pub async fn open_session(&self) -> Result<MonitorSession, MonitorError> {
        let stream = self.connect().await?;
        let (read_half, write_half) = stream.into_split();
        Ok(MonitorSession { reader: BufReader::new(read_half), writer: write_half })
    }

    async fn connect(&self) -> Result<UnixStream, MonitorError> {
        let mut attempt = 0;
        loop {
            match UnixStream::connect(&self.socket_path).await {
                Ok(stream) => return Ok(stream),
                Err(_source) if attempt < self.connect_retry => {
                    attempt += 1;
                    warn!(
                        path = %self.socket_path.display(),
                        attempt,
                        "monitor connect failed, retrying"
                    );
                    sleep(Duration::from_secs(1)).await;
                }
                Err(source) => {
                    return Err(MonitorError::Connect {
                        path: self.socket_path.display().to_string(),
                        source,
                    });
                }
            }
        }
    }

    /// Path of the socket this client connects to.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

/// One persistent connection to the monitor, used for the duration of a
/// job-watch loop so no status transition can be missed between polls.
#[derive(Debug)]
pub struct MonitorSession {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl MonitorSession {
    /// Issues one command on this session and returns its result.
    pub async fn call(
        &mut self,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<Value, MonitorError> {
        send_command(&mut self.writer, command, arguments).await?;
        qmpbackup_proto::recv_reply(&mut self.reader)
            .await
            .map_err(CodecError::from)?
            .into_result()
            .map_err(|e| MonitorError::Command {
                command: command.to_owned(),
                class: e.class,
                desc: e.desc,
            })
    }

    /// Waits up to `timeout` for an out-of-band event, returning `None` on
    /// timeout. Events are advisory only (§4.5): callers must never make a
    /// correctness decision on an event arriving or not, only log it.
    pub async fn poll_event(&mut self, timeout: Duration) -> Option<qmpbackup_proto::Event> {
        match tokio::time::timeout(timeout, qmpbackup_proto::recv(&mut self.reader)).await {
            Ok(Ok(qmpbackup_proto::Incoming::Event(event))) => Some(event),
            Ok(Ok(qmpbackup_proto::Incoming::Reply(_))) => {
                debug!("unexpected reply observed while polling for events");
                None
            }
            Ok(Err(err)) => {
                warn!(%err, "error polling monitor for events");
                None
            }
            Err(_) => None,
        }
    }
}

async fn send_command(
    writer: &mut (impl tokio::io::AsyncWrite + Unpin),
    command: &str,
    arguments: Option<Value>,
) -> Result<(), MonitorError> {
    let request = arguments
        .map_or_else(|| Request::new(command), |args| Request::with_arguments(command, args));
    qmpbackup_proto::send(writer, &request).await.map_err(MonitorError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;
    use tokio::io::{AsyncBufReadExt, BufReader as TokioBufReader};
    use tokio::net::UnixListener;

    async fn echo_server(listener: UnixListener) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = TokioBufReader::new(read_half);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let req: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(req["execute"], "query-status");
        let reply = json!({"return": {"status": "running"}});
        qmpbackup_proto::send(&mut write_half, &reply).await.unwrap();
    }

    #[tokio::test]
    async fn call_round_trips_through_a_real_socket() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("monitor.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(echo_server(listener));

        let client = MonitorClient::new(&path);
        let result = client.call("query-status", None).await.unwrap();
        assert_eq!(result["status"], "running");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn connect_failure_without_retry_is_immediate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nonexistent.sock");
        let client = MonitorClient::new(&path);
        let err = client.call("query-status", None).await.unwrap_err();
        assert!(matches!(err, MonitorError::Connect { .. }));
    }
}
