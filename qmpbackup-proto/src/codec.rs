//! Line-delimited JSON framing over any `AsyncRead`/`AsyncWrite` stream.
//!
//! Every message, in either direction, is one `serde_json` value followed by
//! a single `\n`. There is no length prefix and no binary framing: this
//! matches the wire format QEMU's monitor and guest-agent sockets actually
//! speak, so a `qmpbackup-proto` client can be pointed at a real `qemu`
//! process without a translation layer.

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::{Incoming, Reply};

/// Failure reading or writing a framed line.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CodecError {
    /// The underlying stream returned an I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A line could not be parsed as JSON.
    #[error("malformed json line: {0}")]
    Json(#[from] serde_json::Error),
    /// The peer closed the stream before a full line arrived.
    #[error("connection closed")]
    Closed,
}

/// Result alias for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;

/// Serializes `value` and writes it as one `\n`-terminated line.
pub async fn send<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one `\n`-terminated line and parses it as an [`Incoming`] message
/// (either an event or a reply). Returns [`CodecError::Closed`] at EOF.
pub async fn recv<R>(reader: &mut R) -> Result<Incoming>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_line(reader).await?;
    Ok(serde_json::from_str(&line)?)
}

/// Reads lines until a [`Reply`] arrives, discarding any events seen along
/// the way. Used by callers that only care about the direct answer to their
/// last request and let a separate task consume the event stream.
pub async fn recv_reply<R>(reader: &mut R) -> Result<Reply>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        match recv(reader).await? {
            Incoming::Reply(reply) => return Ok(reply),
            Incoming::Event(_) => continue,
        }
    }
}

async fn read_line<R>(reader: &mut R) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(CodecError::Closed);
    }
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Request;
    use serde_json::json;
    use tokio::io::{BufReader, duplex};

    #[tokio::test]
    async fn round_trips_a_request() {
        let (mut a, b) = duplex(4096);
        let req = Request::with_arguments("query-status", json!({}));
        send(&mut a, &req).await.unwrap();

        let mut reader = BufReader::new(b);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["execute"], "query-status");
    }

    #[tokio::test]
    async fn parses_return_reply() {
        let (mut a, b) = duplex(4096);
        a.write_all(b"{\"return\": {\"status\": \"running\"}}\n")
            .await
            .unwrap();
        drop(a);

        let mut reader = BufReader::new(b);
        let reply = recv_reply(&mut reader).await.unwrap();
        let value = reply.into_result().unwrap();
        assert_eq!(value["status"], "running");
    }

    #[tokio::test]
    async fn parses_error_reply() {
        let (mut a, b) = duplex(4096);
        a.write_all(b"{\"error\": {\"class\": \"GenericError\", \"desc\": \"nope\"}}\n")
            .await
            .unwrap();
        drop(a);

        let mut reader = BufReader::new(b);
        let reply = recv_reply(&mut reader).await.unwrap();
        let err = reply.into_result().unwrap_err();
        assert_eq!(err.class, "GenericError");
        assert_eq!(err.desc, "nope");
    }

    #[tokio::test]
    async fn skips_events_before_reply() {
        let (mut a, b) = duplex(4096);
        a.write_all(
            b"{\"event\": \"BLOCK_JOB_COMPLETED\", \"data\": {}, \"timestamp\": {}}\n\
              {\"return\": {}}\n",
        )
        .await
        .unwrap();
        drop(a);

        let mut reader = BufReader::new(b);
        let reply = recv_reply(&mut reader).await.unwrap();
        assert!(matches!(reply, Reply::Return { .. }));
    }

    #[tokio::test]
    async fn closed_stream_is_an_error() {
        let (a, b) = duplex(4096);
        drop(a);
        let mut reader = BufReader::new(b);
        let err = recv(&mut reader).await.unwrap_err();
        assert!(matches!(err, CodecError::Closed));
    }
}
