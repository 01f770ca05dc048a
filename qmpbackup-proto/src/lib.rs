//! Line-delimited JSON wire protocol shared by the QMP monitor channel and
//! the guest-agent channel.
//!
//! Both channels frame messages identically: one JSON object per line, no
//! length prefix, no capability handshake beyond what the caller issues as
//! an ordinary command. [`codec`] implements the framing; [`message`]
//! defines the request/reply/event shapes on top of it.

mod codec;
mod message;

pub use codec::{CodecError, Result, recv, recv_reply, send};
pub use message::{ErrorInfo, Event, Incoming, Reply, Request};
