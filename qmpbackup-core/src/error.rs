//! Error types for the backup orchestration engine.

/// Alias for `Result<T, qmpbackup_core::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while driving a single backup run.
///
/// Every variant that can occur mid-run triggers teardown (fleecing
/// detach, qdev restore, transient bitmap cleanup) before it reaches the
/// caller; see [`crate::orchestrator::run`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A configuration precondition failed before any hypervisor state was
    /// touched: missing base image, UUID mismatch, stray `.partial` file,
    /// target already exists.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The monitor transport failed or a command returned an error reply.
    #[error("monitor error: {0}")]
    Monitor(#[from] MonitorError),

    /// A block job entered a fatal state (`aborting`, `undefined`, or
    /// concluded with `offset != len`).
    #[error("job {device} failed: {reason}")]
    Job {
        /// The device whose job failed.
        device: String,
        /// Human-readable description of the fatal state.
        reason: String,
    },

    /// A persistent bitmap disappeared or a name collision was found.
    #[error("bitmap integrity error: {0}")]
    BitmapIntegrity(String),

    /// The polling loop or a monitor round-trip observed the cancellation
    /// flag tripped by a signal handler.
    #[error("run cancelled")]
    Cancelled,

    /// Filesystem or subprocess I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A JSON payload from the monitor or a `.config` file did not match
    /// the expected shape.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Failures specific to the monitor transport, kept distinct from the
/// run-level [`Error`] so collaborators that only talk to the monitor
/// don't need to depend on job/bitmap error shapes.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum MonitorError {
    /// The socket could not be reached within `connection_retry` attempts.
    #[error("could not connect to monitor socket at {path}: {source}")]
    Connect {
        /// Path of the socket that could not be reached.
        path: String,
        /// Underlying I/O error from the final attempt.
        source: std::io::Error,
    },

    /// The wire codec failed to frame or parse a message.
    #[error(transparent)]
    Codec(#[from] qmpbackup_proto::CodecError),

    /// The monitor replied with `{"error": {...}}`.
    #[error("command {command} failed: {class}: {desc}")]
    Command {
        /// Command that was rejected.
        command: String,
        /// Machine-readable error class.
        class: String,
        /// Human-readable description.
        desc: String,
    },
}
