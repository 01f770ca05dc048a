//! Backup orchestration engine for QEMU/KVM guests.
//!
//! `qmpbackup-core` drives the full crash-consistent, live backup lifecycle
//! over the QMP monitor and guest-agent sockets: device discovery, fleecing
//! node attachment, atomic transaction construction, bitmap lifecycle, job
//! watching, and on-disk chain management. The monitor/guest-agent wire
//! framing lives in [`qmpbackup_proto`]; everything here only ever speaks
//! that protocol through [`monitor::MonitorClient`] and
//! [`guest_agent::GuestAgentClient`].
//!
//! # Quick start
//!
//! ```no_run
//! use std::path::PathBuf;
//! use std::time::Duration;
//!
//! use qmpbackup_core::cancel::CancelToken;
//! use qmpbackup_core::fleecing::FleecingOptions;
//! use qmpbackup_core::level::BackupLevel;
//! use qmpbackup_core::orchestrator::{self, RunOptions};
//!
//! # async fn run() -> qmpbackup_core::Result<()> {
//! let opts = RunOptions {
//!     backupdir: PathBuf::from("/var/backups/vm1"),
//!     level: BackupLevel::Full,
//!     include: vec![],
//!     exclude: vec![],
//!     include_raw: false,
//!     compress: false,
//!     no_subdir: false,
//!     no_timestamp: false,
//!     no_fleece: false,
//!     no_persist: false,
//!     speed_limit: 0,
//!     refresh_rate: Duration::from_secs(1),
//!     fleecing: FleecingOptions::default(),
//!     connection_retry: 3,
//!     agent_socket: None,
//!     timestamp: 0,
//! };
//! orchestrator::run(PathBuf::from("/run/vm1/monitor.sock"), opts, CancelToken::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod bitmap;
pub mod cancel;
pub mod chain;
pub mod error;
pub mod fleecing;
pub mod guest_agent;
pub mod image;
pub mod inventory;
pub mod job;
pub mod level;
pub mod monitor;
pub mod names;
pub mod orchestrator;
pub mod postprocess;
pub mod target;
pub mod transaction;

pub use error::{Error, Result};
