//! Versioned shared status areas for AFD.
//!
//! Three areas share one lifecycle: the FSA (one record per destination
//! host), the MSA (one per monitored AFD) and the FRA (one per source
//! directory). Each lives in a file `<base>.<version_id>` mapped by every
//! cooperating process; a small ID file names the current version.
//!
//! - [`StatusAreaMigrator`] publishes a new version from configuration,
//!   carrying state forward by key and marking the old one stale.
//! - [`AttachedRegion`] is what a consumer holds; [`AttachedRegion::check`]
//!   notices rotation and reattaches.
//! - [`BurstContinuation`] hands queued jobs to an already connected worker
//!   through the FSA's job status slots and a control channel.
//! - [`HeartbeatMonitor`] decides whether the supervisor is alive.

#[macro_use]
mod macros;

pub mod area;
pub mod attach;
pub mod burst;
pub mod config;
pub mod control;
mod entity_config;
pub mod error;
pub mod fra;
pub mod fsa;
pub mod heartbeat;
pub mod id_file;
pub mod job;
pub mod layout;
pub mod migrate;
pub mod msa;
pub mod record;
pub mod wait;

pub use area::StatusArea;
pub use attach::{AttachStatus, AttachedRegion};
pub use burst::{
    BurstContinuation, BurstOutcome, BurstRequest, BurstState, Continuation, accept_burst_job,
    await_burst_request,
};
pub use config::{AfdConfig, BurstConfig, HeartbeatConfig};
pub use control::{ControlRx, ControlToken, ControlTx, make_fifo};
pub use error::{ErrorClass, Op, Result, StatusError};
pub use fra::{DirConfig, DirectoryStatus};
pub use fsa::{HostConfig, HostStatus, cleanup_orphan_host};
pub use heartbeat::{HeartbeatMonitor, HeartbeatRegion, Liveness, SupervisorAction};
pub use id_file::IdFile;
pub use job::{JobDescriptor, JobStore, MessageDir};
pub use layout::{AreaKind, AreaPaths, HeaderStatus};
pub use migrate::{Migration, StatusAreaMigrator};
pub use msa::{MonitorConfig, MonitorStatus};
pub use record::{ConnectStatus, JobStatusSlot, StatusRecord};
