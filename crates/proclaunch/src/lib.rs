//! proclaunch: cross-thread process launching through an out-of-process helper.
//!
//! Any number of owner threads drive processes through [`OwnerHandle`]s. All
//! process control and socket I/O happens on one launcher thread that talks
//! to a helper process over a single multiplexed connection.

mod cell;
mod channel;
mod dispatcher;
mod error;
mod launcher;
mod logging;
mod owner;
mod registry;
mod spawner;
mod worker_handle;

pub mod bridge;
pub mod helper;

pub use bridge::protocol::{ExitStatus, ProcessMode, StartRequest, Token};
pub use cell::{
    FAILED_TO_START_EXIT_CODE, FailureKind, ProcessSnapshot, ProcessState, SignalKind,
    SignalRecord,
};
pub use channel::ConnectionState;
pub use error::{LaunchError, SpawnError, UsageError};
pub use launcher::{Launcher, LauncherConfig};
pub use logging::init_tracing;
pub use owner::OwnerHandle;
pub use spawner::{HelperConnection, HelperSpawner, InProcessSpawner, ProcessSpawner};
pub use worker_handle::wake_for;
