//! This crate is a local-first to-do manager for CalDAV task lists
//! (`VTODO` items, as served by Nextcloud Tasks, Radicale and friends).
//!
//! Every operation works against a local SQLite cache first; talking to
//! the server only happens on explicit `pull`/`push`/`sync`. The pieces:
//!
//! * [`task`]: the task model and the three-state patch type
//! * [`diff`]: composable, invertible diffs over task sets
//! * [`cache`]: the SQLite-backed three-table task store and transaction log
//! * [`traits`]: the [`RemoteSource`](traits::RemoteSource) seam
//! * [`client`]: the CalDAV implementation of that seam
//! * [`provider`]: reconciliation (pull/push/sync) and journaled local edits
//! * [`undo`]: rolling back the newest journal entry
//! * [`cli`], [`config`], [`timeparse`], [`update`]: the command-line layer

pub mod cache;
pub mod cli;
pub mod client;
pub mod config;
pub mod diff;
pub mod ical;
pub mod provider;
pub mod task;
pub mod timeparse;
pub mod traits;
pub mod undo;
pub mod update;
mod utils;

pub use cache::{Cache, CacheError, PendingAction, UpsertOptions};
pub use client::CalDavRemote;
pub use diff::{TaskDiff, TaskSetDiff};
pub use provider::Provider;
pub use task::{Attachment, FieldPatch, Task, TaskData, TaskFilter, TaskPatch};
pub use traits::RemoteSource;
