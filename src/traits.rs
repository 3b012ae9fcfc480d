//! The seam between the reconciliation engine and an actual server

use std::error::Error;

use async_trait::async_trait;

use crate::task::Task;

/// A server holding the authoritative copy of the task set.
///
/// The production implementation is [`CalDavRemote`](crate::client::CalDavRemote);
/// tests substitute an in-memory fake. `create` and `update` return the
/// server's view of the task (href filled in, payload normalized), which is
/// what gets written back to the cache as the reconciled state.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Every task on the server
    async fn list(&self) -> Result<Vec<Task>, Box<dyn Error>>;

    /// Upload a task that does not exist remotely yet
    async fn create(&self, task: &Task) -> Result<Task, Box<dyn Error>>;

    /// Overwrite the remote copy of an existing task
    async fn update(&self, task: &Task) -> Result<Task, Box<dyn Error>>;

    /// Remove a task from the server
    async fn delete(&self, task: &Task) -> Result<(), Box<dyn Error>>;
}
