//! The reconciliation engine: a local cache plus a remote source, and the
//! pull/push/sync operations that keep the two in agreement.
//!
//! All local edits made through a [`Provider`] are journaled into the
//! cache's transaction log so they can be undone.

use std::error::Error;

use crate::cache::{
    now_timestamp, Cache, PendingAction, UpsertOptions, DEFAULT_LOG_LIMIT,
};
use crate::diff::{TaskDiff, TaskSetDiff};
use crate::task::{Attachment, Task, TaskData, TaskPatch, STATUS_NEEDS_ACTION};
use crate::traits::RemoteSource;

/// What a pull did, reported keyed by stable index so users can act on it
#[derive(Debug)]
pub struct PullOutcome {
    /// How many tasks the server handed back
    pub fetched: usize,
    pub diff: TaskSetDiff<i64>,
}

/// What a push did
#[derive(Debug)]
pub struct PushOutcome {
    pub diff: TaskSetDiff<i64>,
}

#[derive(Debug)]
pub struct SyncOutcome {
    pub pull: PullOutcome,
    pub push: PushOutcome,
}

/// A task cache reconciled against a remote source
pub struct Provider<R: RemoteSource> {
    remote: R,
    cache: Cache,
    log_limit: usize,
}

impl<R: RemoteSource> Provider<R> {
    /// The transaction log length comes from `CALDO_LOG_LIMIT` when set
    pub fn new(remote: R, cache: Cache) -> Self {
        let log_limit = std::env::var("CALDO_LOG_LIMIT")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(DEFAULT_LOG_LIMIT);
        Self {
            remote,
            cache,
            log_limit,
        }
    }

    pub fn with_log_limit(remote: R, cache: Cache, log_limit: usize) -> Self {
        Self {
            remote,
            cache,
            log_limit,
        }
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    /* Reconciliation */

    /// Fetch the server's task set and make the cache agree with it,
    /// keeping local pending edits and tombstones intact.
    pub async fn pull(&self) -> Result<PullOutcome, Box<dyn Error>> {
        let before = self.cache.list_tasks(None)?;
        let remote = self.remote.list().await?;
        log::info!("Pulled {} tasks from the server", remote.len());
        self.cache.replace_remote_tasks(&remote)?;
        let after = self.cache.list_tasks(None)?;

        // Report by stable index: the post-pull index when the task still
        // exists, its old index when it disappeared.
        let mut diff = TaskSetDiff::new();
        let pre: std::collections::BTreeMap<&str, &Task> =
            before.iter().map(|t| (t.uid.as_str(), t)).collect();
        let post: std::collections::BTreeMap<&str, &Task> =
            after.iter().map(|t| (t.uid.as_str(), t)).collect();
        for (uid, task) in &post {
            let old = pre.get(uid);
            if old.map(|t| &t.data) == Some(&task.data) {
                continue;
            }
            let key = match task.task_index.or_else(|| old.and_then(|t| t.task_index)) {
                Some(key) => key,
                None => {
                    log::warn!("Task {} has no stable index, not reporting it", uid);
                    continue;
                }
            };
            diff.insert(
                key,
                TaskDiff {
                    pre: old.map(|t| t.data.clone()),
                    post: Some(task.data.clone()),
                },
            );
        }
        for (uid, task) in &pre {
            if post.contains_key(uid) {
                continue;
            }
            if let Some(key) = task.task_index {
                diff.insert(key, TaskDiff::delete(task.data.clone()));
            }
        }

        Ok(PullOutcome {
            fetched: remote.len(),
            diff,
        })
    }

    /// Upload every pending local change. Entries already pushed stay
    /// marked clean even if a later entry fails, so a retry resumes where
    /// the failure happened.
    pub async fn push(&self) -> Result<PushOutcome, Box<dyn Error>> {
        let dirty = self.cache.dirty_tasks()?;
        log::info!("Pushing {} pending changes", dirty.len());
        let mut diff = TaskSetDiff::new();
        for entry in dirty {
            let task = entry.task;
            let record = match entry.action {
                PendingAction::Create => {
                    log::debug!("Pushing new task {}", task.uid);
                    let synced = self.remote.create(&task).await?;
                    self.cache.mark_synced(&synced, now_timestamp())?;
                    TaskDiff::create(task.data.clone())
                }
                PendingAction::Update => {
                    log::debug!("Pushing update of {}", task.uid);
                    let synced = self.remote.update(&task).await?;
                    self.cache.mark_synced(&synced, now_timestamp())?;
                    // The pre-edit payload is long gone locally; an empty
                    // pre still yields the right post state when replayed.
                    TaskDiff::update(TaskData::default(), task.data.clone())
                }
                PendingAction::Delete => {
                    log::debug!("Pushing deletion of {}", task.uid);
                    self.remote.delete(&task).await?;
                    self.cache.delete_task(&task.uid)?;
                    self.cache.flush_deleted(&task.uid)?;
                    TaskDiff::delete(task.data.clone())
                }
            };
            match task.task_index {
                Some(index) => diff.insert(index, record),
                None => log::debug!("Pushed {} without a stable index", task.uid),
            }
        }
        Ok(PushOutcome { diff })
    }

    /// Pull then push
    pub async fn sync(&self) -> Result<SyncOutcome, Box<dyn Error>> {
        let pull = self.pull().await?;
        let push = self.push().await?;
        Ok(SyncOutcome { pull, push })
    }

    /* Local edits. Each successful operation is journaled for undo. */

    /// Create a task locally, pending upload
    pub fn add(&self, mut data: TaskData) -> Result<Task, Box<dyn Error>> {
        if data.status.is_none() {
            data.status = Some(STATUS_NEEDS_ACTION.to_string());
        }
        let task = Task::new(data);
        self.cache
            .upsert_task(&task, UpsertOptions::pending(PendingAction::Create))?;
        self.cache.assign_index(&task.uid)?;
        let stored = self.cache.get_task(&task.uid)?;

        let mut diff = TaskSetDiff::new();
        diff.insert(stored.uid.clone(), TaskDiff::create(stored.data.clone()));
        self.cache.log_transaction(&diff, Some("add"), self.log_limit)?;
        Ok(stored)
    }

    /// Apply one patch to several tasks. `operation` names the user action
    /// ("modify", "start", "stop") for the journal.
    pub fn modify(
        &self,
        tasks: &[Task],
        patch: &TaskPatch,
        operation: &str,
    ) -> Result<TaskSetDiff<String>, Box<dyn Error>> {
        let mut diff = TaskSetDiff::new();
        for task in tasks {
            let merged = patch.apply(&task.data);
            if merged == task.data {
                continue;
            }
            let pending = match self.cache.get_pending_action(&task.uid)? {
                Some(PendingAction::Create) => PendingAction::Create,
                _ => PendingAction::Update,
            };
            let mut updated = task.clone();
            updated.data = merged.clone();
            self.cache
                .upsert_task(&updated, UpsertOptions::pending(pending))?;
            diff.insert(
                task.uid.clone(),
                TaskDiff::update(task.data.clone(), merged),
            );
        }
        self.cache
            .log_transaction(&diff, Some(operation), self.log_limit)?;
        Ok(diff)
    }

    /// Mark tasks done and move them out of the active listing
    pub fn complete(&self, tasks: &[Task]) -> Result<TaskSetDiff<String>, Box<dyn Error>> {
        let mut diff = TaskSetDiff::new();
        for task in tasks {
            let completed = self.cache.complete_task(&task.uid)?;
            diff.insert(
                task.uid.clone(),
                TaskDiff::update(task.data.clone(), completed.data),
            );
        }
        self.cache.log_transaction(&diff, Some("do"), self.log_limit)?;
        Ok(diff)
    }

    /// Delete tasks locally, pending remote deletion
    pub fn delete(&self, tasks: &[Task]) -> Result<TaskSetDiff<String>, Box<dyn Error>> {
        let mut diff = TaskSetDiff::new();
        for task in tasks {
            let removed = self.cache.mark_for_deletion(&task.uid)?;
            diff.insert(task.uid.clone(), TaskDiff::delete(removed.data));
        }
        self.cache
            .log_transaction(&diff, Some("delete"), self.log_limit)?;
        Ok(diff)
    }

    /// Add an attachment to each task
    pub fn attach(
        &self,
        tasks: &[Task],
        attachment: &Attachment,
    ) -> Result<TaskSetDiff<String>, Box<dyn Error>> {
        let mut diff = TaskSetDiff::new();
        for task in tasks {
            let mut merged = task.data.clone();
            merged.attachments.push(attachment.clone());
            let pending = match self.cache.get_pending_action(&task.uid)? {
                Some(PendingAction::Create) => PendingAction::Create,
                _ => PendingAction::Update,
            };
            let mut updated = task.clone();
            updated.data = merged.clone();
            self.cache
                .upsert_task(&updated, UpsertOptions::pending(pending))?;
            diff.insert(
                task.uid.clone(),
                TaskDiff::update(task.data.clone(), merged),
            );
        }
        self.cache
            .log_transaction(&diff, Some("attach"), self.log_limit)?;
        Ok(diff)
    }

    /// Move tasks to another environment: they become pending creations
    /// over there and pending deletions here (synced ones leave a tombstone
    /// so the server copy goes away on the next push).
    pub fn move_to(
        &self,
        tasks: &[Task],
        destination: &Cache,
    ) -> Result<TaskSetDiff<String>, Box<dyn Error>> {
        let mut diff = TaskSetDiff::new();
        for task in tasks {
            let mut transplanted = task.clone();
            transplanted.href = None;
            transplanted.task_index = None;
            destination.upsert_task(
                &transplanted,
                UpsertOptions::pending(PendingAction::Create),
            )?;
            destination.assign_index(&transplanted.uid)?;

            let removed = self.cache.mark_for_deletion(&task.uid)?;
            diff.insert(task.uid.clone(), TaskDiff::delete(removed.data));
        }
        self.cache
            .log_transaction(&diff, Some("move"), self.log_limit)?;
        Ok(diff)
    }
}
