//! Undoing the most recent journaled operation.
//!
//! The transaction log stores forward diffs; undo pops the newest entry,
//! inverts it and applies the inverse to the cache. The operation tag
//! recorded with the entry selects a dedicated cache operation where one
//! exists (so lifecycle moves restore rows properly); anything else goes
//! through the SQL rendering of the diff.

use std::error::Error;

use crate::cache::{Cache, CacheError};
use crate::diff::{TaskDiff, TaskSetDiff};

/// What an undo did, for reporting to the user
#[derive(Debug)]
pub struct UndoOutcome {
    /// The tag of the operation that was rolled back, if it had one
    pub operation: Option<String>,
    /// The inverse diff that was applied
    pub diff: TaskSetDiff<String>,
}

/// Roll back the newest transaction log entry.
/// Returns `None` when the log is empty.
pub fn undo(cache: &Cache) -> Result<Option<UndoOutcome>, Box<dyn Error>> {
    let entry = match cache.pop_transaction()? {
        None => return Ok(None),
        Some(entry) => entry,
    };
    let inverse = entry.diff()?.inv();
    let operation = entry.operation.clone();
    log::debug!(
        "Undoing {} ({} tasks affected)",
        operation.as_deref().unwrap_or("(untagged)"),
        inverse.diffs.len()
    );

    for (uid, diff) in &inverse.diffs {
        if diff.is_noop() {
            continue;
        }
        match operation.as_deref() {
            Some("add") if diff.is_delete() => {
                cache.delete_task(uid)?;
            }
            Some("do") if diff.is_update() => {
                // The inverse diff's post side IS the pre-completion payload;
                // its status (even an unset one) is restored verbatim.
                let status = diff.post.as_ref().and_then(|d| d.status.as_deref());
                cache.restore_from_completed(uid, status)?;
            }
            Some("delete") | Some("move") if diff.is_create() => {
                match cache.restore_from_deleted(uid) {
                    Ok(_) => {}
                    // Deleting a never-synced task leaves no tombstone to
                    // restore from; rebuild the row from the diff itself.
                    Err(CacheError::NotFound { .. }) => apply_fallback(cache, uid, diff)?,
                    Err(err) => return Err(err.into()),
                }
            }
            _ => apply_fallback(cache, uid, diff)?,
        }
    }

    Ok(Some(UndoOutcome {
        operation,
        diff: inverse,
    }))
}

fn apply_fallback(cache: &Cache, uid: &str, diff: &TaskDiff) -> Result<(), Box<dyn Error>> {
    let mut single = TaskSetDiff::new();
    single.insert(uid.to_string(), diff.clone());
    let affected = cache.execute_raw(&single.as_sql())?;
    if affected == 0 {
        log::warn!("Undo touched no rows for task {}", uid);
    }
    // A restored or rewritten row carries no pending action: the next pull
    // reconciles it against whatever the server has.
    if diff.is_create() {
        if let Ok(task) = cache.get_task(uid) {
            if task.task_index.is_none() {
                cache.assign_index(uid)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{PendingAction, UpsertOptions};
    use crate::task::{Task, TaskData, STATUS_COMPLETED};

    fn cache_with_task(summary: &str) -> (Cache, Task) {
        let cache = Cache::open_in_memory().unwrap();
        let task = Task::new(TaskData::with_summary(summary));
        cache
            .upsert_task(&task, UpsertOptions::pending(PendingAction::Create))
            .unwrap();
        cache.assign_index(&task.uid).unwrap();
        let task = cache.get_task(&task.uid).unwrap();
        (cache, task)
    }

    fn log_forward(cache: &Cache, uid: &str, diff: TaskDiff, operation: &str) {
        let mut set = TaskSetDiff::new();
        set.insert(uid.to_string(), diff);
        cache.log_transaction(&set, Some(operation), 32).unwrap();
    }

    #[test]
    fn empty_log_is_a_noop() {
        let cache = Cache::open_in_memory().unwrap();
        assert!(undo(&cache).unwrap().is_none());
    }

    #[test]
    fn undo_add_removes_the_task() {
        let (cache, task) = cache_with_task("oops");
        log_forward(&cache, &task.uid, TaskDiff::create(task.data.clone()), "add");

        let outcome = undo(&cache).unwrap().unwrap();
        assert_eq!(outcome.operation.as_deref(), Some("add"));
        assert!(cache.find_task(&task.uid).unwrap().is_none());
        // The entry is consumed; a second undo finds nothing.
        assert!(undo(&cache).unwrap().is_none());
    }

    #[test]
    fn undo_do_restores_the_old_status() {
        let (cache, task) = cache_with_task("finish me");
        let completed = cache.complete_task(&task.uid).unwrap();
        log_forward(
            &cache,
            &task.uid,
            TaskDiff::update(task.data.clone(), completed.data),
            "do",
        );

        undo(&cache).unwrap().unwrap();
        let restored = cache.get_task(&task.uid).unwrap();
        // The task never had a status; the round trip must not invent one.
        assert_eq!(task.data.status, None);
        assert_eq!(restored.data.status, None);
        assert_eq!(restored.task_index, task.task_index);
    }

    #[test]
    fn undo_do_keeps_an_explicit_status() {
        let (cache, mut task) = cache_with_task("in flight");
        task.data.status = Some(crate::task::STATUS_IN_PROCESS.to_string());
        cache
            .upsert_task(&task, UpsertOptions::pending(PendingAction::Create))
            .unwrap();
        let completed = cache.complete_task(&task.uid).unwrap();
        log_forward(
            &cache,
            &task.uid,
            TaskDiff::update(task.data.clone(), completed.data),
            "do",
        );

        undo(&cache).unwrap().unwrap();
        let restored = cache.get_task(&task.uid).unwrap();
        assert_eq!(
            restored.data.status.as_deref(),
            Some(crate::task::STATUS_IN_PROCESS)
        );
        assert_ne!(restored.data.status.as_deref(), Some(STATUS_COMPLETED));
    }

    #[test]
    fn undo_delete_restores_from_tombstone() {
        let cache = Cache::open_in_memory().unwrap();
        let mut task = Task::new(TaskData::with_summary("synced then deleted"));
        task.href = Some("/cal/x.ics".to_string());
        cache.upsert_task(&task, UpsertOptions::synced(1.0)).unwrap();
        cache.assign_index(&task.uid).unwrap();
        let task = cache.get_task(&task.uid).unwrap();

        let removed = cache.mark_for_deletion(&task.uid).unwrap();
        log_forward(&cache, &task.uid, TaskDiff::delete(removed.data), "delete");

        undo(&cache).unwrap().unwrap();
        let restored = cache.get_task(&task.uid).unwrap();
        assert_eq!(restored.data.summary, task.data.summary);
        assert_eq!(restored.href, task.href);
        assert_eq!(restored.task_index, task.task_index);
        // The restored copy must be re-uploaded on the next push.
        assert_eq!(
            cache.get_pending_action(&task.uid).unwrap(),
            Some(PendingAction::Update)
        );
    }

    #[test]
    fn undo_delete_of_unsynced_task_uses_the_fallback() {
        let (cache, task) = cache_with_task("never synced");
        let removed = cache.mark_for_deletion(&task.uid).unwrap();
        log_forward(&cache, &task.uid, TaskDiff::delete(removed.data), "delete");

        undo(&cache).unwrap().unwrap();
        let restored = cache.get_task(&task.uid).unwrap();
        assert_eq!(restored.data.summary.as_deref(), Some("never synced"));
        assert!(restored.task_index.is_some());
        // Fallback rows are unsynced metadata-wise; reconciliation happens
        // on the next pull.
        assert_eq!(cache.get_pending_action(&task.uid).unwrap(), None);
    }

    #[test]
    fn undo_modify_rewrites_the_payload() {
        let (cache, task) = cache_with_task("original");
        let mut edited = task.clone();
        edited.data.summary = Some("edited".to_string());
        cache
            .upsert_task(&edited, UpsertOptions::pending(PendingAction::Update))
            .unwrap();
        log_forward(
            &cache,
            &task.uid,
            TaskDiff::update(task.data.clone(), edited.data.clone()),
            "modify",
        );

        undo(&cache).unwrap().unwrap();
        let restored = cache.get_task(&task.uid).unwrap();
        assert_eq!(restored.data.summary.as_deref(), Some("original"));
    }
}
