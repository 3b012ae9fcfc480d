//! Diffs over tasks and task sets.
//!
//! A [`TaskDiff`] is a `(pre, post)` pair of optional payloads; `None` on one
//! side encodes creation or deletion. Diffs compose (`chain`), invert (`inv`)
//! and serialize to JSON, which is what makes the transaction log and the
//! undo engine possible.

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{self, Display, Write as _};

use rusqlite::types::Value;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::cache::{json_string_list, json_string_map, now_timestamp};
use crate::task::{Task, TaskData, STATUS_COMPLETED};

/// Error applying a diff to a payload it was not built from
#[derive(Debug)]
pub struct DiffMismatch {
    pub expected: Option<Box<TaskData>>,
    pub found: Option<Box<TaskData>>,
}

impl Display for DiffMismatch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "diff does not apply: expected pre-state {:?}, found {:?}",
            self.expected, self.found
        )
    }
}

impl Error for DiffMismatch {}

/// The change of a single task between two points in time
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskDiff {
    pub pre: Option<TaskData>,
    pub post: Option<TaskData>,
}

impl TaskDiff {
    pub fn create(post: TaskData) -> Self {
        Self { pre: None, post: Some(post) }
    }

    pub fn delete(pre: TaskData) -> Self {
        Self { pre: Some(pre), post: None }
    }

    pub fn update(pre: TaskData, post: TaskData) -> Self {
        Self { pre: Some(pre), post: Some(post) }
    }

    pub fn is_create(&self) -> bool {
        self.pre.is_none() && self.post.is_some()
    }

    pub fn is_delete(&self) -> bool {
        self.pre.is_some() && self.post.is_none()
    }

    pub fn is_update(&self) -> bool {
        self.pre.is_some() && self.post.is_some() && !self.is_noop()
    }

    pub fn is_noop(&self) -> bool {
        self.pre == self.post
    }

    /// Apply the diff to a current state. A recorded `pre` must match the
    /// state it is applied to; a diff without one (a creation) accepts any
    /// current state.
    pub fn apply(&self, current: Option<&TaskData>) -> Result<Option<TaskData>, DiffMismatch> {
        if self.pre.is_some() && self.pre.as_ref() != current {
            return Err(DiffMismatch {
                expected: self.pre.clone().map(Box::new),
                found: current.cloned().map(Box::new),
            });
        }
        Ok(self.post.clone())
    }

    /// Compose `self` then `other` into one diff.
    ///
    /// Well-formed chains have `self.post == other.pre`; mismatched chains
    /// are still composed (the intermediate state is simply dropped), which
    /// lets callers fold logs that contain partial snapshots. With the
    /// `strict-chain` feature on, a mismatch panics in debug builds.
    pub fn chain(&self, other: &TaskDiff) -> TaskDiff {
        #[cfg(feature = "strict-chain")]
        debug_assert_eq!(
            self.post, other.pre,
            "chained diffs disagree on the intermediate state"
        );
        TaskDiff {
            pre: self.pre.clone(),
            post: other.post.clone(),
        }
    }

    /// The inverse diff: applying `d` then `d.inv()` is the identity
    pub fn inv(&self) -> TaskDiff {
        TaskDiff {
            pre: self.post.clone(),
            post: self.pre.clone(),
        }
    }

    fn subject(&self) -> &str {
        self.post
            .as_ref()
            .or(self.pre.as_ref())
            .and_then(|d| d.summary.as_deref())
            .unwrap_or("(no summary)")
    }
}

/// A keyed collection of [`TaskDiff`]s.
///
/// Keys are uids for log/undo purposes, or stable indices when reporting a
/// pull to the user. `BTreeMap` keeps output deterministic.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSetDiff<K: Ord> {
    pub diffs: BTreeMap<K, TaskDiff>,
}

impl<K: Ord + Clone> TaskSetDiff<K> {
    pub fn new() -> Self {
        Self { diffs: BTreeMap::new() }
    }

    pub fn insert(&mut self, key: K, diff: TaskDiff) {
        self.diffs.insert(key, diff);
    }

    pub fn is_empty(&self) -> bool {
        self.diffs.values().all(|d| d.is_noop())
    }

    pub fn created_count(&self) -> usize {
        self.diffs.values().filter(|d| d.is_create()).count()
    }

    pub fn updated_count(&self) -> usize {
        self.diffs.values().filter(|d| d.is_update()).count()
    }

    pub fn deleted_count(&self) -> usize {
        self.diffs.values().filter(|d| d.is_delete()).count()
    }

    /// Pointwise composition. Keys present on one side only are carried over
    /// unchanged.
    pub fn chain(&self, other: &TaskSetDiff<K>) -> TaskSetDiff<K> {
        let mut out = self.diffs.clone();
        for (key, next) in &other.diffs {
            match out.get(key) {
                Some(prev) => {
                    let chained = prev.chain(next);
                    out.insert(key.clone(), chained);
                }
                None => {
                    out.insert(key.clone(), next.clone());
                }
            }
        }
        TaskSetDiff { diffs: out }
    }

    pub fn inv(&self) -> TaskSetDiff<K> {
        TaskSetDiff {
            diffs: self
                .diffs
                .iter()
                .map(|(k, d)| (k.clone(), d.inv()))
                .collect(),
        }
    }

    /// Re-key the diff, e.g. from stable indices to uids
    pub fn map_keys<K2, F>(&self, mut f: F) -> TaskSetDiff<K2>
    where
        K2: Ord + Clone,
        F: FnMut(&K) -> K2,
    {
        TaskSetDiff {
            diffs: self.diffs.iter().map(|(k, d)| (f(k), d.clone())).collect(),
        }
    }
}

impl<K: Ord + Clone + Display> TaskSetDiff<K> {
    /// Human-readable multi-line report, grouped by kind of change
    pub fn pretty(&self) -> String {
        let mut out = String::new();
        let buckets: [(&str, char, fn(&TaskDiff) -> bool); 3] = [
            ("Created", '+', TaskDiff::is_create),
            ("Updated", '~', TaskDiff::is_update),
            ("Deleted", '-', TaskDiff::is_delete),
        ];
        for (label, marker, belongs) in &buckets {
            let entries: Vec<_> = self.diffs.iter().filter(|(_, d)| belongs(*d)).collect();
            if entries.is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push('\n');
            }
            let _ = writeln!(out, "{} ({}):", label, entries.len());
            for (key, diff) in entries {
                let _ = writeln!(out, "  {} [{}] {}", marker, key, diff.subject());
            }
        }
        if out.is_empty() {
            out.push_str("No changes.\n");
        }
        out
    }
}

impl<K: Ord + Clone + Serialize> TaskSetDiff<K> {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.diffs)
    }
}

impl<K: Ord + Clone + DeserializeOwned> TaskSetDiff<K> {
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        Ok(Self { diffs: serde_json::from_str(raw)? })
    }
}

impl TaskSetDiff<String> {
    /// Diff two task lists, keyed by uid. Unchanged tasks are omitted.
    pub fn from_task_lists(before: &[Task], after: &[Task]) -> Self {
        let pre: BTreeMap<&str, &Task> = before.iter().map(|t| (t.uid.as_str(), t)).collect();
        let post: BTreeMap<&str, &Task> = after.iter().map(|t| (t.uid.as_str(), t)).collect();
        let mut diffs = BTreeMap::new();
        for (uid, task) in &post {
            match pre.get(uid) {
                None => {
                    diffs.insert(uid.to_string(), TaskDiff::create(task.data.clone()));
                }
                Some(old) if old.data != task.data => {
                    diffs.insert(
                        uid.to_string(),
                        TaskDiff::update(old.data.clone(), task.data.clone()),
                    );
                }
                Some(_) => {}
            }
        }
        for (uid, task) in &pre {
            if !post.contains_key(uid) {
                diffs.insert(uid.to_string(), TaskDiff::delete(task.data.clone()));
            }
        }
        Self { diffs }
    }

    /// Render the diff as SQL statements against the local cache tables.
    ///
    /// This is the last-resort way of applying a diff, used by the undo
    /// engine when no dedicated cache operation matches. Creations land in
    /// the completed table when the payload says `COMPLETED`, in the active
    /// table otherwise, and carry no pending action.
    pub fn as_sql(&self) -> Vec<SqlStatement> {
        let mut stmts = Vec::new();
        let now = now_timestamp();
        for (uid, diff) in &self.diffs {
            if diff.is_noop() {
                continue;
            }
            match (&diff.pre, &diff.post) {
                (None, Some(post)) => {
                    let completed = post.status.as_deref() == Some(STATUS_COMPLETED);
                    let table = if completed { "completed_tasks" } else { "tasks" };
                    let extra_col = if completed { "completed_at" } else { "updated_at" };
                    let mut params = data_params(uid, post);
                    params.push(Value::Real(now));
                    stmts.push(SqlStatement {
                        sql: format!(
                            "INSERT OR REPLACE INTO {} \
                             (uid, summary, status, due, wait, due_utc, wait_utc, priority, \
                              x_properties, categories, url, attachments, {}) \
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                            table, extra_col
                        ),
                        params,
                    });
                }
                (Some(_), None) => {
                    stmts.push(SqlStatement {
                        sql: "DELETE FROM tasks WHERE uid = ?1".to_string(),
                        params: vec![Value::Text(uid.clone())],
                    });
                }
                (Some(_), Some(post)) => {
                    let mut params = data_params(uid, post);
                    params.push(Value::Real(now));
                    stmts.push(SqlStatement {
                        sql: "UPDATE tasks SET summary = ?2, status = ?3, due = ?4, wait = ?5, \
                              due_utc = ?6, wait_utc = ?7, priority = ?8, x_properties = ?9, \
                              categories = ?10, url = ?11, attachments = ?12, updated_at = ?13 \
                              WHERE uid = ?1"
                            .to_string(),
                        params,
                    });
                }
                (None, None) => {}
            }
        }
        stmts
    }
}

/// A single parameterized statement produced by [`TaskSetDiff::as_sql`]
#[derive(Clone, Debug)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

fn opt_text(value: Option<&str>) -> Value {
    match value {
        Some(s) => Value::Text(s.to_string()),
        None => Value::Null,
    }
}

fn data_params(uid: &str, data: &TaskData) -> Vec<Value> {
    vec![
        Value::Text(uid.to_string()),
        opt_text(data.summary.as_deref()),
        opt_text(data.status.as_deref()),
        match &data.due {
            Some(dt) => Value::Text(dt.to_rfc3339()),
            None => Value::Null,
        },
        match &data.wait {
            Some(dt) => Value::Text(dt.to_rfc3339()),
            None => Value::Null,
        },
        match &data.due {
            Some(dt) => Value::Real(dt.timestamp() as f64),
            None => Value::Null,
        },
        match &data.wait {
            Some(dt) => Value::Real(dt.timestamp() as f64),
            None => Value::Null,
        },
        match data.priority {
            Some(p) => Value::Integer(p as i64),
            None => Value::Null,
        },
        Value::Text(json_string_map(&data.x_properties)),
        match &data.categories {
            Some(c) => Value::Text(json_string_list(c)),
            None => Value::Null,
        },
        opt_text(data.url.as_deref()),
        Value::Text(
            serde_json::to_string(&data.attachments).unwrap_or_else(|_| "[]".to_string()),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskData;

    fn data(summary: &str) -> TaskData {
        TaskData::with_summary(summary)
    }

    #[test]
    fn apply_checks_pre_state() {
        let d = TaskDiff::update(data("a"), data("b"));
        assert_eq!(d.apply(Some(&data("a"))).unwrap(), Some(data("b")));
        assert!(d.apply(Some(&data("c"))).is_err());
        assert!(d.apply(None).is_err());
    }

    #[test]
    fn creation_applies_over_any_state() {
        let d = TaskDiff::create(data("b"));
        assert_eq!(d.apply(None).unwrap(), Some(data("b")));
        // No recorded pre means no pre to mismatch against.
        assert_eq!(d.apply(Some(&data("a"))).unwrap(), Some(data("b")));
    }

    #[test]
    fn inverse_law() {
        let cases = vec![
            TaskDiff::create(data("a")),
            TaskDiff::delete(data("a")),
            TaskDiff::update(data("a"), data("b")),
        ];
        for d in cases {
            let roundtrip = d.chain(&d.inv());
            assert_eq!(roundtrip.pre, roundtrip.post);
            assert_eq!(d.inv().inv(), d);
        }
    }

    #[test]
    fn chain_composes_endpoints() {
        let ab = TaskDiff::update(data("a"), data("b"));
        let bc = TaskDiff::update(data("b"), data("c"));
        assert_eq!(ab.chain(&bc), TaskDiff::update(data("a"), data("c")));
    }

    #[test]
    fn set_chain_carries_disjoint_keys() {
        let mut first = TaskSetDiff::new();
        first.insert("x".to_string(), TaskDiff::create(data("a")));
        let mut second = TaskSetDiff::new();
        second.insert("y".to_string(), TaskDiff::delete(data("b")));
        second.insert(
            "x".to_string(),
            TaskDiff::update(data("a"), data("a2")),
        );
        let chained = first.chain(&second);
        assert_eq!(chained.diffs["x"], TaskDiff::create(data("a2")));
        assert_eq!(chained.diffs["y"], TaskDiff::delete(data("b")));
    }

    #[test]
    fn from_task_lists_classifies_changes() {
        let before = vec![
            Task::with_uid("keep", data("same")),
            Task::with_uid("edit", data("old")),
            Task::with_uid("gone", data("bye")),
        ];
        let after = vec![
            Task::with_uid("keep", data("same")),
            Task::with_uid("edit", data("new")),
            Task::with_uid("born", data("hi")),
        ];
        let diff = TaskSetDiff::from_task_lists(&before, &after);
        assert_eq!(diff.diffs.len(), 3);
        assert!(diff.diffs["born"].is_create());
        assert!(diff.diffs["edit"].is_update());
        assert!(diff.diffs["gone"].is_delete());
        assert_eq!(diff.created_count(), 1);
        assert_eq!(diff.updated_count(), 1);
        assert_eq!(diff.deleted_count(), 1);
    }

    #[test]
    fn json_round_trip() {
        let mut diff = TaskSetDiff::new();
        let mut payload = data("Water plants");
        payload.priority = Some(3);
        payload.categories = Some(vec!["home".to_string()]);
        diff.insert("uid-1".to_string(), TaskDiff::create(payload));
        diff.insert(
            "uid-2".to_string(),
            TaskDiff::update(data("a"), data("b")),
        );
        let json = diff.to_json().unwrap();
        let back = TaskSetDiff::<String>::from_json(&json).unwrap();
        assert_eq!(back, diff);
    }

    #[test]
    fn pretty_groups_by_kind() {
        let mut diff = TaskSetDiff::new();
        diff.insert(1i64, TaskDiff::create(data("new one")));
        diff.insert(2i64, TaskDiff::delete(data("old one")));
        let report = diff.pretty();
        assert!(report.contains("Created (1):"));
        assert!(report.contains("  + [1] new one"));
        assert!(report.contains("Deleted (1):"));
        assert!(report.contains("  - [2] old one"));

        let empty: TaskSetDiff<i64> = TaskSetDiff::new();
        assert_eq!(empty.pretty(), "No changes.\n");
    }

    #[test]
    fn as_sql_routes_completed_creates() {
        let mut completed = data("done thing");
        completed.status = Some(STATUS_COMPLETED.to_string());
        let mut diff = TaskSetDiff::new();
        diff.insert("done".to_string(), TaskDiff::create(completed));
        diff.insert("fresh".to_string(), TaskDiff::create(data("todo thing")));
        diff.insert("gone".to_string(), TaskDiff::delete(data("bye")));
        let stmts = diff.as_sql();
        assert_eq!(stmts.len(), 3);
        assert!(stmts[0].sql.contains("INSERT OR REPLACE INTO completed_tasks"));
        assert!(stmts[1].sql.contains("INSERT OR REPLACE INTO tasks"));
        assert!(stmts[2].sql.starts_with("DELETE FROM tasks"));
    }
}
