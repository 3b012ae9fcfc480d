//! The local task cache, backed by SQLite.
//!
//! Tasks live in one of three tables depending on their lifecycle state:
//! `tasks` (active), `completed_tasks` and `deleted_tasks`. Rows move between
//! tables on complete/delete/restore and keep their uid, href and stable
//! index along the way. A fourth table, `transaction_log`, holds the bounded
//! FIFO of JSON diffs the undo engine consumes.
//!
//! All methods take `&self` and serialize access through a mutex around the
//! connection. `assign_index` in particular performs its scan-and-write under
//! a single lock acquisition, which is what keeps concurrently allocated
//! indices unique.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::error::Error;
use std::fmt::{self, Display};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};

use crate::diff::{SqlStatement, TaskSetDiff};
use crate::task::{Attachment, Task, TaskData, TaskFilter, STATUS_COMPLETED};

/// Default number of entries kept in the transaction log
pub const DEFAULT_LOG_LIMIT: usize = 32;

/// Errors from the local cache
#[derive(Debug)]
pub enum CacheError {
    /// No row for this uid in the table the operation targets
    NotFound { table: &'static str, uid: String },
    Sql(rusqlite::Error),
    Io(std::io::Error),
    Json(serde_json::Error),
}

impl Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CacheError::NotFound { table, uid } => {
                write!(f, "no task {:?} in {}", uid, table)
            }
            CacheError::Sql(err) => write!(f, "cache database error: {}", err),
            CacheError::Io(err) => write!(f, "cache I/O error: {}", err),
            CacheError::Json(err) => write!(f, "corrupt cached value: {}", err),
        }
    }
}

impl Error for CacheError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CacheError::NotFound { .. } => None,
            CacheError::Sql(err) => Some(err),
            CacheError::Io(err) => Some(err),
            CacheError::Json(err) => Some(err),
        }
    }
}

impl From<rusqlite::Error> for CacheError {
    fn from(err: rusqlite::Error) -> Self {
        CacheError::Sql(err)
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(err)
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Json(err)
    }
}

/// What still has to be told to the server about a task
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PendingAction {
    Create,
    Update,
    Delete,
}

impl PendingAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingAction::Create => "create",
            PendingAction::Update => "update",
            PendingAction::Delete => "delete",
        }
    }

    fn parse(raw: Option<&str>) -> Option<Self> {
        match raw {
            Some("create") => Some(PendingAction::Create),
            Some("update") => Some(PendingAction::Update),
            Some("delete") => Some(PendingAction::Delete),
            _ => None,
        }
    }
}

/// A task that needs pushing, together with the kind of push it needs
#[derive(Clone, Debug)]
pub struct DirtyTask {
    pub task: Task,
    pub action: PendingAction,
}

/// One entry of the bounded transaction log
#[derive(Clone, Debug)]
pub struct TransactionLogEntry {
    pub id: i64,
    pub diff_json: String,
    pub operation: Option<String>,
    pub created_at: f64,
}

impl TransactionLogEntry {
    pub fn diff(&self) -> Result<TaskSetDiff<String>, CacheError> {
        Ok(TaskSetDiff::from_json(&self.diff_json)?)
    }
}

/// Optional overrides for [`Cache::upsert_task`].
///
/// Fields left at their defaults mean "preserve whatever the existing row
/// has". This makes the partial-update semantics of an upsert explicit
/// instead of being spread over keyword arguments.
#[derive(Clone, Copy, Debug, Default)]
pub struct UpsertOptions {
    /// Set the pending action (ignored when `clear_pending` is on)
    pub pending_action: Option<PendingAction>,
    /// Mark the row as clean, e.g. right after a successful push
    pub clear_pending: bool,
    /// Record when the row was last seen on the server
    pub last_synced: Option<f64>,
    /// Force a stable index. Takes precedence over both the task's own
    /// index and the existing row's.
    pub task_index: Option<i64>,
}

impl UpsertOptions {
    pub fn pending(action: PendingAction) -> Self {
        Self {
            pending_action: Some(action),
            ..Self::default()
        }
    }

    pub fn synced(timestamp: f64) -> Self {
        Self {
            clear_pending: true,
            last_synced: Some(timestamp),
            ..Self::default()
        }
    }
}

const SCHEMA: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA foreign_keys = ON;

    CREATE TABLE IF NOT EXISTS tasks (
        uid            TEXT PRIMARY KEY,
        summary        TEXT,
        status         TEXT,
        due            TEXT,
        wait           TEXT,
        due_utc        REAL,
        wait_utc       REAL,
        priority       INTEGER,
        x_properties   TEXT,
        categories     TEXT,
        url            TEXT,
        attachments    TEXT,
        href           TEXT,
        pending_action TEXT,
        last_synced    REAL,
        updated_at     REAL,
        task_index     INTEGER UNIQUE
    );

    CREATE TABLE IF NOT EXISTS completed_tasks (
        uid            TEXT PRIMARY KEY,
        summary        TEXT,
        status         TEXT,
        due            TEXT,
        wait           TEXT,
        due_utc        REAL,
        wait_utc       REAL,
        priority       INTEGER,
        x_properties   TEXT,
        categories     TEXT,
        url            TEXT,
        attachments    TEXT,
        href           TEXT,
        pending_action TEXT,
        last_synced    REAL,
        completed_at   REAL,
        task_index     INTEGER
    );

    CREATE TABLE IF NOT EXISTS deleted_tasks (
        uid            TEXT PRIMARY KEY,
        summary        TEXT,
        status         TEXT,
        due            TEXT,
        wait           TEXT,
        due_utc        REAL,
        wait_utc       REAL,
        priority       INTEGER,
        x_properties   TEXT,
        categories     TEXT,
        url            TEXT,
        attachments    TEXT,
        href           TEXT,
        last_synced    REAL,
        deleted_at     REAL,
        task_index     INTEGER
    );

    CREATE TABLE IF NOT EXISTS transaction_log (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        diff       TEXT NOT NULL,
        operation  TEXT,
        created_at REAL NOT NULL
    );
";

const TASK_COLUMNS: &str =
    "uid, summary, status, due, wait, priority, x_properties, categories, url, attachments, href, task_index";

/// The cache itself. Cheap to share behind an `Arc`; all methods are `&self`.
pub struct Cache {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl Cache {
    /// Open (and create if needed) the cache for an environment.
    ///
    /// The location is, in order of precedence: the explicit `path`, the
    /// `CALDO_CACHE_FILE` environment variable, or
    /// `<cache dir>/caldo/<env>/tasks.db`.
    pub fn open(path: Option<PathBuf>, env: &str) -> Result<Self, CacheError> {
        let path = resolve_cache_path(path, env);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    /// In-memory cache, mostly useful in tests
    pub fn open_in_memory() -> Result<Self, CacheError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned lock means a thread panicked mid-statement; the
        // connection itself is still usable.
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /* Listing */

    /// Every active task, due dates ascending with undated tasks last
    pub fn list_tasks(&self, filter: Option<&TaskFilter>) -> Result<Vec<Task>, CacheError> {
        self.select_tasks(filter, None)
    }

    /// Active tasks whose wait date has passed (or that have none)
    pub fn list_ready_tasks(&self, filter: Option<&TaskFilter>) -> Result<Vec<Task>, CacheError> {
        self.select_tasks(
            filter,
            Some(("(wait_utc IS NULL OR wait_utc <= ?)", now_timestamp())),
        )
    }

    /// Active tasks hidden behind a future wait date, soonest first
    pub fn list_waiting_tasks(
        &self,
        filter: Option<&TaskFilter>,
    ) -> Result<Vec<Task>, CacheError> {
        let mut tasks = self.select_tasks(filter, Some(("wait_utc > ?", now_timestamp())))?;
        tasks.sort_by_key(|t| t.data.wait);
        Ok(tasks)
    }

    /// Completed tasks, most recently completed first
    pub fn list_completed_tasks(&self) -> Result<Vec<Task>, CacheError> {
        self.list_lifecycle_table("completed_tasks", "completed_at DESC")
    }

    /// Tasks awaiting remote deletion, oldest first
    pub fn list_deleted_tasks(&self) -> Result<Vec<Task>, CacheError> {
        self.list_lifecycle_table("deleted_tasks", "deleted_at")
    }

    fn list_lifecycle_table(
        &self,
        table: &str,
        order: &str,
    ) -> Result<Vec<Task>, CacheError> {
        let conn = self.conn();
        let sql = format!("SELECT {} FROM {} ORDER BY {}", TASK_COLUMNS, table, order);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_task)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    /// Ready tasks without a priority, for interactive triage
    pub fn list_unprioritized_tasks(
        &self,
        filter: Option<&TaskFilter>,
    ) -> Result<Vec<Task>, CacheError> {
        let mut tasks = self.list_ready_tasks(filter)?;
        tasks.retain(|t| t.data.priority.is_none());
        Ok(tasks)
    }

    fn select_tasks(
        &self,
        filter: Option<&TaskFilter>,
        extra: Option<(&str, f64)>,
    ) -> Result<Vec<Task>, CacheError> {
        let mut conditions: Vec<String> = Vec::new();
        let mut params: Vec<Value> = Vec::new();
        if let Some(filter) = filter {
            filter_conditions(filter, &mut conditions, &mut params);
        }
        if let Some((cond, value)) = extra {
            conditions.push(cond.to_string());
            params.push(Value::Real(value));
        }
        let mut sql = format!("SELECT {} FROM tasks", TASK_COLUMNS);
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY due_utc IS NULL, due_utc, task_index");

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params), row_to_task)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    /// Distinct tags across active tasks, sorted
    pub fn list_tags(&self) -> Result<Vec<String>, CacheError> {
        let mut tags = BTreeSet::new();
        for task in self.list_tasks(None)? {
            if let Some(categories) = task.data.categories {
                tags.extend(categories);
            }
        }
        Ok(tags.into_iter().collect())
    }

    /// Distinct project names across active tasks, sorted
    pub fn list_projects(&self) -> Result<Vec<String>, CacheError> {
        let mut projects = BTreeSet::new();
        for task in self.list_tasks(None)? {
            if let Some(project) = task.data.project() {
                projects.insert(project.to_string());
            }
        }
        Ok(projects.into_iter().collect())
    }

    /* Point lookups */

    pub fn find_task(&self, uid: &str) -> Result<Option<Task>, CacheError> {
        let conn = self.conn();
        let sql = format!("SELECT {} FROM tasks WHERE uid = ?1", TASK_COLUMNS);
        Ok(conn
            .query_row(&sql, [uid], row_to_task)
            .optional()?)
    }

    pub fn get_task(&self, uid: &str) -> Result<Task, CacheError> {
        self.find_task(uid)?.ok_or_else(|| CacheError::NotFound {
            table: "tasks",
            uid: uid.to_string(),
        })
    }

    pub fn get_task_by_index(&self, index: i64) -> Result<Option<Task>, CacheError> {
        let conn = self.conn();
        let sql = format!("SELECT {} FROM tasks WHERE task_index = ?1", TASK_COLUMNS);
        Ok(conn.query_row(&sql, [index], row_to_task).optional()?)
    }

    pub fn get_completed_task(&self, uid: &str) -> Result<Option<Task>, CacheError> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM completed_tasks WHERE uid = ?1",
            TASK_COLUMNS
        );
        Ok(conn.query_row(&sql, [uid], row_to_task).optional()?)
    }

    pub fn get_deleted_task(&self, uid: &str) -> Result<Option<Task>, CacheError> {
        let conn = self.conn();
        let sql = format!("SELECT {} FROM deleted_tasks WHERE uid = ?1", TASK_COLUMNS);
        Ok(conn.query_row(&sql, [uid], row_to_task).optional()?)
    }

    /// What (if anything) still needs to be pushed for this uid
    pub fn get_pending_action(&self, uid: &str) -> Result<Option<PendingAction>, CacheError> {
        let conn = self.conn();
        let deleted: Option<String> = conn
            .query_row("SELECT uid FROM deleted_tasks WHERE uid = ?1", [uid], |r| {
                r.get(0)
            })
            .optional()?;
        if deleted.is_some() {
            return Ok(Some(PendingAction::Delete));
        }
        for table in &["tasks", "completed_tasks"] {
            let pending: Option<Option<String>> = conn
                .query_row(
                    &format!("SELECT pending_action FROM {} WHERE uid = ?1", table),
                    [uid],
                    |r| r.get(0),
                )
                .optional()?;
            if let Some(raw) = pending {
                return Ok(PendingAction::parse(raw.as_deref()));
            }
        }
        Ok(None)
    }

    /* Writes */

    /// Insert or update an active task.
    ///
    /// Sync metadata not named in `opts` is preserved from the existing row,
    /// so a payload-only caller cannot accidentally wipe the pending action,
    /// last-synced stamp or stable index.
    pub fn upsert_task(&self, task: &Task, opts: UpsertOptions) -> Result<(), CacheError> {
        let conn = self.conn();
        let existing: Option<(Option<String>, Option<f64>, Option<i64>, Option<String>)> = conn
            .query_row(
                "SELECT pending_action, last_synced, task_index, href FROM tasks WHERE uid = ?1",
                [task.uid.as_str()],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()?;
        let (old_pending, old_synced, old_index, old_href) = existing.unwrap_or_default();

        let pending = if opts.clear_pending {
            None
        } else {
            opts.pending_action
                .or_else(|| PendingAction::parse(old_pending.as_deref()))
        };
        let last_synced = opts.last_synced.or(old_synced);
        let index = opts.task_index.or(task.task_index).or(old_index);
        let href = task.href.clone().or(old_href);

        let mut params = data_values(&task.uid, &task.data);
        params.push(opt_text(href.as_deref()));
        params.push(opt_text(pending.map(|p| p.as_str())));
        params.push(opt_real(last_synced));
        params.push(Value::Real(now_timestamp()));
        params.push(opt_int(index));
        conn.execute(
            "INSERT OR REPLACE INTO tasks \
             (uid, summary, status, due, wait, due_utc, wait_utc, priority, x_properties, \
              categories, url, attachments, href, pending_action, last_synced, updated_at, task_index) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params_from_iter(params),
        )?;
        Ok(())
    }

    /// Give a task the smallest free stable index, starting at 1.
    ///
    /// Holes left by completed or deleted tasks are reused. The scan and the
    /// write happen under one lock so two concurrent calls can never pick
    /// the same index. Returns the existing index if one is already set.
    pub fn assign_index(&self, uid: &str) -> Result<i64, CacheError> {
        let conn = self.conn();
        let current: Option<Option<i64>> = conn
            .query_row("SELECT task_index FROM tasks WHERE uid = ?1", [uid], |r| {
                r.get(0)
            })
            .optional()?;
        let current = match current {
            None => {
                return Err(CacheError::NotFound {
                    table: "tasks",
                    uid: uid.to_string(),
                })
            }
            Some(current) => current,
        };
        if let Some(index) = current {
            return Ok(index);
        }
        let index = smallest_free_index(&conn)?;
        conn.execute(
            "UPDATE tasks SET task_index = ?1 WHERE uid = ?2",
            rusqlite::params![index, uid],
        )?;
        Ok(index)
    }

    /// Move an active task to the completed table, keeping its index.
    /// A row that was pending creation stays pending creation (the server
    /// has never seen it); anything else becomes a pending update.
    pub fn complete_task(&self, uid: &str) -> Result<Task, CacheError> {
        let conn = self.conn();
        let (mut task, meta) = fetch_row(&conn, "tasks", uid)?;
        task.data.status = Some(STATUS_COMPLETED.to_string());
        let pending = match meta.pending {
            Some(PendingAction::Create) => PendingAction::Create,
            _ => PendingAction::Update,
        };
        conn.execute("DELETE FROM tasks WHERE uid = ?1", [uid])?;
        insert_lifecycle_row(
            &conn,
            "completed_tasks",
            &task,
            Some(pending),
            meta.last_synced,
            "completed_at",
        )?;
        Ok(task)
    }

    /// Move an active (or completed) task to the deleted table.
    ///
    /// A row that was pending creation is simply dropped: the server never
    /// saw it, so there is nothing to delete remotely and no tombstone to
    /// keep. Undoing such a deletion goes through the SQL fallback path.
    pub fn mark_for_deletion(&self, uid: &str) -> Result<Task, CacheError> {
        let conn = self.conn();
        let (table, (task, meta)) = match fetch_row(&conn, "tasks", uid) {
            Ok(found) => ("tasks", found),
            Err(CacheError::NotFound { .. }) => {
                ("completed_tasks", fetch_row(&conn, "completed_tasks", uid)?)
            }
            Err(err) => return Err(err),
        };
        conn.execute(&format!("DELETE FROM {} WHERE uid = ?1", table), [uid])?;
        if meta.pending != Some(PendingAction::Create) {
            insert_lifecycle_row(
                &conn,
                "deleted_tasks",
                &task,
                None,
                meta.last_synced,
                "deleted_at",
            )?;
        }
        Ok(task)
    }

    /// Bring a completed task back to the active table with the given
    /// status (`None` leaves the status unset, matching a task that never
    /// had one). Its old index is reused when still free, otherwise the
    /// smallest free one is assigned.
    pub fn restore_from_completed(
        &self,
        uid: &str,
        status: Option<&str>,
    ) -> Result<Task, CacheError> {
        let conn = self.conn();
        let (mut task, meta) = fetch_row(&conn, "completed_tasks", uid)?;
        task.data.status = status.map(|s| s.to_string());
        conn.execute("DELETE FROM completed_tasks WHERE uid = ?1", [uid])?;
        let pending = match meta.pending {
            Some(PendingAction::Create) => PendingAction::Create,
            _ => PendingAction::Update,
        };
        task.task_index = Some(reusable_index(&conn, task.task_index)?);
        insert_active_row(&conn, &task, Some(pending), meta.last_synced)?;
        Ok(task)
    }

    /// Bring a deleted task back to the active table. If it had been synced
    /// it becomes a pending update (the next push re-uploads it), otherwise
    /// a pending creation.
    pub fn restore_from_deleted(&self, uid: &str) -> Result<Task, CacheError> {
        let conn = self.conn();
        let (mut task, meta) = fetch_row(&conn, "deleted_tasks", uid)?;
        conn.execute("DELETE FROM deleted_tasks WHERE uid = ?1", [uid])?;
        let pending = if task.href.is_some() {
            PendingAction::Update
        } else {
            PendingAction::Create
        };
        task.task_index = Some(reusable_index(&conn, task.task_index)?);
        insert_active_row(&conn, &task, Some(pending), meta.last_synced)?;
        Ok(task)
    }

    /// Record that the server accepted this task. For active rows the whole
    /// payload is rewritten (the server may have normalized it); a completed
    /// row just gets its pending flag cleared where it is.
    pub fn mark_synced(&self, task: &Task, timestamp: f64) -> Result<(), CacheError> {
        if self.find_task(&task.uid)?.is_some() {
            return self.upsert_task(task, UpsertOptions::synced(timestamp));
        }
        let conn = self.conn();
        conn.execute(
            "UPDATE completed_tasks SET pending_action = NULL, last_synced = ?1, \
             href = COALESCE(?2, href) WHERE uid = ?3",
            rusqlite::params![timestamp, task.href, task.uid],
        )?;
        Ok(())
    }

    /// Remove an active (or completed) row outright, without a tombstone
    pub fn delete_task(&self, uid: &str) -> Result<(), CacheError> {
        let conn = self.conn();
        conn.execute("DELETE FROM tasks WHERE uid = ?1", [uid])?;
        conn.execute("DELETE FROM completed_tasks WHERE uid = ?1", [uid])?;
        Ok(())
    }

    /// Drop the tombstone for a uid once its deletion reached the server
    pub fn flush_deleted(&self, uid: &str) -> Result<(), CacheError> {
        let conn = self.conn();
        conn.execute("DELETE FROM deleted_tasks WHERE uid = ?1", [uid])?;
        Ok(())
    }

    /* Sync support */

    /// Replace cached content with the server's truth, without losing local
    /// pending work:
    ///
    /// * rows with a pending action are kept as-is (their edits still have
    ///   to be pushed),
    /// * tombstones in the deleted table suppress the matching remote tasks,
    /// * stable indices are preserved by uid; brand new uids get the
    ///   smallest free index each.
    pub fn replace_remote_tasks(&self, remote: &[Task]) -> Result<(), CacheError> {
        let conn = self.conn();
        let now = now_timestamp();

        let mut known_indices: HashMap<String, i64> = HashMap::new();
        for table in &["tasks", "completed_tasks"] {
            let mut stmt = conn.prepare(&format!(
                "SELECT uid, task_index FROM {} WHERE task_index IS NOT NULL",
                table
            ))?;
            let rows = stmt.query_map([], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (uid, index) = row?;
                known_indices.entry(uid).or_insert(index);
            }
        }

        let mut dirty_uids: HashSet<String> = HashSet::new();
        for table in &["tasks", "completed_tasks"] {
            let mut stmt = conn.prepare(&format!(
                "SELECT uid FROM {} WHERE pending_action IS NOT NULL",
                table
            ))?;
            let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
            for row in rows {
                dirty_uids.insert(row?);
            }
        }
        let mut tombstones: HashSet<String> = HashSet::new();
        {
            let mut stmt = conn.prepare("SELECT uid FROM deleted_tasks")?;
            let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
            for row in rows {
                tombstones.insert(row?);
            }
        }

        conn.execute("DELETE FROM tasks WHERE pending_action IS NULL", [])?;
        conn.execute(
            "DELETE FROM completed_tasks WHERE pending_action IS NULL",
            [],
        )?;

        for task in remote {
            if dirty_uids.contains(&task.uid) || tombstones.contains(&task.uid) {
                continue;
            }
            let mut task = task.clone();
            task.task_index = known_indices.get(&task.uid).copied();
            if task.data.is_completed() {
                insert_lifecycle_row(&conn, "completed_tasks", &task, None, Some(now), "completed_at")?;
            } else {
                // Preserved indices may collide with a kept dirty row; fall
                // back to a fresh one in that case.
                if let Some(index) = task.task_index {
                    if index_taken(&conn, index)? {
                        task.task_index = None;
                    }
                }
                insert_active_row(&conn, &task, None, Some(now))?;
            }
        }

        // New uids arrive without an index; hand them out deterministically.
        let orphans: Vec<String> = {
            let mut stmt = conn.prepare(
                "SELECT uid FROM tasks WHERE task_index IS NULL ORDER BY updated_at, uid",
            )?;
            let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
            let mut uids = Vec::new();
            for row in rows {
                uids.push(row?);
            }
            uids
        };
        for uid in orphans {
            let index = smallest_free_index(&conn)?;
            conn.execute(
                "UPDATE tasks SET task_index = ?1 WHERE uid = ?2",
                rusqlite::params![index, uid],
            )?;
        }
        Ok(())
    }

    /// Everything that needs pushing, oldest edits first
    pub fn dirty_tasks(&self) -> Result<Vec<DirtyTask>, CacheError> {
        let conn = self.conn();
        let mut dirty: Vec<(f64, DirtyTask)> = Vec::new();
        for (table, stamp_col) in &[
            ("tasks", "updated_at"),
            ("completed_tasks", "completed_at"),
        ] {
            let sql = format!(
                "SELECT {}, pending_action, {} FROM {} WHERE pending_action IS NOT NULL",
                TASK_COLUMNS, stamp_col, table
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], |row| {
                let task = row_to_task(row)?;
                let pending: Option<String> = row.get(12)?;
                let stamp: Option<f64> = row.get(13)?;
                Ok((task, pending, stamp))
            })?;
            for row in rows {
                let (task, pending, stamp) = row?;
                if let Some(action) = PendingAction::parse(pending.as_deref()) {
                    dirty.push((stamp.unwrap_or(0.0), DirtyTask { task, action }));
                }
            }
        }
        {
            let sql = format!(
                "SELECT {}, deleted_at FROM deleted_tasks",
                TASK_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], |row| {
                let task = row_to_task(row)?;
                let stamp: Option<f64> = row.get(12)?;
                Ok((task, stamp))
            })?;
            for row in rows {
                let (task, stamp) = row?;
                dirty.push((
                    stamp.unwrap_or(0.0),
                    DirtyTask {
                        task,
                        action: PendingAction::Delete,
                    },
                ));
            }
        }
        dirty.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(dirty.into_iter().map(|(_, d)| d).collect())
    }

    /* Transaction log */

    /// Append a diff to the log and trim it to `max_entries`.
    /// Empty diffs are not logged.
    pub fn log_transaction(
        &self,
        diff: &TaskSetDiff<String>,
        operation: Option<&str>,
        max_entries: usize,
    ) -> Result<(), CacheError> {
        if diff.is_empty() {
            return Ok(());
        }
        let json = diff.to_json()?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO transaction_log (diff, operation, created_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![json, operation, now_timestamp()],
        )?;
        conn.execute(
            "DELETE FROM transaction_log WHERE id NOT IN \
             (SELECT id FROM transaction_log ORDER BY id DESC LIMIT ?1)",
            [max_entries as i64],
        )?;
        Ok(())
    }

    /// Remove and return the newest log entry
    pub fn pop_transaction(&self) -> Result<Option<TransactionLogEntry>, CacheError> {
        let conn = self.conn();
        let entry = conn
            .query_row(
                "SELECT id, diff, operation, created_at FROM transaction_log \
                 ORDER BY id DESC LIMIT 1",
                [],
                row_to_log_entry,
            )
            .optional()?;
        if let Some(entry) = &entry {
            conn.execute("DELETE FROM transaction_log WHERE id = ?1", [entry.id])?;
        }
        Ok(entry)
    }

    /// Newest entries first
    pub fn transaction_log(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<TransactionLogEntry>, CacheError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, diff, operation, created_at FROM transaction_log \
             ORDER BY id DESC LIMIT ?1",
        )?;
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let rows = stmt.query_map([limit], row_to_log_entry)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub fn clear_transaction_log(&self) -> Result<usize, CacheError> {
        let conn = self.conn();
        Ok(conn.execute("DELETE FROM transaction_log", [])?)
    }

    /// Run statements produced by [`TaskSetDiff::as_sql`], the undo engine's
    /// fallback path. Returns the number of affected rows.
    pub fn execute_raw(&self, statements: &[SqlStatement]) -> Result<usize, CacheError> {
        let conn = self.conn();
        let mut affected = 0;
        for stmt in statements {
            affected += conn.execute(&stmt.sql, params_from_iter(stmt.params.iter().cloned()))?;
        }
        Ok(affected)
    }
}

/* Row plumbing */

struct RowMeta {
    pending: Option<PendingAction>,
    last_synced: Option<f64>,
}

fn fetch_row(
    conn: &Connection,
    table: &'static str,
    uid: &str,
) -> Result<(Task, RowMeta), CacheError> {
    let pending_col = if table == "deleted_tasks" {
        "NULL"
    } else {
        "pending_action"
    };
    let sql = format!(
        "SELECT {}, {}, last_synced FROM {} WHERE uid = ?1",
        TASK_COLUMNS, pending_col, table
    );
    let found = conn
        .query_row(&sql, [uid], |row| {
            let task = row_to_task(row)?;
            let pending: Option<String> = row.get(12)?;
            let last_synced: Option<f64> = row.get(13)?;
            Ok((
                task,
                RowMeta {
                    pending: PendingAction::parse(pending.as_deref()),
                    last_synced,
                },
            ))
        })
        .optional()?;
    found.ok_or_else(|| CacheError::NotFound {
        table,
        uid: uid.to_string(),
    })
}

fn insert_active_row(
    conn: &Connection,
    task: &Task,
    pending: Option<PendingAction>,
    last_synced: Option<f64>,
) -> Result<(), CacheError> {
    let mut params = data_values(&task.uid, &task.data);
    params.push(opt_text(task.href.as_deref()));
    params.push(opt_text(pending.map(|p| p.as_str())));
    params.push(opt_real(last_synced));
    params.push(Value::Real(now_timestamp()));
    params.push(opt_int(task.task_index));
    conn.execute(
        "INSERT OR REPLACE INTO tasks \
         (uid, summary, status, due, wait, due_utc, wait_utc, priority, x_properties, \
          categories, url, attachments, href, pending_action, last_synced, updated_at, task_index) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params_from_iter(params),
    )?;
    Ok(())
}

fn insert_lifecycle_row(
    conn: &Connection,
    table: &str,
    task: &Task,
    pending: Option<PendingAction>,
    last_synced: Option<f64>,
    stamp_col: &str,
) -> Result<(), CacheError> {
    let mut params = data_values(&task.uid, &task.data);
    params.push(opt_text(task.href.as_deref()));
    params.push(opt_real(last_synced));
    params.push(Value::Real(now_timestamp()));
    params.push(opt_int(task.task_index));
    let sql = if table == "deleted_tasks" {
        format!(
            "INSERT OR REPLACE INTO deleted_tasks \
             (uid, summary, status, due, wait, due_utc, wait_utc, priority, x_properties, \
              categories, url, attachments, href, last_synced, {}, task_index) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            stamp_col
        )
    } else {
        params.insert(13, opt_text(pending.map(|p| p.as_str())));
        format!(
            "INSERT OR REPLACE INTO {} \
             (uid, summary, status, due, wait, due_utc, wait_utc, priority, x_properties, \
              categories, url, attachments, href, pending_action, last_synced, {}, task_index) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            table, stamp_col
        )
    };
    conn.execute(&sql, params_from_iter(params))?;
    Ok(())
}

fn row_to_task(row: &Row) -> rusqlite::Result<Task> {
    let x_properties: Option<String> = row.get(6)?;
    let categories: Option<String> = row.get(7)?;
    let attachments: Option<String> = row.get(9)?;
    let data = TaskData {
        summary: row.get(1)?,
        status: row.get(2)?,
        due: parse_stored_datetime(row.get::<_, Option<String>>(3)?),
        wait: parse_stored_datetime(row.get::<_, Option<String>>(4)?),
        priority: row.get(5)?,
        x_properties: x_properties
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default(),
        categories: categories.and_then(|raw| serde_json::from_str::<Vec<String>>(&raw).ok()),
        url: row.get(8)?,
        attachments: attachments
            .and_then(|raw| serde_json::from_str::<Vec<Attachment>>(&raw).ok())
            .unwrap_or_default(),
    };
    Ok(Task {
        uid: row.get(0)?,
        data,
        href: row.get(10)?,
        task_index: row.get(11)?,
    })
}

fn row_to_log_entry(row: &Row) -> rusqlite::Result<TransactionLogEntry> {
    Ok(TransactionLogEntry {
        id: row.get(0)?,
        diff_json: row.get(1)?,
        operation: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn data_values(uid: &str, data: &TaskData) -> Vec<Value> {
    vec![
        Value::Text(uid.to_string()),
        opt_text(data.summary.as_deref()),
        opt_text(data.status.as_deref()),
        opt_text(data.due.map(|dt| dt.to_rfc3339()).as_deref()),
        opt_text(data.wait.map(|dt| dt.to_rfc3339()).as_deref()),
        opt_real(data.due.map(|dt| dt.timestamp() as f64)),
        opt_real(data.wait.map(|dt| dt.timestamp() as f64)),
        opt_int(data.priority.map(|p| p as i64)),
        Value::Text(json_string_map(&data.x_properties)),
        match &data.categories {
            Some(c) => Value::Text(json_string_list(c)),
            None => Value::Null,
        },
        opt_text(data.url.as_deref()),
        Value::Text(serde_json::to_string(&data.attachments).unwrap_or_else(|_| "[]".to_string())),
    ]
}

fn filter_conditions(filter: &TaskFilter, conditions: &mut Vec<String>, params: &mut Vec<Value>) {
    if let Some(project) = &filter.project {
        conditions.push("json_extract(x_properties, '$.\"X-PROJECT\"') = ?".to_string());
        params.push(Value::Text(project.clone()));
    }
    if !filter.tags.is_empty() {
        let mut likes = Vec::new();
        for tag in &filter.tags {
            likes.push("categories LIKE ?".to_string());
            params.push(Value::Text(format!("%\"{}\"%", tag)));
        }
        conditions.push(format!("({})", likes.join(" OR ")));
    }
    if !filter.indices.is_empty() {
        let placeholders = vec!["?"; filter.indices.len()].join(", ");
        conditions.push(format!("task_index IN ({})", placeholders));
        for index in &filter.indices {
            params.push(Value::Integer(*index));
        }
    }
}

fn smallest_free_index(conn: &Connection) -> Result<i64, CacheError> {
    let mut stmt = conn.prepare(
        "SELECT task_index FROM tasks WHERE task_index IS NOT NULL ORDER BY task_index",
    )?;
    let rows = stmt.query_map([], |r| r.get::<_, i64>(0))?;
    let mut candidate = 1i64;
    for row in rows {
        let taken = row?;
        if taken == candidate {
            candidate += 1;
        } else if taken > candidate {
            break;
        }
    }
    Ok(candidate)
}

fn index_taken(conn: &Connection, index: i64) -> Result<bool, CacheError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM tasks WHERE task_index = ?1",
            [index],
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn reusable_index(conn: &Connection, wanted: Option<i64>) -> Result<i64, CacheError> {
    if let Some(index) = wanted {
        if !index_taken(conn, index)? {
            return Ok(index);
        }
    }
    smallest_free_index(conn)
}

fn parse_stored_datetime(raw: Option<String>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    DateTime::parse_from_rfc3339(&raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn opt_text(value: Option<&str>) -> Value {
    match value {
        Some(s) => Value::Text(s.to_string()),
        None => Value::Null,
    }
}

fn opt_real(value: Option<f64>) -> Value {
    match value {
        Some(v) => Value::Real(v),
        None => Value::Null,
    }
}

fn opt_int(value: Option<i64>) -> Value {
    match value {
        Some(v) => Value::Integer(v),
        None => Value::Null,
    }
}

pub(crate) fn now_timestamp() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

pub(crate) fn json_string_map(map: &BTreeMap<String, String>) -> String {
    serde_json::to_string(map).unwrap_or_else(|_| "{}".to_string())
}

pub(crate) fn json_string_list(list: &[String]) -> String {
    serde_json::to_string(list).unwrap_or_else(|_| "[]".to_string())
}

/// Where the cache database for an environment lives
pub fn resolve_cache_path(path: Option<PathBuf>, env: &str) -> PathBuf {
    if let Some(path) = path {
        return path;
    }
    if let Ok(path) = std::env::var("CALDO_CACHE_FILE") {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    cache_home()
        .join(normalize_env(env))
        .join("tasks.db")
}

/// The per-user directory that holds one subdirectory per environment
pub fn cache_home() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
        .join("caldo")
}

/// Environment names become directory names, so they get sanitized
pub fn normalize_env(env: &str) -> String {
    let cleaned = sanitize_filename::sanitize(env.trim());
    if cleaned.is_empty() {
        "default".to_string()
    } else {
        cleaned
    }
}
