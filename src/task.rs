//! To-do tasks (iCal `VTODO` subset) and the patch type used to edit them

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Conventional `STATUS` values. The field itself is free-form, since
/// servers are allowed to store anything.
pub const STATUS_NEEDS_ACTION: &str = "NEEDS-ACTION";
pub const STATUS_IN_PROCESS: &str = "IN-PROCESS";
pub const STATUS_COMPLETED: &str = "COMPLETED";

/// The extension property that carries a task's project name
pub const X_PROJECT: &str = "X-PROJECT";

/// A CalDAV `ATTACH` property
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fmttype: Option<String>,
}

impl Attachment {
    pub fn new<S: ToString>(uri: S, fmttype: Option<String>) -> Self {
        Self { uri: uri.to_string(), fmttype }
    }
}

/// The mutable payload of a task, separated from its identity.
///
/// `due` and `wait` are resolved UTC timestamps here. During CLI parsing they
/// exist as raw strings inside an [`UpdateDescriptor`](crate::update::UpdateDescriptor)
/// and only become `DateTime<Utc>` through an explicit resolve step.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskData {
    pub summary: Option<String>,
    pub status: Option<String>,
    pub due: Option<DateTime<Utc>>,
    pub wait: Option<DateTime<Utc>>,
    pub priority: Option<u8>,
    #[serde(default)]
    pub x_properties: BTreeMap<String, String>,
    pub categories: Option<Vec<String>>,
    pub url: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl TaskData {
    pub fn with_summary<S: ToString>(summary: S) -> Self {
        Self {
            summary: Some(summary.to_string()),
            ..Self::default()
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status.as_deref() == Some(STATUS_COMPLETED)
    }

    /// The project this task belongs to, if any
    pub fn project(&self) -> Option<&str> {
        self.x_properties.get(X_PROJECT).map(|s| s.as_str())
    }
}

/// Identity + payload.
///
/// * `uid` is globally unique (RFC5545 `UID`), assigned at creation and never
///   changed afterwards.
/// * `href` is the remote resource locator, set once the task has been synced.
/// * `task_index` is the stable local-only ordinal used for user-facing
///   selection; see [`Cache::assign_index`](crate::cache::Cache::assign_index).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub uid: String,
    pub data: TaskData,
    pub href: Option<String>,
    pub task_index: Option<i64>,
}

impl Task {
    /// Create a brand new task that is not on a server yet.
    /// The uid is derived from the summary plus a random suffix.
    pub fn new(data: TaskData) -> Self {
        let uid = uid_from_summary(data.summary.as_deref().unwrap_or("task"));
        Self {
            uid,
            data,
            href: None,
            task_index: None,
        }
    }

    pub fn with_uid<S: ToString>(uid: S, data: TaskData) -> Self {
        Self {
            uid: uid.to_string(),
            data,
            href: None,
            task_index: None,
        }
    }

    pub fn summary(&self) -> &str {
        self.data.summary.as_deref().unwrap_or(&self.uid)
    }
}

fn uid_from_summary(summary: &str) -> String {
    format!(
        "{}-{}",
        summary.replace(' ', "_"),
        Uuid::new_v4().to_hyphenated()
    )
}

/// A single patchable field: leave it alone, set it, or clear it.
///
/// This replaces the sentinel values some task tools use (priority `0`,
/// magic epoch datetimes, empty strings) with an explicit three-state type.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldPatch<T> {
    Unchanged,
    Set(T),
    Clear,
}

impl<T> Default for FieldPatch<T> {
    fn default() -> Self {
        FieldPatch::Unchanged
    }
}

impl<T: Clone> FieldPatch<T> {
    pub fn is_unchanged(&self) -> bool {
        matches!(self, FieldPatch::Unchanged)
    }

    /// Merge this patch over the current value
    pub fn apply(&self, current: Option<&T>) -> Option<T> {
        match self {
            FieldPatch::Unchanged => current.cloned(),
            FieldPatch::Set(v) => Some(v.clone()),
            FieldPatch::Clear => None,
        }
    }
}

/// A partial update to a [`TaskData`], with every field three-state.
///
/// Tag edits are kept separate from wholesale category replacement:
/// `categories` replaces (or clears) the whole set, while `add_tags` /
/// `remove_tags` edit the existing set. When both are given, replacement is
/// applied first, then the edits.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TaskPatch {
    pub summary: FieldPatch<String>,
    pub status: FieldPatch<String>,
    pub due: FieldPatch<DateTime<Utc>>,
    pub wait: FieldPatch<DateTime<Utc>>,
    pub priority: FieldPatch<u8>,
    pub x_properties: BTreeMap<String, FieldPatch<String>>,
    pub categories: FieldPatch<Vec<String>>,
    pub add_tags: BTreeSet<String>,
    pub remove_tags: BTreeSet<String>,
    pub url: FieldPatch<String>,
    pub attachments: Option<Vec<Attachment>>,
}

impl TaskPatch {
    pub fn with_status<S: ToString>(status: S) -> Self {
        Self {
            status: FieldPatch::Set(status.to_string()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.summary.is_unchanged()
            && self.status.is_unchanged()
            && self.due.is_unchanged()
            && self.wait.is_unchanged()
            && self.priority.is_unchanged()
            && self.x_properties.is_empty()
            && self.categories.is_unchanged()
            && self.add_tags.is_empty()
            && self.remove_tags.is_empty()
            && self.url.is_unchanged()
            && self.attachments.is_none()
    }

    /// Apply this patch to a payload, returning the merged payload.
    /// This is the single merge function every edit path goes through.
    pub fn apply(&self, data: &TaskData) -> TaskData {
        let mut x_properties = data.x_properties.clone();
        for (key, patch) in &self.x_properties {
            match patch {
                FieldPatch::Unchanged => {}
                FieldPatch::Set(v) => {
                    x_properties.insert(key.clone(), v.clone());
                }
                FieldPatch::Clear => {
                    x_properties.remove(key);
                }
            }
        }

        let categories = self.merged_categories(data.categories.as_deref());

        TaskData {
            summary: self.summary.apply(data.summary.as_ref()),
            status: self.status.apply(data.status.as_ref()),
            due: self.due.apply(data.due.as_ref()),
            wait: self.wait.apply(data.wait.as_ref()),
            priority: self.priority.apply(data.priority.as_ref()),
            x_properties,
            categories,
            url: self.url.apply(data.url.as_ref()),
            attachments: self
                .attachments
                .clone()
                .unwrap_or_else(|| data.attachments.clone()),
        }
    }

    fn merged_categories(&self, existing: Option<&[String]>) -> Option<Vec<String>> {
        let base: Option<Vec<String>> = match &self.categories {
            FieldPatch::Unchanged => existing.map(|c| c.to_vec()),
            FieldPatch::Set(v) => Some(v.clone()),
            FieldPatch::Clear => Some(Vec::new()),
        };
        if self.add_tags.is_empty() && self.remove_tags.is_empty() {
            return base;
        }
        let mut tags: BTreeSet<String> = base
            .unwrap_or_default()
            .into_iter()
            .filter(|t| !t.trim().is_empty())
            .collect();
        for tag in &self.add_tags {
            tags.insert(tag.clone());
        }
        for tag in &self.remove_tags {
            tags.remove(tag);
        }
        Some(tags.into_iter().collect())
    }
}

/// Selection criteria for listing operations. Dimensions are combined with
/// AND; several tags are a union test against a task's tag set.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TaskFilter {
    pub project: Option<String>,
    pub tags: Vec<String>,
    pub indices: Vec<i64>,
}

impl TaskFilter {
    pub fn by_indices(indices: Vec<i64>) -> Self {
        Self {
            indices,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.project.is_none() && self.tags.is_empty() && self.indices.is_empty()
    }
}
