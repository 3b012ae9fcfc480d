//! The linear update grammar shared by `add` and `modify`:
//!
//! ```text
//! Fix the fence +home -waiting project:chores due:fri wait:2d pri:h
//! ```
//!
//! Bare words accumulate into a description, `+tag`/`-tag` edit the tag
//! set, and `key:value` tokens set fields. A `key:` with an empty value
//! clears that field. Dates stay raw strings in the descriptor; the
//! separate [`resolve`](UpdateDescriptor::resolve) step turns them into
//! timestamps (and into errors when they are unparsable).

use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;

use chrono::{DateTime, Utc};

use crate::task::{FieldPatch, TaskPatch, X_PROJECT};
use crate::timeparse;

/// A parsed but not yet resolved update line
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpdateDescriptor {
    pub summary: FieldPatch<String>,
    pub status: FieldPatch<String>,
    /// Raw due string, e.g. "fri" or "2026-10-05"
    pub due: FieldPatch<String>,
    /// Raw wait string, e.g. "2d"
    pub wait: FieldPatch<String>,
    pub priority: FieldPatch<u8>,
    pub project: FieldPatch<String>,
    pub x_properties: BTreeMap<String, FieldPatch<String>>,
    pub add_tags: BTreeSet<String>,
    pub remove_tags: BTreeSet<String>,
}

impl UpdateDescriptor {
    pub fn is_empty(&self) -> bool {
        self == &UpdateDescriptor::default()
    }

    /// Resolve raw date strings against `now` and produce the patch.
    /// Unparsable dates and priorities are reported, never guessed.
    pub fn resolve(&self, now: DateTime<Utc>) -> Result<TaskPatch, Box<dyn Error>> {
        let mut patch = TaskPatch {
            summary: self.summary.clone(),
            status: self.status.clone(),
            priority: self.priority.clone(),
            add_tags: self.add_tags.clone(),
            remove_tags: self.remove_tags.clone(),
            ..TaskPatch::default()
        };
        patch.due = match &self.due {
            FieldPatch::Unchanged => FieldPatch::Unchanged,
            FieldPatch::Clear => FieldPatch::Clear,
            FieldPatch::Set(raw) => FieldPatch::Set(
                timeparse::parse_due(raw, now)
                    .ok_or_else(|| format!("cannot parse due date: {:?}", raw))?,
            ),
        };
        patch.wait = match &self.wait {
            FieldPatch::Unchanged => FieldPatch::Unchanged,
            FieldPatch::Clear => FieldPatch::Clear,
            FieldPatch::Set(raw) => FieldPatch::Set(
                timeparse::parse_wait(raw, now)
                    .ok_or_else(|| format!("cannot parse wait date: {:?}", raw))?,
            ),
        };
        match &self.project {
            FieldPatch::Unchanged => {}
            FieldPatch::Set(project) => {
                patch
                    .x_properties
                    .insert(X_PROJECT.to_string(), FieldPatch::Set(project.clone()));
            }
            FieldPatch::Clear => {
                patch
                    .x_properties
                    .insert(X_PROJECT.to_string(), FieldPatch::Clear);
            }
        }
        for (key, value) in &self.x_properties {
            patch.x_properties.insert(key.clone(), value.clone());
        }
        Ok(patch)
    }
}

/// Parse a sequence of update tokens.
///
/// Tags added and removed in the same line cancel out. A description, if
/// one accumulates, becomes the summary unless a `summary:` token already
/// set one.
pub fn parse_update(tokens: &[String]) -> Result<UpdateDescriptor, Box<dyn Error>> {
    let mut descriptor = UpdateDescriptor::default();
    let mut description: Vec<&str> = Vec::new();

    for token in tokens {
        if let Some(tag) = token.strip_prefix('+') {
            if tag.is_empty() {
                return Err("empty tag in '+'".into());
            }
            descriptor.add_tags.insert(tag.to_string());
            continue;
        }
        if let Some(tag) = token.strip_prefix('-') {
            if tag.is_empty() {
                return Err("empty tag in '-'".into());
            }
            descriptor.remove_tags.insert(tag.to_string());
            continue;
        }
        match token.split_once(':') {
            Some(("project", value)) => descriptor.project = set_or_clear(value),
            Some(("due", value)) => descriptor.due = set_or_clear(value),
            Some(("wait", value)) => descriptor.wait = set_or_clear(value),
            Some(("status", value)) => descriptor.status = set_or_clear(value),
            Some(("summary", value)) => descriptor.summary = set_or_clear(value),
            Some(("pri", value)) | Some(("priority", value)) => {
                descriptor.priority = parse_priority(value)?;
            }
            Some(("x", rest)) => {
                let (key, value) = rest
                    .split_once(':')
                    .ok_or_else(|| format!("malformed x-property token: {:?}", token))?;
                let key = if key.starts_with("X-") || key.starts_with("x-") {
                    key.to_ascii_uppercase()
                } else {
                    format!("X-{}", key.to_ascii_uppercase())
                };
                descriptor.x_properties.insert(key, set_or_clear(value));
            }
            _ => description.push(token),
        }
    }

    // +x -x in the same breath is a no-op
    let conflicting: Vec<String> = descriptor
        .add_tags
        .intersection(&descriptor.remove_tags)
        .cloned()
        .collect();
    for tag in conflicting {
        descriptor.add_tags.remove(&tag);
        descriptor.remove_tags.remove(&tag);
    }

    if !description.is_empty() && descriptor.summary.is_unchanged() {
        descriptor.summary = FieldPatch::Set(description.join(" "));
    }
    Ok(descriptor)
}

fn set_or_clear(value: &str) -> FieldPatch<String> {
    if value.is_empty() {
        FieldPatch::Clear
    } else {
        FieldPatch::Set(value.to_string())
    }
}

fn parse_priority(value: &str) -> Result<FieldPatch<u8>, Box<dyn Error>> {
    match value {
        "" => Ok(FieldPatch::Clear),
        "h" | "H" => Ok(FieldPatch::Set(1)),
        "m" | "M" => Ok(FieldPatch::Set(5)),
        "l" | "L" => Ok(FieldPatch::Set(9)),
        other => match other.parse::<u8>() {
            Ok(p) if (1..=9).contains(&p) => Ok(FieldPatch::Set(p)),
            _ => Err(format!("invalid priority {:?} (use h/m/l or 1-9)", value).into()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tokens(raw: &str) -> Vec<String> {
        raw.split_whitespace().map(|s| s.to_string()).collect()
    }

    #[test]
    fn words_become_the_summary() {
        let d = parse_update(&tokens("Fix the fence +home project:chores")).unwrap();
        assert_eq!(d.summary, FieldPatch::Set("Fix the fence".to_string()));
        assert!(d.add_tags.contains("home"));
        assert_eq!(d.project, FieldPatch::Set("chores".to_string()));
    }

    #[test]
    fn explicit_summary_wins_over_description() {
        let d = parse_update(&tokens("ignored words summary:Real")).unwrap();
        assert_eq!(d.summary, FieldPatch::Set("Real".to_string()));
    }

    #[test]
    fn empty_values_clear_fields() {
        let d = parse_update(&tokens("due: pri: project:")).unwrap();
        assert_eq!(d.due, FieldPatch::Clear);
        assert_eq!(d.priority, FieldPatch::Clear);
        assert_eq!(d.project, FieldPatch::Clear);
    }

    #[test]
    fn priorities_by_letter_and_digit() {
        assert_eq!(
            parse_update(&tokens("pri:h")).unwrap().priority,
            FieldPatch::Set(1)
        );
        assert_eq!(
            parse_update(&tokens("pri:7")).unwrap().priority,
            FieldPatch::Set(7)
        );
        assert!(parse_update(&tokens("pri:0")).is_err());
        assert!(parse_update(&tokens("pri:x")).is_err());
    }

    #[test]
    fn conflicting_tag_edits_cancel() {
        let d = parse_update(&tokens("+a -a +b")).unwrap();
        assert!(d.add_tags.contains("b"));
        assert!(!d.add_tags.contains("a"));
        assert!(d.remove_tags.is_empty());
    }

    #[test]
    fn x_properties_are_namespaced() {
        let d = parse_update(&tokens("x:context:office x:X-OTHER:v")).unwrap();
        assert_eq!(
            d.x_properties.get("X-CONTEXT"),
            Some(&FieldPatch::Set("office".to_string()))
        );
        assert_eq!(
            d.x_properties.get("X-OTHER"),
            Some(&FieldPatch::Set("v".to_string()))
        );
        assert!(parse_update(&tokens("x:broken")).is_err());
    }

    #[test]
    fn resolve_turns_raw_dates_into_timestamps() {
        let now = Utc.ymd(2026, 9, 1).and_hms(10, 0, 0);
        let d = parse_update(&tokens("thing due:2026-10-05 wait:2d")).unwrap();
        let patch = d.resolve(now).unwrap();
        assert_eq!(
            patch.due,
            FieldPatch::Set(Utc.ymd(2026, 10, 5).and_hms(0, 0, 0))
        );
        assert_eq!(
            patch.wait,
            FieldPatch::Set(now + chrono::Duration::days(2))
        );
        assert_eq!(
            patch.x_properties.get(X_PROJECT),
            None
        );

        let bad = parse_update(&tokens("due:whenever")).unwrap();
        assert!(bad.resolve(now).is_err());
    }

    #[test]
    fn resolve_maps_project_to_x_property() {
        let now = Utc::now();
        let set = parse_update(&tokens("project:chores")).unwrap();
        assert_eq!(
            set.resolve(now).unwrap().x_properties.get(X_PROJECT),
            Some(&FieldPatch::Set("chores".to_string()))
        );
        let clear = parse_update(&tokens("project:")).unwrap();
        assert_eq!(
            clear.resolve(now).unwrap().x_properties.get(X_PROJECT),
            Some(&FieldPatch::Clear)
        );
    }
}
