//! A module to parse ICal files

use std::error::Error;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use ical::parser::ical::component::IcalTodo;

use crate::task::{Attachment, Task, TaskData};

/// Parse an iCal document into a [`Task`].
///
/// The document must contain exactly one `VTODO`. Properties we do not
/// model are ignored, except `X-` extension properties which are kept
/// verbatim so round-tripping through a server loses nothing.
pub fn parse_vtodo(content: &str, href: Option<&str>) -> Result<Task, Box<dyn Error>> {
    let mut reader = ical::IcalParser::new(content.as_bytes());
    let calendar = match reader.next() {
        None => return Err("no iCal data to parse".into()),
        Some(Err(err)) => return Err(format!("unable to parse iCal data: {}", err).into()),
        Some(Ok(calendar)) => calendar,
    };
    if reader.next().map(|r| r.is_ok()) == Some(true) {
        return Err("multiple iCal documents are not supported".into());
    }
    let todo = match calendar.todos.len() {
        1 => &calendar.todos[0],
        n => return Err(format!("expected exactly one VTODO, found {}", n).into()),
    };

    let (uid, data) = read_todo(todo)?;
    Ok(Task {
        uid,
        data,
        href: href.map(|h| h.to_string()),
        task_index: None,
    })
}

fn read_todo(todo: &IcalTodo) -> Result<(String, TaskData), Box<dyn Error>> {
    let mut uid = None;
    let mut data = TaskData::default();

    for prop in &todo.properties {
        let value = match &prop.value {
            Some(value) => value.as_str(),
            None => continue,
        };
        match prop.name.as_str() {
            "UID" => uid = Some(value.to_string()),
            "SUMMARY" => data.summary = Some(unescape_text(value)),
            "STATUS" => data.status = Some(value.to_string()),
            "PRIORITY" => data.priority = value.parse().ok(),
            "DUE" => data.due = parse_ical_date_time(value),
            "DTSTART" => data.wait = parse_ical_date_time(value),
            "CATEGORIES" => {
                let categories: Vec<String> = split_unescaped_commas(value)
                    .into_iter()
                    .map(|c| unescape_text(&c))
                    .filter(|c| !c.is_empty())
                    .collect();
                data.categories = Some(categories);
            }
            "URL" => data.url = Some(value.to_string()),
            "ATTACH" => {
                let fmttype = prop.params.as_ref().and_then(|params| {
                    params
                        .iter()
                        .find(|(name, _)| name == "FMTTYPE")
                        .and_then(|(_, values)| values.first().cloned())
                });
                data.attachments.push(Attachment::new(value, fmttype));
            }
            name if name.starts_with("X-") => {
                data.x_properties
                    .insert(name.to_string(), unescape_text(value));
            }
            _ => {}
        }
    }

    let uid = uid.ok_or("VTODO is missing its UID")?;
    Ok((uid, data))
}

/// Accepts the RFC5545 UTC form, the floating form (assumed UTC) and bare
/// dates. Anything else yields `None` rather than an error, since servers
/// are creative about date formats.
fn parse_ical_date_time(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.strip_suffix('Z').unwrap_or(raw);
    if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, "%Y%m%dT%H%M%S") {
        return Some(DateTime::from_utc(naive, Utc));
    }
    NaiveDate::parse_from_str(trimmed, "%Y%m%d")
        .ok()
        .map(|date| DateTime::from_utc(date.and_hms(0, 0, 0), Utc))
}

fn unescape_text(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some(escaped) => out.push(escaped),
            None => out.push('\\'),
        }
    }
    out
}

fn split_unescaped_commas(raw: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for c in raw.chars() {
        if escaped {
            current.push('\\');
            current.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == ',' {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    if escaped {
        current.push('\\');
    }
    parts.push(current);
    parts
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::task::STATUS_IN_PROCESS;

    const EXAMPLE_ICAL: &str = "BEGIN:VCALENDAR\r\n\
        VERSION:2.0\r\n\
        PRODID:-//Nextcloud Tasks v0.13.6\r\n\
        BEGIN:VTODO\r\n\
        UID:0633de27-8c32-42be-bcb8-63bc879c6185\r\n\
        DTSTAMP:20260321T001600\r\n\
        SUMMARY:Fix the fence\\; urgently\r\n\
        STATUS:IN-PROCESS\r\n\
        PRIORITY:2\r\n\
        DUE:20260915T120000Z\r\n\
        DTSTART:20260901T000000Z\r\n\
        CATEGORIES:home,garden\r\n\
        URL:https://example.com/fence\r\n\
        ATTACH;FMTTYPE=application/pdf:https://example.com/quote.pdf\r\n\
        X-PROJECT:chores\r\n\
        END:VTODO\r\n\
        END:VCALENDAR\r\n";

    #[test]
    fn test_vtodo_parsing() {
        let task = parse_vtodo(EXAMPLE_ICAL, Some("/cal/fence.ics")).unwrap();
        assert_eq!(task.uid, "0633de27-8c32-42be-bcb8-63bc879c6185");
        assert_eq!(task.href.as_deref(), Some("/cal/fence.ics"));
        assert_eq!(task.data.summary.as_deref(), Some("Fix the fence; urgently"));
        assert_eq!(task.data.status.as_deref(), Some(STATUS_IN_PROCESS));
        assert_eq!(task.data.priority, Some(2));
        assert_eq!(
            task.data.due.unwrap().to_rfc3339(),
            "2026-09-15T12:00:00+00:00"
        );
        assert_eq!(
            task.data.wait.unwrap().to_rfc3339(),
            "2026-09-01T00:00:00+00:00"
        );
        assert_eq!(
            task.data.categories,
            Some(vec!["home".to_string(), "garden".to_string()])
        );
        assert_eq!(task.data.url.as_deref(), Some("https://example.com/fence"));
        assert_eq!(task.data.attachments.len(), 1);
        assert_eq!(
            task.data.attachments[0].fmttype.as_deref(),
            Some("application/pdf")
        );
        assert_eq!(
            task.data.x_properties.get("X-PROJECT").map(|s| s.as_str()),
            Some("chores")
        );
    }

    #[test]
    fn test_builder_output_parses_back() {
        let mut data = TaskData::with_summary("Round trip");
        data.priority = Some(5);
        data.categories = Some(vec!["a".to_string()]);
        let task = Task::with_uid("rt-1", data.clone());
        let ical = super::super::build_vtodo(&task);
        let parsed = parse_vtodo(&ical, None).unwrap();
        assert_eq!(parsed.uid, "rt-1");
        assert_eq!(parsed.data.summary, data.summary);
        assert_eq!(parsed.data.priority, data.priority);
        assert_eq!(parsed.data.categories, data.categories);
    }

    #[test]
    fn test_missing_uid_is_an_error() {
        let ical = "BEGIN:VCALENDAR\r\nBEGIN:VTODO\r\nSUMMARY:nope\r\nEND:VTODO\r\nEND:VCALENDAR\r\n";
        assert!(parse_vtodo(ical, None).is_err());
    }

    #[test]
    fn test_vevent_is_rejected() {
        let ical = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:x\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        assert!(parse_vtodo(ical, None).is_err());
    }
}
