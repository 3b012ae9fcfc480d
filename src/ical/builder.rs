//! A module to build ICal files

use chrono::{DateTime, Utc};
use ics::components::Property;
use ics::properties::{Categories, Due, Priority, Status, Summary};
use ics::{escape_text, ICalendar, ToDo};

use crate::task::Task;

const ORG_NAME: &str = "caldo";
const PRODUCT_NAME: &str = "caldo";

fn ical_product_id() -> String {
    format!("-//{}//{}//EN", ORG_NAME, PRODUCT_NAME)
}

/// Render a task as a full iCal document containing one `VTODO`
pub fn build_vtodo(task: &Task) -> String {
    let mut todo = ToDo::new(task.uid.clone(), format_date_time(&Utc::now()));

    if let Some(summary) = &task.data.summary {
        todo.push(Summary::new(escape_text(summary.clone())));
    }
    if let Some(status) = &task.data.status {
        todo.push(Status::new(status.clone()));
    }
    if let Some(priority) = task.data.priority {
        todo.push(Priority::new(priority.to_string()));
    }
    if let Some(due) = &task.data.due {
        todo.push(Due::new(format_date_time(due)));
    }
    if let Some(wait) = &task.data.wait {
        // DTSTART doubles as the wait date: clients hide the task until then
        todo.push(Property::new("DTSTART", format_date_time(wait)));
    }
    if let Some(categories) = &task.data.categories {
        if !categories.is_empty() {
            // Commas separate the list; only the items themselves get escaped
            let joined = categories
                .iter()
                .map(|c| escape_text(c.clone()).to_string())
                .collect::<Vec<_>>()
                .join(",");
            todo.push(Categories::new(joined));
        }
    }
    if let Some(url) = &task.data.url {
        todo.push(Property::new("URL", url.clone()));
    }
    for attachment in &task.data.attachments {
        let mut prop = Property::new("ATTACH", attachment.uri.clone());
        if let Some(fmttype) = &attachment.fmttype {
            prop.add(ics::parameters::FmtType::new(fmttype.clone()));
        }
        todo.push(prop);
    }
    for (key, value) in &task.data.x_properties {
        todo.push(Property::new(key.clone(), escape_text(value.clone())));
    }

    let mut calendar = ICalendar::new("2.0", ical_product_id());
    calendar.add_todo(todo);
    calendar.to_string()
}

fn format_date_time(dt: &DateTime<Utc>) -> String {
    dt.format(super::ICAL_DATE_TIME).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Attachment, TaskData, STATUS_IN_PROCESS, X_PROJECT};
    use chrono::TimeZone;

    #[test]
    fn test_vtodo_from_task() {
        let mut data = TaskData::with_summary("Fix the fence; urgently");
        data.status = Some(STATUS_IN_PROCESS.to_string());
        data.priority = Some(2);
        data.due = Some(Utc.ymd(2026, 9, 15).and_hms(12, 0, 0));
        data.categories = Some(vec!["home".to_string(), "garden".to_string()]);
        data.x_properties
            .insert(X_PROJECT.to_string(), "chores".to_string());
        data.url = Some("https://example.com/fence".to_string());
        data.attachments = vec![Attachment::new(
            "https://example.com/quote.pdf",
            Some("application/pdf".to_string()),
        )];
        let task = Task::with_uid("fence-123", data);

        let ical = build_vtodo(&task);
        assert!(ical.starts_with("BEGIN:VCALENDAR\r\n"));
        assert!(ical.contains("BEGIN:VTODO\r\n"));
        assert!(ical.contains("UID:fence-123\r\n"));
        assert!(ical.contains("SUMMARY:Fix the fence\\; urgently\r\n"));
        assert!(ical.contains("STATUS:IN-PROCESS\r\n"));
        assert!(ical.contains("PRIORITY:2\r\n"));
        assert!(ical.contains("DUE:20260915T120000Z\r\n"));
        assert!(ical.contains("CATEGORIES:home,garden\r\n"));
        assert!(ical.contains("URL:https://example.com/fence\r\n"));
        assert!(ical.contains("ATTACH;FMTTYPE=application/pdf:https://example.com/quote.pdf\r\n"));
        assert!(ical.contains("X-PROJECT:chores\r\n"));
        assert!(ical.ends_with("END:VCALENDAR\r\n"));
    }

    #[test]
    fn test_sparse_task_has_no_optional_lines() {
        let task = Task::with_uid("sparse-1", TaskData::with_summary("Just a summary"));
        let ical = build_vtodo(&task);
        assert!(ical.contains("SUMMARY:Just a summary\r\n"));
        assert!(!ical.contains("DUE:"));
        assert!(!ical.contains("PRIORITY:"));
        assert!(!ical.contains("CATEGORIES:"));
    }
}
