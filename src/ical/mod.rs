//! Converting between [`Task`](crate::task::Task)s and iCal `VTODO` text

mod builder;
mod parser;

pub use builder::build_vtodo;
pub use parser::parse_vtodo;

/// The date-time format CalDAV servers expect (RFC5545 UTC form)
pub const ICAL_DATE_TIME: &str = "%Y%m%dT%H%M%SZ";
