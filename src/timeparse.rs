//! Turning human date shorthand into UTC timestamps.
//!
//! Everything here is best-effort: a string that cannot be understood
//! yields `None`, and the CLI turns that into a user-facing error before
//! anything is written to the cache.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc, Weekday};

/// How far away "someday" is
const SOMEDAY_DAYS: i64 = 365 * 5;

/// Parse a due date: keywords, weekday names, explicit dates and times,
/// unix timestamps and durations relative to now.
pub fn parse_due(raw: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let lowered = raw.to_ascii_lowercase();

    match lowered.as_str() {
        "now" => return Some(now),
        "sod" => return Some(start_of_day(now)),
        "today" | "eod" => return Some(end_of_day(now)),
        "tomorrow" => return Some(end_of_day(now) + Duration::days(1)),
        "yesterday" => return Some(end_of_day(now) - Duration::days(1)),
        "eow" => {
            // End of the (ISO) week: the upcoming Sunday
            let days_left = 7 - now.weekday().num_days_from_monday() as i64 - 1;
            return Some(end_of_day(now) + Duration::days(days_left));
        }
        "eom" => return end_of_month(now),
        "later" | "someday" => return Some(now + Duration::days(SOMEDAY_DAYS)),
        _ => {}
    }

    if let Ok(weekday) = lowered.parse::<Weekday>() {
        // Weekday names mean the next such day, never today
        let today = now.weekday().num_days_from_monday() as i64;
        let target = weekday.num_days_from_monday() as i64;
        let ahead = (target - today).rem_euclid(7);
        let ahead = if ahead == 0 { 7 } else { ahead };
        return Some(end_of_day(now) + Duration::days(ahead));
    }

    if lowered.chars().all(|c| c.is_ascii_digit()) {
        let stamp: i64 = lowered.parse().ok()?;
        return Some(DateTime::from_utc(NaiveDateTime::from_timestamp(stamp, 0), Utc));
    }

    if let Some(duration) = parse_duration(&lowered) {
        return Some(now + duration);
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in &["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(DateTime::from_utc(naive, Utc));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(DateTime::from_utc(date.and_hms(0, 0, 0), Utc));
    }

    // A bare time of day: today if still ahead, otherwise tomorrow
    for format in &["%H:%M", "%I:%M%p", "%I%p"] {
        if let Ok(time) = NaiveTime::parse_from_str(&lowered, format) {
            let candidate = DateTime::from_utc(now.date().naive_utc().and_time(time), Utc);
            return Some(if candidate > now {
                candidate
            } else {
                candidate + Duration::days(1)
            });
        }
    }

    None
}

/// Parse a wait threshold. Durations ("2d", "90m", "1w") are the common
/// case; anything else falls back to the due-date forms.
pub fn parse_wait(raw: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Some(duration) = parse_duration(&raw.to_ascii_lowercase()) {
        return Some(now + duration);
    }
    parse_due(raw, now)
}

/// `<number><unit>` with unit one of m/h/d/w, possibly repeated ("1d12h")
fn parse_duration(raw: &str) -> Option<Duration> {
    let mut total = Duration::zero();
    let mut digits = String::new();
    let mut saw_unit = false;
    for c in raw.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let amount: i64 = digits.parse().ok()?;
        digits.clear();
        total = total
            + match c {
                'm' => Duration::minutes(amount),
                'h' => Duration::hours(amount),
                'd' => Duration::days(amount),
                'w' => Duration::weeks(amount),
                _ => return None,
            };
        saw_unit = true;
    }
    if !digits.is_empty() || !saw_unit {
        return None;
    }
    Some(total)
}

fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_utc(now.date().naive_utc().and_hms(0, 0, 0), Utc)
}

fn end_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_utc(now.date().naive_utc().and_hms(23, 59, 59), Utc)
}

fn end_of_month(now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    let last_day = NaiveDate::from_ymd_opt(year, month, 1)?.pred();
    Some(DateTime::from_utc(last_day.and_hms(23, 59, 59), Utc))
}
