use time::{macros::format_description, Duration, OffsetDateTime, Time};
use uuid::Uuid;

use crate::registrations::repo_types::Course;

const DEFAULT_SESSION_MINUTES: i64 = 60;

/// Start of the first session: the course start date at `session_time` (UTC) when set.
fn first_session(course: &Course) -> (OffsetDateTime, OffsetDateTime) {
    let mut start = course.start_date;
    if let Some(t) = course.session_time.as_deref().and_then(parse_hh_mm) {
        start = start.replace_time(t);
    }
    let minutes = course
        .session_duration
        .map(i64::from)
        .filter(|m| *m > 0)
        .unwrap_or(DEFAULT_SESSION_MINUTES);
    (start, start + Duration::minutes(minutes))
}

fn parse_hh_mm(raw: &str) -> Option<Time> {
    let (h, m) = raw.trim().split_once(':')?;
    Time::from_hms(h.parse().ok()?, m.parse().ok()?, 0).ok()
}

fn compact_utc(at: OffsetDateTime) -> String {
    let fmt = format_description!("[year][month][day]T[hour][minute][second]Z");
    at.to_offset(time::UtcOffset::UTC)
        .format(&fmt)
        .unwrap_or_default()
}

pub fn google_calendar_url(course: &Course) -> String {
    let (start, end) = first_session(course);
    let dates = format!("{}/{}", compact_utc(start), compact_utc(end));
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    query
        .append_pair("action", "TEMPLATE")
        .append_pair("text", &course.title)
        .append_pair("details", &course.description)
        .append_pair("dates", &dates);
    if let Some(link) = &course.join_link {
        query.append_pair("location", link);
    }
    format!(
        "https://calendar.google.com/calendar/render?{}",
        query.finish()
    )
}

pub fn ics_feed_url(client_url: &str, course_id: Uuid) -> String {
    format!("{client_url}/api/v1/calendar/ics/{course_id}")
}
