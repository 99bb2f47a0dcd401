//! iCalendar generation and parsing shared by the `ics` and `caldir` sinks.

use anyhow::Context;
use chrono::{DateTime, LocalResult, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use cyanea_core::Event;
use icalendar::{Calendar, Component, DatePerhapsTime, EventLike, Property, parser};

/// What a VEVENT carries besides the event itself.
pub(crate) struct VeventMeta<'a> {
    pub uid: &'a str,
    pub description: &'a str,
    pub stamp: DateTime<Utc>,
    pub tz: Tz,
}

/// Builds a VEVENT for `event`. Fails if its times are out of range or it
/// ends before it starts.
pub(crate) fn vevent(event: &Event, meta: &VeventMeta<'_>) -> anyhow::Result<icalendar::Event> {
    event.check_time_range()?;
    let start = event
        .start_time()
        .with_context(|| format!("event {} has an out-of-range start", event.id))?;
    let end = event
        .end_time()
        .with_context(|| format!("event {} has an out-of-range end", event.id))?;

    let mut ics_event = icalendar::Event::new();
    ics_event.uid(meta.uid);
    ics_event.summary(&event.title);
    ics_event.add_property("DTSTAMP", meta.stamp.format("%Y%m%dT%H%M%SZ").to_string());
    add_datetime_property(&mut ics_event, "DTSTART", start, meta.tz);
    add_datetime_property(&mut ics_event, "DTEND", end, meta.tz);

    if !meta.description.is_empty() {
        ics_event.description(meta.description);
    }
    if !event.location.is_empty() {
        ics_event.location(&event.location);
    }

    Ok(ics_event.done())
}

/// Writes `time` as wall-clock time in `tz`, or in UTC when `tz` is UTC or
/// the wall-clock time is ambiguous (the repeated hour when clocks go back).
fn add_datetime_property(ics_event: &mut icalendar::Event, name: &str, time: DateTime<Utc>, tz: Tz) {
    let local = time.with_timezone(&tz);
    let ambiguous = matches!(
        tz.from_local_datetime(&local.naive_local()),
        LocalResult::Ambiguous(..)
    );

    if tz == Tz::UTC || ambiguous {
        ics_event.add_property(name, time.format("%Y%m%dT%H%M%SZ").to_string());
    } else {
        let mut prop = Property::new(name, local.format("%Y%m%dT%H%M%S").to_string());
        prop.add_parameter("TZID", tz.name());
        ics_event.append_property(prop);
    }
}

/// Escapes one item of a TEXT list (backslash, semicolon, comma) so it can
/// be joined with `,`. Newlines are left to the icalendar crate.
pub(crate) fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | ';' | ',') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Serializes `cal`, dropping the icalendar crate's boilerplate.
pub(crate) fn render(mut cal: Calendar) -> String {
    let ics = cal.done().to_string();
    let mut result = String::with_capacity(ics.len());

    for line in ics.lines() {
        if line.starts_with("PRODID:") {
            result.push_str("PRODID:-//cyanea//cyanea//EN\r\n");
            continue;
        }
        if line == "CALSCALE:GREGORIAN" {
            continue;
        }
        result.push_str(line);
        result.push_str("\r\n");
    }

    result
}

/// The fields cyanea reads back from a VEVENT.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ParsedVevent {
    pub uid: String,
    pub summary: String,
    pub description: String,
    pub location: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Parses the first VEVENT of `content`. Floating and all-day times are
/// read in `tz`.
pub(crate) fn parse_vevent(content: &str, tz: Tz) -> Option<ParsedVevent> {
    let unfolded = parser::unfold(content);
    let calendar = parser::read_calendar(&unfolded).ok()?;
    let vevent = calendar.components.iter().find(|c| c.name == "VEVENT")?;

    let text = |name: &str| {
        vevent
            .find_prop(name)
            .map(|p| p.val.to_string())
            .unwrap_or_default()
    };

    let start = to_utc(DatePerhapsTime::try_from(vevent.find_prop("DTSTART")?).ok()?, tz)?;
    let end = to_utc(DatePerhapsTime::try_from(vevent.find_prop("DTEND")?).ok()?, tz)?;

    Some(ParsedVevent {
        uid: vevent.find_prop("UID")?.val.to_string(),
        summary: text("SUMMARY"),
        description: text("DESCRIPTION"),
        location: text("LOCATION"),
        start,
        end,
    })
}

fn to_utc(dpt: DatePerhapsTime, tz: Tz) -> Option<DateTime<Utc>> {
    let local = |naive: NaiveDateTime, tz: Tz| {
        tz.from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
    };

    match dpt {
        DatePerhapsTime::Date(date) => local(date.and_time(NaiveTime::MIN), tz),
        DatePerhapsTime::DateTime(cal_dt) => match cal_dt {
            icalendar::CalendarDateTime::Utc(dt) => Some(dt),
            icalendar::CalendarDateTime::Floating(naive) => local(naive, tz),
            icalendar::CalendarDateTime::WithTimezone { date_time, tzid } => {
                local(date_time, tzid.parse::<Tz>().ok()?)
            }
        },
    }
}
