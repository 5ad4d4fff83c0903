//! Output filename patterns.
//!
//! | placeholder | expands to                  |
//! |-------------|-----------------------------|
//! | `%y`        | two-digit year              |
//! | `%Y`        | four-digit year             |
//! | `%m`        | month, `01`..`12`           |
//! | `%d`        | day of month, `01`..`31`    |
//! | `%H`        | hour, `00`..`23`            |
//! | `%M`        | minute, `00`..`59`          |
//! | `%S`        | second, `00`..`60`          |
//!
//! Any other character after `%` is copied as is, so `%%` produces a single `%`. A `%` at
//! the very end of the pattern is kept.

use chrono::{DateTime, Datelike, Local, TimeZone, Timelike, Utc};

/// Which calendar placeholders are rendered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Calendar {
    /// The host's local time zone
    #[default]
    Local,
    /// Coordinated universal time
    Utc,
}

struct Fields {
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
}

impl Fields {
    fn from_datetime<Tz: TimeZone>(dt: DateTime<Tz>) -> Fields {
        Fields {
            year: dt.year(),
            month: dt.month(),
            day: dt.day(),
            hour: dt.hour(),
            minute: dt.minute(),
            second: dt.second(),
        }
    }

    fn at(sec: i64, calendar: Calendar) -> Fields {
        let dt = match calendar {
            Calendar::Utc => Utc.timestamp_opt(sec, 0).single().map(Fields::from_datetime),
            Calendar::Local => Local.timestamp_opt(sec, 0).earliest().map(Fields::from_datetime),
        };
        // timestamps chrono can't represent render as the epoch
        dt.unwrap_or(Fields {
            year: 1970,
            month: 1,
            day: 1,
            hour: 0,
            minute: 0,
            second: 0,
        })
    }
}

/// Expands `pattern` for a file whose first packet was captured at `sec` seconds since the
/// epoch.
///
/// ```rust
/// use packetdump::{template, Calendar};
///
/// let name = template::expand("cap-%Y%m%d-%H%M%S.pcap", 1_700_000_000, Calendar::Utc);
/// assert_eq!(name, "cap-20231114-221320.pcap");
/// ```
pub fn expand(pattern: &str, sec: i64, calendar: Calendar) -> String {
    let t = Fields::at(sec, calendar);
    let mut out = String::with_capacity(pattern.len() + 16);
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('y') => out.push_str(&format!("{:02}", t.year.rem_euclid(100))),
            Some('Y') => out.push_str(&format!("{:04}", t.year)),
            Some('m') => out.push_str(&format!("{:02}", t.month)),
            Some('d') => out.push_str(&format!("{:02}", t.day)),
            Some('H') => out.push_str(&format!("{:02}", t.hour)),
            Some('M') => out.push_str(&format!("{:02}", t.minute)),
            Some('S') => out.push_str(&format!("{:02}", t.second)),
            Some(other) => out.push(other),
            None => out.push('%'),
        }
    }
    out
}

/// Whether `pattern` contains any time placeholder. Patterns without one name every
/// rotated file the same.
pub fn has_placeholders(pattern: &str) -> bool {
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        if c == '%' {
            if let Some('y' | 'Y' | 'm' | 'd' | 'H' | 'M' | 'S') = chars.next() {
                return true;
            }
        }
    }
    false
}
