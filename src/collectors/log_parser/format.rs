//! CMTrace log line format.
//!
//! `<![LOG[message]LOG]!><time="HH:MM:SS.fff+bias" date="MM-DD-YYYY"
//! component=".." context=".." type=".." thread=".." file="..">`
//!
//! The bias is minutes west of UTC, as written by the Windows management
//! stack (UTC = local + bias).

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, TimeZone};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref CMTRACE_LINE: Regex = Regex::new(
        r#"^<!\[LOG\[(?P<message>.*)\]LOG\]!><time="(?P<time>[^"]*)"\s+date="(?P<date>[^"]*)"\s+component="(?P<component>[^"]*)"\s+context="(?P<context>[^"]*)"\s+type="(?P<type>[^"]*)"\s+thread="(?P<thread>[^"]*)"\s+file="(?P<file>[^"]*)">"#
    )
    .expect("CMTrace line pattern is valid");
}

/// Severity code carried in the `type` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Info,
    Warning,
    Error,
    Other(u8),
}

impl EntryType {
    fn from_code(code: &str) -> Self {
        match code.trim().parse::<u8>() {
            Ok(1) => EntryType::Info,
            Ok(2) => EntryType::Warning,
            Ok(3) => EntryType::Error,
            Ok(other) => EntryType::Other(other),
            Err(_) => EntryType::Other(0),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            EntryType::Info => 1,
            EntryType::Warning => 2,
            EntryType::Error => 3,
            EntryType::Other(c) => *c,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Info => "info",
            EntryType::Warning => "warning",
            EntryType::Error => "error",
            EntryType::Other(_) => "other",
        }
    }
}

/// One parsed log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub message: String,
    pub timestamp: Option<DateTime<FixedOffset>>,
    /// `date time` as written, for lines whose timestamp does not parse
    pub raw_timestamp: String,
    pub component: String,
    pub context: String,
    pub entry_type: EntryType,
    pub thread: String,
    pub file: String,
}

/// Parse `HH:MM:SS.fff+bias` and `MM-DD-YYYY` into a zoned timestamp.
fn parse_timestamp(time: &str, date: &str) -> Option<DateTime<FixedOffset>> {
    let sign_at = time.rfind(&['+', '-'][..])?;
    let (clock, bias) = time.split_at(sign_at);

    let bias_minutes: i32 = bias.parse().ok()?;
    let offset = FixedOffset::west_opt(bias_minutes.checked_mul(60)?)?;

    let clock = NaiveTime::parse_from_str(clock, "%H:%M:%S%.f").ok()?;
    let date = NaiveDate::parse_from_str(date, "%m-%d-%Y").ok()?;

    offset.from_local_datetime(&date.and_time(clock)).single()
}

/// Parse one line. Lines that are not CMTrace entries yield `None`.
pub fn parse_cmtrace_line(line: &str) -> Option<LogEntry> {
    let caps = CMTRACE_LINE.captures(line)?;
    let get = |name: &str| caps.name(name).map_or("", |m| m.as_str());

    let time = get("time");
    let date = get("date");

    Some(LogEntry {
        message: get("message").to_string(),
        timestamp: parse_timestamp(time, date),
        raw_timestamp: format!("{} {}", date, time),
        component: get("component").to_string(),
        context: get("context").to_string(),
        entry_type: EntryType::from_code(get("type")),
        thread: get("thread").to_string(),
        file: get("file").to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Timelike, Utc};

    const LINE: &str = r#"<![LOG[[Win32App] Installation failed with 0x80070643]LOG]!><time="14:05:09.1234567+480" date="05-01-2024" component="IntuneManagementExtension" context="" type="3" thread="17" file="">"#;

    #[test]
    fn test_parse_full_line() {
        let entry = parse_cmtrace_line(LINE).unwrap();
        assert_eq!(entry.message, "[Win32App] Installation failed with 0x80070643");
        assert_eq!(entry.component, "IntuneManagementExtension");
        assert_eq!(entry.entry_type, EntryType::Error);
        assert_eq!(entry.thread, "17");

        // +480 bias is UTC-8, so 14:05 local is 22:05 UTC
        let ts = entry.timestamp.unwrap();
        assert_eq!(ts.with_timezone(&Utc).hour(), 22);
        assert_eq!(ts.offset().local_minus_utc(), -8 * 3600);
    }

    #[test]
    fn test_negative_bias_and_bad_timestamp() {
        let line = LINE.replace("+480", "-120");
        let ts = parse_cmtrace_line(&line).unwrap().timestamp.unwrap();
        assert_eq!(ts.offset().local_minus_utc(), 2 * 3600);

        let line = LINE.replace("05-01-2024", "garbage");
        let entry = parse_cmtrace_line(&line).unwrap();
        assert!(entry.timestamp.is_none());
        assert!(entry.raw_timestamp.starts_with("garbage"));
    }

    #[test]
    fn test_non_matching_lines_skipped() {
        assert!(parse_cmtrace_line("").is_none());
        assert!(parse_cmtrace_line("plain text line").is_none());
        assert!(parse_cmtrace_line("<![LOG[unterminated").is_none());
    }

    #[test]
    fn test_entry_type_codes() {
        assert_eq!(EntryType::from_code("1"), EntryType::Info);
        assert_eq!(EntryType::from_code("2").as_str(), "warning");
        assert_eq!(EntryType::from_code("9").code(), 9);
        assert_eq!(EntryType::from_code("x"), EntryType::Other(0));
    }
}
