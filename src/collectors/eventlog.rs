use log::debug;
use serde_json::{json, Map, Value};

use crate::constants::{DEFAULT_EVENTLOG_ENTRIES, DEFAULT_EVENTLOG_FILTER_WINDOW, MAX_EVENTLOG_ENTRIES};
use crate::utils::truncate::clamp_str;
use crate::windows::{EventLogSource, EventQuery};

/// Longest message kept per entry
const MAX_ENTRY_MESSAGE_LEN: usize = 2048;

/// Parameters of an eventlog rule.
#[derive(Debug, Clone, Default)]
pub struct EventLogRequest<'a> {
    pub channel: &'a str,
    pub providers: &'a [String],
    pub event_ids: &'a [u32],
    pub message_filter: Option<&'a str>,
    pub max_entries: Option<usize>,
    /// Newest entries searched when a message filter is set
    pub filter_window: Option<usize>,
}

/// Read the newest matching entries of a channel.
///
/// The message filter is a case-insensitive substring match applied to the
/// newest `filter_window` entries of the channel; older entries are never
/// searched. Returns `None` when nothing matched.
pub fn collect_eventlog(source: &dyn EventLogSource, request: &EventLogRequest<'_>) -> Option<Map<String, Value>> {
    let limit = request.max_entries.unwrap_or(DEFAULT_EVENTLOG_ENTRIES).clamp(1, MAX_EVENTLOG_ENTRIES);
    let filter = request
        .message_filter
        .map(|f| f.trim().to_lowercase())
        .filter(|f| !f.is_empty());

    let fetch = match filter {
        Some(_) => request.filter_window.unwrap_or(DEFAULT_EVENTLOG_FILTER_WINDOW).max(limit),
        None => limit,
    };
    let query = EventQuery::new(request.channel, fetch)
        .providers(request.providers.iter().cloned())
        .event_ids(request.event_ids.iter().copied());

    let mut data = Map::new();
    data.insert("channel".to_string(), json!(request.channel));

    let records = match source.query(&query) {
        Ok(records) => records,
        Err(e) => {
            debug!("Failed to read event log {}: {:#}", request.channel, e);
            data.insert("error".to_string(), json!(format!("{:#}", e)));
            return Some(data);
        }
    };

    let entries: Vec<Value> = records
        .iter()
        .filter(|r| {
            filter
                .as_ref()
                .map_or(true, |f| r.message.to_lowercase().contains(f.as_str()))
        })
        .take(limit)
        .map(|r| {
            json!({
                "event_id": r.event_id,
                "provider": r.provider,
                "record_id": r.record_id,
                "time_created": r.time_created.to_rfc3339(),
                "level": r.level,
                "message": clamp_str(&r.message, MAX_ENTRY_MESSAGE_LEN),
            })
        })
        .collect();

    if entries.is_empty() {
        debug!("No matching entries in event log {}", request.channel);
        return None;
    }

    data.insert("entry_count".to_string(), json!(entries.len()));
    data.insert("entries".to_string(), Value::Array(entries));
    Some(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeEventLog;
    use crate::windows::EventRecord;
    use chrono::{Duration, TimeZone, Utc};

    const CHANNEL: &str = "Microsoft-Windows-ModernDeployment-Diagnostics-Provider/Autopilot";

    fn log_with(count: u64) -> FakeEventLog {
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let records = (1..=count)
            .map(|i| EventRecord {
                channel: CHANNEL.to_string(),
                provider: "Microsoft-Windows-ModernDeployment-Diagnostics-Provider".to_string(),
                event_id: if i % 2 == 0 { 100 } else { 153 },
                record_id: i,
                time_created: base + Duration::seconds(i as i64),
                level: Some(4),
                message: format!("Autopilot step {} {}", i, if i % 3 == 0 { "FAILED" } else { "ok" }),
            })
            .collect();
        FakeEventLog { records: parking_lot::Mutex::new(records) }
    }

    #[test]
    fn test_newest_first_with_default_limit() {
        let log = log_with(30);
        let data = collect_eventlog(&log, &EventLogRequest { channel: CHANNEL, ..Default::default() }).unwrap();
        assert_eq!(data["entry_count"], json!(DEFAULT_EVENTLOG_ENTRIES));
        assert_eq!(data["entries"][0]["record_id"], json!(30));
    }

    #[test]
    fn test_id_and_message_filters() {
        let log = log_with(30);
        let ids = [153u32];
        let data = collect_eventlog(
            &log,
            &EventLogRequest {
                channel: CHANNEL,
                event_ids: &ids,
                message_filter: Some("failed"),
                max_entries: Some(100),
                ..Default::default()
            },
        )
        .unwrap();

        // Odd ids divisible by 3 up to 30: 3, 9, 15, 21, 27
        assert_eq!(data["entry_count"], json!(5));
        assert_eq!(data["entries"][0]["record_id"], json!(27));
    }

    #[test]
    fn test_message_filter_searches_past_newest_entries() {
        let log = log_with(200);
        log.records.lock()[4].message = "ESP app install timed out".to_string();
        let request = EventLogRequest { channel: CHANNEL, message_filter: Some("Timed Out"), ..Default::default() };

        let data = collect_eventlog(&log, &request).unwrap();
        assert_eq!(data["entry_count"], json!(1));
        assert_eq!(data["entries"][0]["record_id"], json!(5));

        let narrow = EventLogRequest { filter_window: Some(50), ..request };
        assert!(collect_eventlog(&log, &narrow).is_none());
    }

    #[test]
    fn test_nothing_matched_is_empty() {
        let log = log_with(3);
        let request = EventLogRequest { channel: CHANNEL, message_filter: Some("nomatch"), ..Default::default() };
        assert!(collect_eventlog(&log, &request).is_none());
    }
}
