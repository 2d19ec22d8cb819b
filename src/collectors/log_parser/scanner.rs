use std::fs;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, info};
use regex::Regex;
use serde_json::{json, Map, Value};

use crate::collectors::log_parser::cursor::{CursorKey, CursorStore};
use crate::collectors::log_parser::format::{parse_cmtrace_line, LogEntry};
use crate::constants::{MAX_LOG_LINE_BYTES, MAX_MATCH_INPUT_LEN};
use crate::utils::truncate::clamp_str;
use crate::windows::open_shared_read;

/// A line whose message matched a rule pattern.
#[derive(Debug, Clone)]
pub struct LogMatch {
    pub entry: LogEntry,
    pub captures: Map<String, Value>,
    /// Byte offset of the line in the file
    pub offset: u64,
}

impl LogMatch {
    /// Event data: named captures plus the line's timestamp, component and type.
    pub fn to_data(&self) -> Map<String, Value> {
        let mut data = self.captures.clone();
        let timestamp = self
            .entry
            .timestamp
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| self.entry.raw_timestamp.clone());

        data.insert("log_timestamp".to_string(), json!(timestamp));
        data.insert("component".to_string(), json!(self.entry.component));
        data.insert("log_type".to_string(), json!(self.entry.entry_type.as_str()));
        data.insert("thread".to_string(), json!(self.entry.thread));
        data.insert("message".to_string(), json!(clamp_str(&self.entry.message, MAX_MATCH_INPUT_LEN)));
        data.insert("line_offset".to_string(), json!(self.offset));
        data
    }
}

/// Result of one scan invocation.
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub matches: Vec<LogMatch>,
    pub lines_read: usize,
    pub start_offset: u64,
    pub end_offset: u64,
    /// The file shrank below the stored cursor and was rescanned from 0
    pub rotated: bool,
}

/// Tails CMTrace logs from a per-(rule, file) cursor.
///
/// Each byte range is visited once: the cursor is stored after every scan,
/// matches or not, and only ever moves past complete (newline-terminated)
/// lines. Lines longer than the line cap are skipped, including one still
/// being written. A file shorter than its cursor is treated as rotated.
pub struct IncrementalLogScanner {
    cursors: CursorStore,
    max_line_bytes: usize,
}

impl Default for IncrementalLogScanner {
    fn default() -> Self {
        Self::new(CursorStore::default())
    }
}

impl IncrementalLogScanner {
    pub fn new(cursors: CursorStore) -> Self {
        Self { cursors, max_line_bytes: MAX_LOG_LINE_BYTES }
    }

    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes.max(1);
        self
    }

    pub fn cursor(&self, rule_id: &str, path: &str) -> u64 {
        self.cursors.get(&CursorKey::new(rule_id, path))
    }

    /// Scan new content of `path` for `pattern`, reading at most `max_lines`.
    pub fn scan(&self, rule_id: &str, path: &str, pattern: &Regex, max_lines: usize) -> Result<ScanResult> {
        let key = CursorKey::new(rule_id, path);
        let file_path = Path::new(path);

        let len = fs::metadata(file_path)
            .context(format!("Failed to stat {}", path))?
            .len();

        let mut cursor = self.cursors.get(&key);
        let mut rotated = false;
        if len < cursor {
            info!("Log {} shrank below its cursor ({} < {}), rescanning from the start", path, len, cursor);
            cursor = 0;
            rotated = true;
            self.cursors.set(&key, 0);
        }

        let mut result = ScanResult { start_offset: cursor, end_offset: cursor, rotated, ..Default::default() };
        if len <= cursor {
            return Ok(result);
        }

        let mut file = open_shared_read(file_path).context(format!("Failed to open {}", path))?;
        file.seek(SeekFrom::Start(cursor))
            .context(format!("Failed to seek {} to {}", path, cursor))?;
        let mut reader = BufReader::new(file);

        let mut position = cursor;
        let mut buf = Vec::new();
        while result.lines_read < max_lines {
            buf.clear();
            let read = read_bounded_line(&mut reader, &mut buf, self.max_line_bytes)
                .context(format!("Failed to read {}", path))?;

            let line_offset = position;
            match read {
                // EOF, or a partial line still being written
                LineRead::End => break,
                LineRead::Oversized(consumed) => {
                    debug!("Skipping {} byte line at {} in {}", consumed, line_offset, path);
                    position += consumed as u64;
                    result.lines_read += 1;
                    continue;
                }
                LineRead::Line(consumed) => {
                    position += consumed as u64;
                    result.lines_read += 1;
                }
            }

            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(&['\r', '\n'][..]);
            let Some(entry) = parse_cmtrace_line(line) else {
                continue;
            };

            if let Some(captures) = match_message(pattern, &entry.message) {
                result.matches.push(LogMatch { entry, captures, offset: line_offset });
            }
        }

        result.end_offset = position;
        self.cursors.set(&key, position);

        debug!(
            "Scanned {} lines of {} ({}..{}), {} matches",
            result.lines_read,
            path,
            result.start_offset,
            result.end_offset,
            result.matches.len()
        );
        Ok(result)
    }
}

enum LineRead {
    End,
    /// A complete line of this many bytes is in the buffer
    Line(usize),
    /// This many bytes of an over-long line were consumed and dropped
    Oversized(usize),
}

/// Read one newline-terminated line into `buf`, holding at most `limit`
/// bytes. An over-long line is consumed up to its newline (or EOF) without
/// being kept.
fn read_bounded_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> io::Result<LineRead> {
    let mut consumed = 0usize;
    let mut oversized = false;

    loop {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            return Ok(if oversized { LineRead::Oversized(consumed) } else { LineRead::End });
        }

        let (chunk, terminated) = match available.iter().position(|&b| b == b'\n') {
            Some(idx) => (idx + 1, true),
            None => (available.len(), false),
        };
        if !oversized {
            if buf.len() + chunk > limit {
                oversized = true;
                buf.clear();
            } else {
                buf.extend_from_slice(&available[..chunk]);
            }
        }
        reader.consume(chunk);
        consumed += chunk;

        if terminated {
            return Ok(if oversized { LineRead::Oversized(consumed) } else { LineRead::Line(consumed) });
        }
    }
}

/// Match `pattern` against a (length-capped) message, returning named captures.
fn match_message(pattern: &Regex, message: &str) -> Option<Map<String, Value>> {
    let input = clamp_str(message, MAX_MATCH_INPUT_LEN);
    let caps = pattern.captures(input)?;

    let mut captures = Map::new();
    for name in pattern.capture_names().flatten() {
        if let Some(m) = caps.name(name) {
            captures.insert(name.to_string(), json!(m.as_str()));
        }
    }
    Some(captures)
}
