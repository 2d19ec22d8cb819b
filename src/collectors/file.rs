use std::fs;
use std::io::Read;
use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use log::debug;
use serde_json::{json, Map, Value};

use crate::constants::{DEFAULT_FILE_TAIL_CHARS, MAX_DIRECTORY_ENTRIES, MAX_FILE_CONTENT_SIZE, MAX_FILE_TAIL_CHARS};
use crate::security::{wildcard_matches, ApprovedTarget};
use crate::utils::truncate::tail_chars;
use crate::windows::open_shared_read;

/// What to read from a file target.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileOptions {
    pub read_content: bool,
    pub tail_chars: Option<usize>,
}

fn timestamp(time: std::io::Result<SystemTime>) -> Value {
    match time {
        Ok(t) => json!(DateTime::<Utc>::from(t).to_rfc3339()),
        Err(_) => Value::Null,
    }
}

/// Report metadata (and optionally a content tail) for a file, or a capped
/// listing for a directory. Missing paths report `exists=false`.
pub fn collect_file(approved: &ApprovedTarget, options: FileOptions) -> Map<String, Value> {
    let path = Path::new(approved.target());
    let mut data = Map::new();
    data.insert("path".to_string(), json!(approved.target()));

    let metadata = match fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            data.insert("exists".to_string(), json!(false));
            return data;
        }
        Err(e) => {
            debug!("Failed to stat {}: {}", path.display(), e);
            data.insert("exists".to_string(), json!(false));
            data.insert("error".to_string(), json!(e.to_string()));
            return data;
        }
    };

    data.insert("exists".to_string(), json!(true));
    data.insert("is_directory".to_string(), json!(metadata.is_dir()));
    data.insert("created".to_string(), timestamp(metadata.created()));
    data.insert("modified".to_string(), timestamp(metadata.modified()));
    data.insert("accessed".to_string(), timestamp(metadata.accessed()));

    if metadata.is_dir() {
        list_directory(path, approved.wildcard(), &mut data);
    } else {
        data.insert("size".to_string(), json!(metadata.len()));
        if options.read_content {
            read_tail(path, metadata.len(), options, &mut data);
        }
    }
    data
}

fn list_directory(path: &Path, pattern: Option<&str>, data: &mut Map<String, Value>) {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) => {
            data.insert("error".to_string(), json!(e.to_string()));
            return;
        }
    };

    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| pattern.map_or(true, |p| wildcard_matches(p, name)))
        .collect();
    names.sort();

    let total = names.len();
    names.truncate(MAX_DIRECTORY_ENTRIES);

    if let Some(p) = pattern {
        data.insert("pattern".to_string(), json!(p));
    }
    data.insert("entry_count".to_string(), json!(total));
    data.insert("listing_truncated".to_string(), json!(total > MAX_DIRECTORY_ENTRIES));
    data.insert("entries".to_string(), json!(names));
}

fn read_tail(path: &Path, size: u64, options: FileOptions, data: &mut Map<String, Value>) {
    if size > MAX_FILE_CONTENT_SIZE {
        data.insert("content_skipped".to_string(), json!("file exceeds the content size limit"));
        return;
    }

    let mut bytes = Vec::with_capacity(size as usize);
    let read = open_shared_read(path).and_then(|mut f| f.read_to_end(&mut bytes));
    if let Err(e) = read {
        data.insert("error".to_string(), json!(e.to_string()));
        return;
    }

    let text = String::from_utf8_lossy(&bytes);
    let max_chars = options.tail_chars.unwrap_or(DEFAULT_FILE_TAIL_CHARS).min(MAX_FILE_TAIL_CHARS);
    let tail = tail_chars(&text, max_chars);
    data.insert("content_truncated".to_string(), json!(tail.len() < text.len()));
    data.insert("content".to_string(), json!(tail));
}
