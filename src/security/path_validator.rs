//! Path normalization and segment-bounded prefix matching.
//!
//! Targets arrive as text from rule definitions, so everything here is
//! lexical: nothing touches the filesystem or the registry. A path that cannot
//! be normalized is rejected, and callers treat that as a hard deny.

use anyhow::{bail, Result};

use crate::config::parse_windows_env_vars;

/// Characters treated as wildcards in the final path segment.
const WILDCARD_CHARS: [char; 2] = ['*', '?'];

/// How a normalized path compares and joins its segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStyle {
    /// `C:\Dir\File` or a registry path; compared case-insensitively.
    Windows,
    /// `/dir/file`; compared case-sensitively.
    Unix,
}

impl PathStyle {
    pub fn separator(&self) -> char {
        match self {
            PathStyle::Windows => '\\',
            PathStyle::Unix => '/',
        }
    }
}

/// A path after environment expansion and normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedPath {
    pub path: String,
    pub style: PathStyle,
    /// Wildcard pattern split off the final segment, if any.
    pub wildcard: Option<String>,
}

/// Split a trailing wildcard segment off `raw`.
///
/// Returns the directory part and the pattern. Wildcards in any earlier
/// segment are an error.
fn split_wildcard(raw: &str, separators: &[char]) -> Result<(String, Option<String>)> {
    let (head, last) = match raw.rfind(separators) {
        Some(idx) => (&raw[..idx], &raw[idx + 1..]),
        None => ("", raw),
    };

    if head.contains(&WILDCARD_CHARS[..]) {
        bail!("Wildcard outside the final path segment");
    }

    if last.contains(&WILDCARD_CHARS[..]) {
        if head.is_empty() {
            bail!("Wildcard without a parent directory");
        }
        Ok((head.to_string(), Some(last.to_string())))
    } else {
        Ok((raw.to_string(), None))
    }
}

/// Resolve `.` and `..` segments. Climbing above the root is an error.
fn resolve_segments<'a>(segments: impl Iterator<Item = &'a str>) -> Result<Vec<&'a str>> {
    let mut resolved: Vec<&str> = Vec::new();
    for segment in segments {
        match segment {
            "" | "." => {}
            ".." => {
                if resolved.pop().is_none() {
                    bail!("Path traversal above the root");
                }
            }
            other => resolved.push(other),
        }
    }
    Ok(resolved)
}

/// Normalize a filesystem path.
///
/// Accepts drive-letter paths (`C:\...`, forward slashes allowed) and Unix
/// absolute paths. Relative paths, UNC paths, null bytes and alternate data
/// stream syntax are rejected.
pub fn normalize_file_path(raw: &str) -> Result<NormalizedPath> {
    let expanded = parse_windows_env_vars(raw.trim());

    if expanded.is_empty() {
        bail!("Empty path");
    }
    if expanded.contains('\0') {
        bail!("Path contains null bytes");
    }

    let bytes = expanded.as_bytes();
    let is_drive = bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':';

    if is_drive {
        let unified = expanded.replace('/', "\\");
        if unified.len() > 2 && !unified[2..].starts_with('\\') {
            bail!("Drive-relative paths are not allowed");
        }
        let (dir, wildcard) = split_wildcard(&unified, &['\\'])?;

        let drive = dir[..2].to_ascii_uppercase();
        let rest = dir.get(2..).unwrap_or("");
        if rest.contains(':') {
            bail!("Alternate data streams are not allowed");
        }

        let segments = resolve_segments(rest.split('\\'))?;
        let path = if segments.is_empty() {
            format!("{}\\", drive)
        } else {
            format!("{}\\{}", drive, segments.join("\\"))
        };

        Ok(NormalizedPath { path, style: PathStyle::Windows, wildcard })
    } else if expanded.starts_with('/') {
        if expanded.contains('\\') {
            bail!("Mixed path separators");
        }
        let (dir, wildcard) = split_wildcard(&expanded, &['/'])?;
        let segments = resolve_segments(dir.split('/'))?;
        let path = format!("/{}", segments.join("/"));

        Ok(NormalizedPath { path, style: PathStyle::Unix, wildcard })
    } else if expanded.starts_with("\\\\") {
        bail!("UNC paths are not allowed");
    } else {
        bail!("Path is not absolute: {}", expanded)
    }
}

/// Canonical short name for a registry hive, accepting long and PowerShell forms.
fn canonical_hive(hive: &str) -> Option<&'static str> {
    let hive = hive.trim_end_matches(':').to_ascii_uppercase();
    match hive.as_str() {
        "HKLM" | "HKEY_LOCAL_MACHINE" => Some("HKLM"),
        "HKCU" | "HKEY_CURRENT_USER" => Some("HKCU"),
        "HKCR" | "HKEY_CLASSES_ROOT" => Some("HKCR"),
        "HKU" | "HKEY_USERS" => Some("HKU"),
        "HKCC" | "HKEY_CURRENT_CONFIG" => Some("HKCC"),
        _ => None,
    }
}

/// Normalize a registry key path to `HIVE\Sub\Key` form.
pub fn normalize_registry_path(raw: &str) -> Result<NormalizedPath> {
    let expanded = parse_windows_env_vars(raw.trim());

    if expanded.is_empty() {
        bail!("Empty registry path");
    }
    if expanded.contains('\0') {
        bail!("Registry path contains null bytes");
    }

    let (dir, wildcard) = split_wildcard(&expanded, &['\\'])?;

    let mut parts = dir.split('\\');
    let hive = parts
        .next()
        .and_then(canonical_hive)
        .ok_or_else(|| anyhow::anyhow!("Unknown registry hive in {}", expanded))?;

    let segments = resolve_segments(parts)?;
    let path = if segments.is_empty() {
        hive.to_string()
    } else {
        format!("{}\\{}", hive, segments.join("\\"))
    };

    Ok(NormalizedPath { path, style: PathStyle::Windows, wildcard })
}

/// True when `path` equals `prefix` or continues with a separator right after it.
///
/// Both sides must already be normalized in the same style.
pub fn is_within_prefix(path: &str, prefix: &str, style: PathStyle) -> bool {
    let sep = style.separator();
    let (path, prefix) = match style {
        PathStyle::Windows => (path.to_lowercase(), prefix.to_lowercase()),
        PathStyle::Unix => (path.to_string(), prefix.to_string()),
    };

    if !path.starts_with(&prefix) {
        return false;
    }
    if path.len() == prefix.len() || prefix.ends_with(sep) {
        return true;
    }
    path[prefix.len()..].starts_with(sep)
}

/// Case-insensitive `*` / `?` match of a single path segment.
pub fn wildcard_matches(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let name: Vec<char> = name.to_lowercase().chars().collect();

    let (mut p, mut n) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut star_n = 0usize;

    while n < name.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == name[n]) {
            p += 1;
            n += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            star_n = n;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            star_n += 1;
            n = star_n;
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}
