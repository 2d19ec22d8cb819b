//! Incremental CMTrace log scanning.
//!
//! [`format`] parses single lines, [`cursor`] keeps the per-(rule, file)
//! read offsets and [`scanner`] ties them together.

pub mod cursor;
pub mod format;
pub mod scanner;

pub use cursor::{CursorKey, CursorStore};
pub use format::{parse_cmtrace_line, EntryType, LogEntry};
pub use scanner::{IncrementalLogScanner, LogMatch, ScanResult};
