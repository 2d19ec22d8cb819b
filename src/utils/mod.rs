//! Utility functions for shaping collected output.
//!
//! ## Components
//!
//! - **Truncation**: byte and character budgets with a visible marker
//!
//! ### Truncating Command Output
//!
//! ```
//! use autopilot_monitor::utils::truncate::truncate_bytes;
//!
//! let (text, truncated) = truncate_bytes(b"0123456789", 4);
//! assert!(truncated);
//! assert!(text.starts_with("0123"));
//! ```

/// Output budgets and tail extraction
pub mod truncate;
