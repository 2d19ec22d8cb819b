use crate::constants::TRUNCATION_MARKER;

/// Decode `bytes` lossily and cut it to at most `budget` bytes.
///
/// The cut lands on a UTF-8 boundary. Returns the text (with the marker
/// appended when cut) and whether truncation happened.
pub fn truncate_bytes(bytes: &[u8], budget: usize) -> (String, bool) {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= budget {
        return (text.into_owned(), false);
    }

    let mut cut = budget;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }

    let mut out = String::with_capacity(cut + TRUNCATION_MARKER.len());
    out.push_str(&text[..cut]);
    out.push_str(TRUNCATION_MARKER);
    (out, true)
}

/// The last `max_chars` characters of `text`.
pub fn tail_chars(text: &str, max_chars: usize) -> &str {
    if max_chars == 0 {
        return "";
    }
    match text.char_indices().rev().nth(max_chars - 1) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

/// Cut `text` to at most `max_bytes` on a character boundary.
pub fn clamp_str(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut cut = max_bytes;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    &text[..cut]
}
