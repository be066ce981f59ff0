pub mod telegram;

/// Cut `text` to at most `max_len` bytes without splitting a UTF-8 character,
/// marking the cut with an ellipsis.
pub fn truncate(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_string();
    }
    const ELLIPSIS: &str = "…";
    let mut end = max_len.saturating_sub(ELLIPSIS.len());
    // Walk back to a valid UTF-8 char boundary so slicing doesn't panic
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &text[..end], ELLIPSIS)
}
