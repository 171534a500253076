//! Text normalisation for embedding input.
//!
//! Corpus entries and live queries go through the same steps so both sides
//! of a comparison are embedded from comparable text:
//! 1. Trim surrounding whitespace
//! 2. Collapse internal whitespace runs to a single space
//! 3. Skip if empty
//! 4. Truncate to max length with ellipsis

/// Maximum content length for embedding input (characters, not tokens)
pub const MAX_CONTENT_LENGTH: usize = 512;

/// Ellipsis suffix when content is truncated
const TRUNCATION_SUFFIX: &str = "...";

/// Normalise a text for embedding.
///
/// Returns `None` if nothing but whitespace remains.
pub fn normalize_text(text: &str) -> Option<String> {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.is_empty() {
        return None;
    }

    Some(truncate_content(&collapsed))
}

/// Truncate content to MAX_CONTENT_LENGTH characters, adding ellipsis if truncated.
fn truncate_content(content: &str) -> String {
    if content.chars().count() <= MAX_CONTENT_LENGTH {
        return content.to_string();
    }

    // chars() keeps multi-byte sequences intact
    let max_chars = MAX_CONTENT_LENGTH - TRUNCATION_SUFFIX.len();
    let truncated: String = content.chars().take(max_chars).collect();

    format!("{}{}", truncated.trim_end(), TRUNCATION_SUFFIX)
}
