/// Trims surrounding whitespace and lowercases, so visually identical inputs
/// map to one key.
pub fn casefold_trimmed(raw: &str) -> String {
    raw.trim().to_lowercase()
}

pub fn truncate_for_error(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated = text.chars().take(max_chars).collect::<String>();
    truncated.push_str("...");
    truncated
}
