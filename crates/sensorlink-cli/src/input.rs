//! Stdin line parsing.

use serde_json::Value;

/// Turn one input line into a measurement payload.
///
/// JSON values pass through as-is; anything else is sent as a string.
/// Blank lines yield `None`.
pub fn parse_line(line: &str) -> Option<Value> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numbers_and_objects_are_json() {
        assert_eq!(parse_line("42"), Some(json!(42)));
        assert_eq!(parse_line(" 1.5 \n"), Some(json!(1.5)));
        assert_eq!(parse_line(r#"{"x": 1}"#), Some(json!({"x": 1})));
    }

    #[test]
    fn bare_words_become_strings() {
        assert_eq!(parse_line("open"), Some(json!("open")));
        assert_eq!(parse_line("{broken"), Some(json!("{broken")));
    }

    #[test]
    fn blank_lines_are_skipped() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("   \t"), None);
    }
}
