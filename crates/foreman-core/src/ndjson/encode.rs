//! Encoding of stdin lines for the agent protocol.

use serde_json::json;

/// Encode one user turn as a single NDJSON line (no trailing newline).
pub fn user_turn(text: &str) -> String {
    json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": [{ "type": "text", "text": text }],
        },
    })
    .to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn user_turn_is_one_line_with_text() {
        let line = user_turn("fix the\nbuild");
        assert!(!line.contains('\n'));
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "user");
        assert_eq!(value["message"]["content"][0]["text"], "fix the\nbuild");
    }
}
