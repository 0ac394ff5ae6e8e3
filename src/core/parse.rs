//! Extraction of embedded JSON from noisy agent output.
//!
//! Agents wrap their JSON in narration, shell echoes, and ANSI noise, so a
//! streaming parser over the whole blob would choke. Instead we scan for the
//! first balanced top-level `{}` or `[]` pair (honoring string literals and
//! backslash escapes), then hand the candidate substring to a strict
//! `serde_json` parse.

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("no balanced JSON {kind} found in output")]
    NotFound { kind: &'static str },
    #[error("extracted JSON {kind} is malformed: {source}")]
    Malformed {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Extract the first top-level JSON object embedded in `text`.
pub fn extract_object(text: &str) -> Result<Value, ParseError> {
    extract_balanced(text, '{', '}', "object")
}

/// Extract the first top-level JSON array embedded in `text`.
pub fn extract_array(text: &str) -> Result<Value, ParseError> {
    extract_balanced(text, '[', ']', "array")
}

/// Extract the first top-level JSON object and deserialize it as `T`.
pub fn extract_object_as<T: DeserializeOwned>(text: &str) -> Result<T, ParseError> {
    let value = extract_object(text)?;
    serde_json::from_value(value).map_err(|source| ParseError::Malformed {
        kind: "object",
        source,
    })
}

/// Extract the first top-level JSON array and deserialize it as `T`.
pub fn extract_array_as<T: DeserializeOwned>(text: &str) -> Result<T, ParseError> {
    let value = extract_array(text)?;
    serde_json::from_value(value).map_err(|source| ParseError::Malformed {
        kind: "array",
        source,
    })
}

fn extract_balanced(
    text: &str,
    open: char,
    close: char,
    kind: &'static str,
) -> Result<Value, ParseError> {
    let candidate = find_balanced(text, open, close).ok_or(ParseError::NotFound { kind })?;
    serde_json::from_str(candidate).map_err(|source| ParseError::Malformed { kind, source })
}

/// Locate the first balanced `open`..`close` span, skipping delimiters that
/// occur inside string literals. String tracking runs over the whole input,
/// not just the candidate span: narration before the JSON may quote a lone
/// delimiter, and that must not start or skew the scan.
fn find_balanced(text: &str, open: char, close: char) -> Option<&str> {
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        if ch == '"' {
            in_string = true;
        } else if ch == open {
            if start.is_none() {
                start = Some(idx);
            }
            depth += 1;
        } else if ch == close && start.is_some() {
            depth -= 1;
            if depth == 0 {
                let begin = start?;
                return Some(&text[begin..idx + ch.len_utf8()]);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_object_surrounded_by_prose() {
        let text = r#"Here is your answer: {"taskId":"A","status":"success"} thanks!"#;
        let value = extract_object(text).expect("extract");
        assert_eq!(value, json!({"taskId": "A", "status": "success"}));
    }

    #[test]
    fn extracts_nested_object() {
        let text = r#"noise {"a":{"b":[1,2,{"c":3}]}} trailing"#;
        let value = extract_object(text).expect("extract");
        assert_eq!(value["a"]["b"][2]["c"], json!(3));
    }

    #[test]
    fn ignores_braces_inside_string_literals() {
        let text = r#"log: {"msg":"use } and { freely","n":1} done"#;
        let value = extract_object(text).expect("extract");
        assert_eq!(value["n"], json!(1));
    }

    #[test]
    fn quoted_delimiter_in_narration_before_json_is_skipped() {
        let text = r#"agent says: "use { in format strings" and then emits {"a":1} at last"#;
        let value = extract_object(text).expect("extract");
        assert_eq!(value, json!({"a": 1}));

        let text = r#"note: "arrays use [ and ]" -> ["x","y"] trailing"#;
        let value = extract_array(text).expect("extract");
        assert_eq!(value, json!(["x", "y"]));
    }

    #[test]
    fn honors_backslash_escapes_in_strings() {
        let text = r#"{"path":"a\"b}","ok":true}"#;
        let value = extract_object(text).expect("extract");
        assert_eq!(value["ok"], json!(true));
    }

    #[test]
    fn extracts_array_with_shell_echo_prefix() {
        let text = "$ cat /app/tasks.json\n[{\"id\":\"t1\",\"title\":\"x\"}]\n$ echo done";
        let value = extract_array(text).expect("extract");
        assert_eq!(value[0]["id"], json!("t1"));
    }

    #[test]
    fn missing_json_is_not_found() {
        let err = extract_object("no json here at all").unwrap_err();
        assert!(matches!(err, ParseError::NotFound { kind: "object" }));
    }

    #[test]
    fn unbalanced_json_is_not_found() {
        let err = extract_object(r#"start {"a": 1 and never closed"#).unwrap_err();
        assert!(matches!(err, ParseError::NotFound { .. }));
    }

    #[test]
    fn malformed_interior_is_rejected() {
        let err = extract_object(r#"prefix {"a": 1,} suffix"#).unwrap_err();
        assert!(matches!(err, ParseError::Malformed { .. }));
    }

    #[test]
    fn round_trips_serialized_objects() {
        let original = json!({"id": "t", "nested": {"list": [1, "two", null]}});
        let text = format!("prefix text\n{original}\nsuffix text");
        let value = extract_object(&text).expect("extract");
        assert_eq!(value, original);
    }

    #[test]
    fn typed_extraction_deserializes() {
        #[derive(serde::Deserialize)]
        struct Small {
            id: String,
        }
        let small: Small = extract_object_as(r#"chatter {"id":"x"} chatter"#).expect("typed");
        assert_eq!(small.id, "x");
    }
}
