// JSON extraction and repair for free-form model output
//
// Models return JSON wrapped in prose, fenced code blocks, or truncated
// mid-array. The extraction order mirrors how often each failure mode
// shows up in practice: fenced block first, then the widest brace span,
// then an unterminated trailing span, then the raw text.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use crate::error::CaseworkError;

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)```").expect("fence regex"))
}

fn span_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\{.*\}").expect("span regex"))
}

fn partial_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\{.*").expect("partial regex"))
}

/// Best-effort repair of almost-JSON: strip trailing commas, then append
/// synthetic closers to balance bracket counts. Arrays are closed before
/// objects because the schemas in this domain nest arrays innermost.
///
/// This is a heuristic, not a parser — it can produce JSON that parses but
/// means something else. Callers must validate the shape afterward.
pub fn repair_json(text: &str) -> String {
    let mut s = text.trim().to_string();

    let open_braces = s.matches('{').count();
    let close_braces = s.matches('}').count();
    let open_brackets = s.matches('[').count();
    let close_brackets = s.matches(']').count();

    static TRAILING_COMMA: OnceLock<Regex> = OnceLock::new();
    let re = TRAILING_COMMA.get_or_init(|| Regex::new(r",\s*([}\]])").expect("comma regex"));
    s = re.replace_all(&s, "$1").into_owned();
    if s.ends_with(',') {
        s.pop();
    }

    for _ in close_brackets..open_brackets {
        s.push(']');
    }
    for _ in close_braces..open_braces {
        s.push('}');
    }
    s
}

fn parse_or_repair(candidate: &str) -> Option<Value> {
    if let Ok(v) = serde_json::from_str(candidate) {
        return Some(v);
    }
    serde_json::from_str(&repair_json(candidate)).ok()
}

/// Extract a JSON value from free-form model output.
///
/// Attempts, in order: fenced code block, first balanced-looking `{...}`
/// span, unterminated trailing `{...` span (truncated output), raw text.
/// Errors only when every strategy fails.
pub fn extract_json(text: &str) -> Result<Value, CaseworkError> {
    if let Some(caps) = fence_re().captures(text) {
        if let Some(v) = parse_or_repair(caps[1].trim()) {
            return Ok(v);
        }
    }

    if let Some(m) = span_re().find(text) {
        if let Some(v) = parse_or_repair(m.as_str()) {
            return Ok(v);
        }
    }

    if let Some(m) = partial_re().find(text) {
        if let Ok(v) = serde_json::from_str::<Value>(&repair_json(m.as_str())) {
            return Ok(v);
        }
    }

    serde_json::from_str(text).map_err(|e| CaseworkError::Parse(e.to_string()))
}

/// Extract and deserialize into a typed shape. Shape-validation failure is
/// treated the same as parse failure so malformed-but-parseable output never
/// reaches persistence.
pub fn extract_typed<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, CaseworkError> {
    let value = extract_json(text)?;
    serde_json::from_value(value).map_err(|e| CaseworkError::Parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fenced_block() {
        let v = extract_json("Here you go:\n```json\n{\"a\": 1}\n```\nDone.").unwrap();
        assert_eq!(v, json!({"a": 1}));
    }

    #[test]
    fn test_fenced_block_without_language_tag() {
        let v = extract_json("```\n{\"a\": [1, 2]}\n```").unwrap();
        assert_eq!(v, json!({"a": [1, 2]}));
    }

    #[test]
    fn test_trailing_comma_repaired() {
        let v = extract_json("```json\n{\"a\":1,}\n```").unwrap();
        assert_eq!(v, json!({"a": 1}));
    }

    #[test]
    fn test_embedded_span() {
        let v = extract_json("The answer is {\"x\": true} as requested.").unwrap();
        assert_eq!(v, json!({"x": true}));
    }

    #[test]
    fn test_truncated_output_balanced() {
        let v = extract_json("{\"a\":[1,2").unwrap();
        assert_eq!(v, json!({"a": [1, 2]}));
    }

    #[test]
    fn test_truncated_nested_object() {
        let v = extract_json("{\"issues\":[{\"id\":\"1\",\"text\":\"Root\"").unwrap();
        assert_eq!(v, json!({"issues": [{"id": "1", "text": "Root"}]}));
    }

    #[test]
    fn test_raw_json() {
        let v = extract_json("[1, 2, 3]").unwrap();
        assert_eq!(v, json!([1, 2, 3]));
    }

    #[test]
    fn test_dangling_comma_stripped() {
        assert_eq!(repair_json("{\"a\": 1,"), "{\"a\": 1}");
    }

    #[test]
    fn test_no_json_at_all() {
        assert!(extract_json("I am sorry, I cannot help with that.").is_err());
    }

    #[test]
    fn test_typed_rejects_wrong_shape() {
        #[derive(serde::Deserialize)]
        struct Shape {
            #[allow(dead_code)]
            issues: Vec<String>,
        }
        // Parses as JSON, fails shape validation
        assert!(extract_typed::<Shape>("{\"issues\": 42}").is_err());
    }
}
