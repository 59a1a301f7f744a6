//! # JSON Decoder
//!
//! High-performance JSON parsing using simd-json with serde_json fallback.
//!
//! Nesting depth is checked on the raw bytes before any value is built, so
//! deeply nested payloads are refused without recursing into them.

use crate::decode::Format;
use crate::error::DecodeError;
use serde::Deserialize;
use serde_json::Value;

/// Default maximum nesting depth for JSON documents
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// JSON decode settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct JsonOptions {
    /// Maximum array/object nesting depth
    pub max_depth: usize,
}

impl Default for JsonOptions {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// Parse JSON bytes into a structured value
///
/// Uses simd-json first; on failure serde_json re-parses the input so the
/// error message carries line and column information.
///
/// # Errors
///
/// Returns `DecodeError::PayloadTooLarge` (scope `depth`) when nesting
/// exceeds `max_depth`, `DecodeError::MalformedPayload` for invalid JSON.
pub fn decode(bytes: &[u8], options: &JsonOptions) -> Result<Value, DecodeError> {
    check_depth(bytes, options.max_depth)?;

    let mut scratch = bytes.to_vec();
    simd_json::from_slice::<Value>(&mut scratch)
        .or_else(|_| serde_json::from_slice::<Value>(bytes))
        .map_err(|e| DecodeError::malformed(Format::Json, e))
}

/// Scan bracket nesting outside of string literals
fn check_depth(bytes: &[u8], max_depth: usize) -> Result<(), DecodeError> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for &b in bytes {
        if in_string {
            match (escaped, b) {
                (true, _) => escaped = false,
                (false, b'\\') => escaped = true,
                (false, b'"') => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => {
                depth += 1;
                if depth > max_depth {
                    return Err(DecodeError::PayloadTooLarge {
                        scope: "depth",
                        limit: max_depth,
                        actual: depth,
                    });
                }
            }
            b'}' | b']' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_object() {
        let value = decode(br#"{"a":1}"#, &JsonOptions::default()).unwrap();
        assert_eq!(value, json!({ "a": 1 }));
    }

    #[test]
    fn test_decode_nested() {
        let value = decode(
            br#"{"name": "John", "tags": ["x", "y"], "meta": {"age": 30}}"#,
            &JsonOptions::default(),
        )
        .unwrap();
        assert_eq!(value["meta"]["age"], 30);
        assert_eq!(value["tags"][1], "y");
    }

    #[test]
    fn test_invalid_json() {
        let err = decode(b"not valid json", &JsonOptions::default()).unwrap_err();
        match err {
            DecodeError::MalformedPayload { format, message } => {
                assert_eq!(format, Format::Json);
                assert!(message.contains("line"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_depth_limit() {
        let options = JsonOptions { max_depth: 3 };
        assert!(decode(b"[[[1]]]", &options).is_ok());

        let err = decode(b"[[[[1]]]]", &options).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::PayloadTooLarge { scope: "depth", .. }
        ));
    }

    #[test]
    fn test_brackets_inside_strings_do_not_count() {
        let options = JsonOptions { max_depth: 1 };
        let value = decode(br#"{"s": "[[[{\"]]]"}"#, &options).unwrap();
        assert_eq!(value["s"], "[[[{\"]]]");
    }
}
