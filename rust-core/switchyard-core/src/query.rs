//! Query string decoding.

use std::collections::HashMap;

/// Parse a raw query string into a key/value map
///
/// Handles `+` as space, percent-decoding and duplicate keys (last value
/// wins). Pairs whose key is empty are skipped; a key without `=` maps to
/// an empty string.
#[must_use]
pub fn parse_query_string(query: Option<&str>) -> HashMap<String, String> {
    query
        .map(|q| {
            q.split('&')
                .filter_map(|pair| {
                    let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                    if key.is_empty() {
                        return None;
                    }
                    Some((url_decode(key), url_decode(value)))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Split a request target into path and optional query
#[must_use]
pub fn split_target(target: &str) -> (&str, Option<&str>) {
    match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    }
}

/// Form-style decoding; malformed escapes are kept verbatim
fn url_decode(s: &str) -> String {
    let spaced = s.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_string_simple() {
        let result = parse_query_string(Some("page=1&limit=10"));
        assert_eq!(result.get("page"), Some(&"1".to_string()));
        assert_eq!(result.get("limit"), Some(&"10".to_string()));
    }

    #[test]
    fn test_parse_query_string_empty() {
        assert!(parse_query_string(None).is_empty());
        assert!(parse_query_string(Some("")).is_empty());
    }

    #[test]
    fn test_parse_query_string_url_encoded() {
        let result = parse_query_string(Some("name=John+Doe&city=New%20York&q=caf%C3%A9"));
        assert_eq!(result.get("name"), Some(&"John Doe".to_string()));
        assert_eq!(result.get("city"), Some(&"New York".to_string()));
        assert_eq!(result.get("q"), Some(&"café".to_string()));
    }

    #[test]
    fn test_duplicate_keys_last_wins() {
        let result = parse_query_string(Some("tag=a&tag=b&flag"));
        assert_eq!(result.get("tag"), Some(&"b".to_string()));
        assert_eq!(result.get("flag"), Some(&String::new()));
    }

    #[test]
    fn test_url_decode() {
        assert_eq!(url_decode("hello+world"), "hello world");
        assert_eq!(url_decode("hello%20world"), "hello world");
        assert_eq!(url_decode("100%25"), "100%");
    }

    #[test]
    fn test_split_target() {
        assert_eq!(split_target("/users?page=2"), ("/users", Some("page=2")));
        assert_eq!(split_target("/users"), ("/users", None));
    }
}
