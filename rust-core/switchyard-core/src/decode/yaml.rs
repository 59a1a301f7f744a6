//! YAML decoder backed by `serde_yaml`.

use crate::decode::Format;
use crate::error::DecodeError;

/// Parse a single YAML document
///
/// # Errors
///
/// Returns `DecodeError::MalformedPayload` for invalid YAML or multi-document
/// streams.
pub fn decode(bytes: &[u8]) -> Result<serde_yaml::Value, DecodeError> {
    serde_yaml::from_slice(bytes).map_err(|e| DecodeError::malformed(Format::Yaml, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_mapping() {
        let value = decode(b"service: billing\nreplicas: 3\nzones: [a, b]\n").unwrap();
        assert_eq!(value["service"].as_str(), Some("billing"));
        assert_eq!(value["replicas"].as_i64(), Some(3));
        assert_eq!(value["zones"][1].as_str(), Some("b"));
    }

    #[test]
    fn test_decode_invalid() {
        let err = decode(b"key: [unclosed").unwrap_err();
        assert!(matches!(
            err,
            DecodeError::MalformedPayload {
                format: Format::Yaml,
                ..
            }
        ));
    }
}
