//! Attribute extraction from JSON record payloads.
//!
//! Records are opaque JSON objects. The store pulls its primary and secondary
//! keys out of them by attribute name, reduced to a canonical string so that
//! the same attribute value always produces the same key bytes:
//!
//! - unsigned integer → decimal digits
//! - signed integer   → decimal digits with leading `-`
//! - float            → shortest round-trip decimal
//! - string           → the raw UTF-8 bytes, unquoted
//! - bool             → `0` or `1`
//!
//! Objects, arrays, and explicit `null` do not canonicalize; those records
//! are storable but invisible to the index built on that attribute.

use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("payload is not a JSON object")]
    NotAnObject(#[source] Option<serde_json::Error>),

    #[error("attribute {0:?} missing or null")]
    AttributeMissing(String),

    #[error("attribute {0:?} has an unsupported type")]
    UnsupportedType(String),
}

/// Extracts `attribute` from `payload` in canonical string form.
pub fn extract_attribute(payload: &[u8], attribute: &str) -> Result<String, ExtractError> {
    let doc: Value =
        serde_json::from_slice(payload).map_err(|e| ExtractError::NotAnObject(Some(e)))?;
    let obj = doc.as_object().ok_or(ExtractError::NotAnObject(None))?;

    match obj.get(attribute) {
        None | Some(Value::Null) => Err(ExtractError::AttributeMissing(attribute.to_string())),
        Some(Value::Number(n)) => {
            if let Some(u) = n.as_u64() {
                Ok(u.to_string())
            } else if let Some(i) = n.as_i64() {
                Ok(i.to_string())
            } else {
                // as_f64 is infallible for a finite serde_json number
                Ok(n.as_f64().unwrap_or_default().to_string())
            }
        }
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Bool(b)) => Ok(if *b { "1" } else { "0" }.to_string()),
        Some(_) => Err(ExtractError::UnsupportedType(attribute.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_shapes_canonicalize() {
        let doc = br#"{"id": 7, "neg": -3, "pi": 2.5, "name": "u7", "flag": true, "off": false}"#;
        assert_eq!(extract_attribute(doc, "id").unwrap(), "7");
        assert_eq!(extract_attribute(doc, "neg").unwrap(), "-3");
        assert_eq!(extract_attribute(doc, "pi").unwrap(), "2.5");
        assert_eq!(extract_attribute(doc, "name").unwrap(), "u7");
        assert_eq!(extract_attribute(doc, "flag").unwrap(), "1");
        assert_eq!(extract_attribute(doc, "off").unwrap(), "0");
    }

    #[test]
    fn large_unsigned_stays_unsigned() {
        let doc = br#"{"id": 18446744073709551615}"#;
        assert_eq!(extract_attribute(doc, "id").unwrap(), "18446744073709551615");
    }

    #[test]
    fn strings_are_not_quoted() {
        let doc = br#"{"name": "a \"quoted\" name"}"#;
        assert_eq!(extract_attribute(doc, "name").unwrap(), "a \"quoted\" name");
    }

    #[test]
    fn missing_and_null_are_absent() {
        let doc = br#"{"id": 1, "age": null}"#;
        assert!(matches!(
            extract_attribute(doc, "age"),
            Err(ExtractError::AttributeMissing(_))
        ));
        assert!(matches!(
            extract_attribute(doc, "name"),
            Err(ExtractError::AttributeMissing(_))
        ));
    }

    #[test]
    fn nested_values_are_rejected() {
        let doc = br#"{"id": 1, "tags": ["a"], "addr": {"city": "x"}}"#;
        assert!(matches!(
            extract_attribute(doc, "tags"),
            Err(ExtractError::UnsupportedType(_))
        ));
        assert!(matches!(
            extract_attribute(doc, "addr"),
            Err(ExtractError::UnsupportedType(_))
        ));
    }

    #[test]
    fn non_object_payloads_are_rejected() {
        assert!(matches!(
            extract_attribute(b"[1, 2]", "id"),
            Err(ExtractError::NotAnObject(_))
        ));
        assert!(matches!(
            extract_attribute(b"not json", "id"),
            Err(ExtractError::NotAnObject(_))
        ));
    }
}
