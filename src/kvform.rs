//! The newline/colon "key-value form" encoding used for direct communication
//! with OpenID providers.
//!
//! Each pair is rendered as `key:value\n`. Keys may not contain colons or
//! newlines; values may not contain newlines. Parsing strips whitespace
//! around keys and values and skips malformed lines rather than failing the
//! whole document, since providers in the wild emit trailing blank lines.

use log::warn;
use thiserror::Error;

use std::collections::HashMap;

/// Error encoding a key-value form document.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum KvError {
    /// A key contained a colon or newline.
    #[error("Invalid key-value form key: `{0}`")]
    InvalidKey(String),
    /// A value contained a newline.
    #[error("Invalid key-value form value for key `{0}`")]
    InvalidValue(String),
}

/// Encode the given pairs, in order, as a key-value form document.
pub fn encode<K, V>(pairs: &[(K, V)]) -> Result<Vec<u8>, KvError>
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut out = Vec::new();
    for (key, value) in pairs {
        let (key, value) = (key.as_ref(), value.as_ref());
        if key.contains(':') || key.contains('\n') {
            return Err(KvError::InvalidKey(key.to_string()));
        }
        if value.contains('\n') {
            return Err(KvError::InvalidValue(key.to_string()));
        }
        out.extend_from_slice(key.as_bytes());
        out.push(b':');
        out.extend_from_slice(value.as_bytes());
        out.push(b'\n');
    }
    Ok(out)
}

/// Decode a key-value form document into its pairs, preserving document
/// order. Lines without a colon are skipped.
pub fn parse(body: &[u8]) -> Vec<(String, String)> {
    let text = String::from_utf8_lossy(body);
    let mut pairs = Vec::new();
    for line in text.split('\n') {
        if line.trim().is_empty() {
            continue;
        }
        match line.split_once(':') {
            Some((key, value)) => {
                pairs.push((key.trim().to_string(), value.trim().to_string()));
            }
            None => {
                warn!("skipping malformed key-value form line: `{}`", line);
            }
        }
    }
    pairs
}

/// Decode a key-value form document into a map for field lookups.
///
/// When a key occurs more than once, the last occurrence wins.
pub fn parse_map(body: &[u8]) -> HashMap<String, String> {
    parse(body).into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_pairs_in_order() {
        let encoded = encode(&[("mode", "associate"), ("assoc_type", "HMAC-SHA1")]).unwrap();
        assert_eq!(encoded, b"mode:associate\nassoc_type:HMAC-SHA1\n");
    }

    #[test]
    fn rejects_colon_in_key() {
        assert_eq!(
            encode(&[("bad:key", "v")]),
            Err(KvError::InvalidKey("bad:key".to_string()))
        );
    }

    #[test]
    fn rejects_newline_in_value() {
        assert_eq!(
            encode(&[("key", "line1\nline2")]),
            Err(KvError::InvalidValue("key".to_string()))
        );
    }

    #[test]
    fn parses_and_strips_whitespace() {
        let pairs = parse(b"  assoc_handle : H1 \nexpires_in:3600\n\n");
        assert_eq!(
            pairs,
            vec![
                ("assoc_handle".to_string(), "H1".to_string()),
                ("expires_in".to_string(), "3600".to_string()),
            ]
        );
    }

    #[test]
    fn skips_lines_without_a_colon() {
        let pairs = parse(b"no colon here\nis_valid:true\n");
        assert_eq!(pairs, vec![("is_valid".to_string(), "true".to_string())]);
    }

    #[test]
    fn value_may_contain_colons() {
        let pairs = parse(b"server_url:https://op.example/endpoint\n");
        assert_eq!(pairs[0].1, "https://op.example/endpoint");
    }

    #[test]
    fn map_keeps_the_last_duplicate() {
        let map = parse_map(b"k:first\nk:second\n");
        assert_eq!(map.get("k").map(String::as_str), Some("second"));
    }
}
