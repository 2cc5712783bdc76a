//! The on-disk/WAL record format: `key,value\n`, no escaping.
//!
//! Keys and values may not contain a comma or a newline, since those are the
//! record delimiters. Both the WAL and every segment file share this format.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum KvError {
    #[error("key or value contains a forbidden delimiter (comma or newline)")]
    ForbiddenDelimiter,

    #[error("key must not be empty")]
    EmptyKey,

    #[error("malformed record line: {0:?}")]
    Corruption(String),
}

type Result<T> = std::result::Result<T, KvError>;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct KVPair {
    pub key: String,
    pub value: String,
}

/// Rejects keys/values that would corrupt the `key,value\n` record format.
pub fn validate(key: &str, value: &str) -> Result<()> {
    if key.is_empty() {
        return Err(KvError::EmptyKey);
    }
    if contains_delimiter(key) || contains_delimiter(value) {
        return Err(KvError::ForbiddenDelimiter);
    }
    Ok(())
}

fn contains_delimiter(s: &str) -> bool {
    s.contains(',') || s.contains('\n')
}

/// Serializes a key/value pair as a single `key,value\n` record.
pub fn to_record(key: &str, value: &str) -> String {
    let mut record = String::with_capacity(key.len() + value.len() + 2);
    record.push_str(key);
    record.push(',');
    record.push_str(value);
    record.push('\n');
    record
}

/// Parses a single record line (without its trailing newline) into a
/// [`KVPair`]. The value may itself contain no comma, so splitting on the
/// first comma is sufficient and unambiguous.
pub fn parse_record(line: &str) -> Result<KVPair> {
    match line.split_once(',') {
        Some((key, value)) => Ok(KVPair {
            key: key.to_owned(),
            value: value.to_owned(),
        }),
        None => Err(KvError::Corruption(line.to_owned())),
    }
}

/// Extracts just the key from a record line, the hot path used by segment
/// binary search.
pub fn parse_key(line: &str) -> Result<&str> {
    match line.split_once(',') {
        Some((key, _)) => Ok(key),
        None => Err(KvError::Corruption(line.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let record = to_record("k1", "v1");
        assert_eq!(record, "k1,v1\n");
        let parsed = parse_record("k1,v1").unwrap();
        assert_eq!(parsed.key, "k1");
        assert_eq!(parsed.value, "v1");
    }

    #[test]
    fn value_may_contain_commas() {
        let parsed = parse_record("k1,v1,v2").unwrap();
        assert_eq!(parsed.key, "k1");
        assert_eq!(parsed.value, "v1,v2");
    }

    #[test]
    fn rejects_delimiters() {
        assert!(validate("a,b", "v").is_err());
        assert!(validate("a\nb", "v").is_err());
        assert!(validate("", "v").is_err());
        assert!(validate("k", "v\nv").is_err());
    }

    #[test]
    fn empty_value_is_allowed() {
        assert!(validate("k", "").is_ok());
    }

    #[test]
    fn corrupted_line_is_rejected() {
        assert!(parse_record("no-delimiter-here").is_err());
    }
}
