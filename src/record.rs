//! Row building
//!
//! Each queue message becomes exactly one row with its payload in a single
//! content column. No payload is ever rejected: bytes that are not valid
//! UTF-8 are carried with replacement characters.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Default column receiving the message payload
pub const CONTENT_COLUMN: &str = "RECORD_CONTENT";

/// A sink row: column name to value
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Row {
    columns: BTreeMap<String, Value>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_column(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.columns.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Maps raw payloads to rows
#[derive(Debug, Clone)]
pub struct RowBuilder {
    content_column: String,
}

impl RowBuilder {
    pub fn new(content_column: impl Into<String>) -> Self {
        Self {
            content_column: content_column.into(),
        }
    }

    /// Build the row for one message payload
    pub fn build(&self, payload: &[u8]) -> Row {
        let content = String::from_utf8_lossy(payload).into_owned();
        Row::new().with_column(self.content_column.as_str(), content)
    }
}

impl Default for RowBuilder {
    fn default() -> Self {
        Self::new(CONTENT_COLUMN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_row() {
        let row = RowBuilder::default().build(b"hello");
        assert_eq!(row.len(), 1);
        assert_eq!(row.get(CONTENT_COLUMN), Some(&json!("hello")));
    }

    #[test]
    fn test_build_row_is_idempotent() {
        let builder = RowBuilder::default();
        let payload = br#"{"order": 42}"#;
        assert_eq!(builder.build(payload), builder.build(payload));
    }

    #[test]
    fn test_any_bytes_become_content() {
        let builder = RowBuilder::default();

        let empty = builder.build(b"");
        assert_eq!(empty.get(CONTENT_COLUMN), Some(&json!("")));

        let binary = builder.build(&[0xff, 0xfe, b'a']);
        assert_eq!(binary.get(CONTENT_COLUMN), Some(&json!("\u{fffd}\u{fffd}a")));
    }

    #[test]
    fn test_custom_content_column() {
        let row = RowBuilder::new("PAYLOAD").build(b"x");
        assert!(row.get(CONTENT_COLUMN).is_none());
        assert_eq!(row.get("PAYLOAD"), Some(&json!("x")));
    }

    #[test]
    fn test_row_serializes_as_object() {
        let row = RowBuilder::default().build(b"abc");
        assert_eq!(
            serde_json::to_value(&row).unwrap(),
            json!({ "RECORD_CONTENT": "abc" })
        );
    }
}
