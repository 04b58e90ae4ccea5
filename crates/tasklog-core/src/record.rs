//! Conversation records and the two log kinds a task owns.
//!
//! A [`Record`] is kept as the insertion-ordered JSON object it was read as.
//! The store never narrows it through a fixed schema: well-known fields are
//! exposed as typed views, and everything else rides along untouched, so a
//! read/write cycle reproduces the same fields in the same order.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Well-known field names.
pub const FIELD_ROLE: &str = "role";
pub const FIELD_CONTENT: &str = "content";
pub const FIELD_TS: &str = "ts";
pub const FIELD_IS_SUMMARY: &str = "isSummary";
pub const FIELD_CONDENSE_ID: &str = "condenseId";
pub const FIELD_CONDENSE_PARENT: &str = "condenseParent";
pub const FIELD_TRUNCATION_ID: &str = "truncationId";
pub const FIELD_TRUNCATION_PARENT: &str = "truncationParent";
pub const FIELD_IS_TRUNCATION_MARKER: &str = "isTruncationMarker";

/// One turn of a conversation log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: Map<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for a `{"role": .., "content": ..}` turn.
    pub fn message(role: &str, content: impl Into<Value>) -> Self {
        Self::new()
            .with_field(FIELD_ROLE, role)
            .with_field(FIELD_CONTENT, content)
    }

    /// Builder-style insert. Replacing an existing key keeps its position.
    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn role(&self) -> Option<&str> {
        self.str_field(FIELD_ROLE)
    }

    pub fn content(&self) -> Option<&Value> {
        self.fields.get(FIELD_CONTENT)
    }

    /// Timestamp in milliseconds since the Unix epoch.
    pub fn ts(&self) -> Option<u64> {
        self.fields.get(FIELD_TS).and_then(Value::as_u64)
    }

    pub fn is_summary(&self) -> bool {
        self.bool_field(FIELD_IS_SUMMARY)
    }

    /// Identifier of a condense summary that replaces earlier records.
    pub fn condense_id(&self) -> Option<&str> {
        self.str_field(FIELD_CONDENSE_ID)
    }

    /// The `condenseId` of the summary that supersedes this record.
    pub fn condense_parent(&self) -> Option<&str> {
        self.str_field(FIELD_CONDENSE_PARENT)
    }

    pub fn truncation_id(&self) -> Option<&str> {
        self.str_field(FIELD_TRUNCATION_ID)
    }

    /// The `truncationId` of the marker that hides this record.
    pub fn truncation_parent(&self) -> Option<&str> {
        self.str_field(FIELD_TRUNCATION_PARENT)
    }

    pub fn is_truncation_marker(&self) -> bool {
        self.bool_field(FIELD_IS_TRUNCATION_MARKER)
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    fn bool_field(&self, key: &str) -> bool {
        self.fields
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Which of a task's two logs a store operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogKind {
    /// Turns in the provider API's message format.
    Api,
    /// Turns as displayed by the UI.
    Ui,
}

impl LogKind {
    /// Name of the authoritative file inside the task directory.
    pub fn canonical_file_name(self) -> &'static str {
        match self {
            LogKind::Api => "api_conversation_history.json",
            LogKind::Ui => "ui_messages.json",
        }
    }

    /// Older name this log was stored under, migrated away from on read.
    pub fn legacy_file_name(self) -> Option<&'static str> {
        match self {
            LogKind::Api => Some("claude_messages.json"),
            LogKind::Ui => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            LogKind::Api => "api",
            LogKind::Ui => "ui",
        }
    }
}
