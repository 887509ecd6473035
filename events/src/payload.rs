use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// The kind of row change carried by a [`ChangePayload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChangeKind::Insert => write!(f, "INSERT"),
            ChangeKind::Update => write!(f, "UPDATE"),
            ChangeKind::Delete => write!(f, "DELETE"),
        }
    }
}

/// Which change kinds a subscription wants to receive.
/// `All` is written as `*` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EventSelector {
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
    #[default]
    #[serde(rename = "*")]
    All,
}

impl EventSelector {
    /// Returns true when a change of `kind` should reach this selector.
    pub fn matches(&self, kind: ChangeKind) -> bool {
        match self {
            EventSelector::All => true,
            EventSelector::Insert => kind == ChangeKind::Insert,
            EventSelector::Update => kind == ChangeKind::Update,
            EventSelector::Delete => kind == ChangeKind::Delete,
        }
    }

    /// Returns true when every change matched by `other` is also matched by `self`.
    pub fn covers(&self, other: EventSelector) -> bool {
        *self == EventSelector::All || *self == other
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventSelector::Insert => "INSERT",
            EventSelector::Update => "UPDATE",
            EventSelector::Delete => "DELETE",
            EventSelector::All => "*",
        }
    }
}

impl fmt::Display for EventSelector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseSelectorError(pub String);

impl fmt::Display for ParseSelectorError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "unknown event selector: {}", self.0)
    }
}

impl std::error::Error for ParseSelectorError {}

impl FromStr for EventSelector {
    type Err = ParseSelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "INSERT" => Ok(EventSelector::Insert),
            "UPDATE" => Ok(EventSelector::Update),
            "DELETE" => Ok(EventSelector::Delete),
            "*" | "ALL" => Ok(EventSelector::All),
            _ => Err(ParseSelectorError(s.to_string())),
        }
    }
}

/// A single row change on a table, as pushed by the realtime service.
///
/// Field names follow the service's wire format (`eventType`,
/// `commit_timestamp`, `new`, `old`) so payloads round-trip through JSON
/// without an extra mapping layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangePayload {
    pub schema: String,
    pub table: String,
    #[serde(rename = "eventType")]
    pub event_type: ChangeKind,
    /// When the originating transaction committed. Used for latency metrics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_timestamp: Option<DateTime<Utc>>,
    /// Row after the change (INSERT/UPDATE).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<Value>,
    /// Row before the change (UPDATE/DELETE).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,
}

impl ChangePayload {
    pub fn insert(schema: impl Into<String>, table: impl Into<String>, record: Value) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            event_type: ChangeKind::Insert,
            commit_timestamp: None,
            new: Some(record),
            old: None,
        }
    }

    pub fn update(
        schema: impl Into<String>,
        table: impl Into<String>,
        old: Value,
        new: Value,
    ) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            event_type: ChangeKind::Update,
            commit_timestamp: None,
            new: Some(new),
            old: Some(old),
        }
    }

    pub fn delete(schema: impl Into<String>, table: impl Into<String>, old: Value) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            event_type: ChangeKind::Delete,
            commit_timestamp: None,
            new: None,
            old: Some(old),
        }
    }

    /// Stamp the payload with its commit time.
    pub fn committed_at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.commit_timestamp = Some(timestamp);
        self
    }

    /// The most relevant row image: `new` when present, otherwise `old`.
    pub fn record(&self) -> Option<&Value> {
        self.new.as_ref().or(self.old.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn selector_all_matches_every_kind() {
        assert!(EventSelector::All.matches(ChangeKind::Insert));
        assert!(EventSelector::All.matches(ChangeKind::Update));
        assert!(EventSelector::All.matches(ChangeKind::Delete));
        assert!(EventSelector::Insert.matches(ChangeKind::Insert));
        assert!(!EventSelector::Insert.matches(ChangeKind::Delete));
    }

    #[test]
    fn selector_covers() {
        assert!(EventSelector::All.covers(EventSelector::Update));
        assert!(EventSelector::Update.covers(EventSelector::Update));
        assert!(!EventSelector::Update.covers(EventSelector::All));
        assert!(!EventSelector::Insert.covers(EventSelector::Delete));
    }

    #[test]
    fn selector_parses_wire_names() {
        assert_eq!("*".parse::<EventSelector>(), Ok(EventSelector::All));
        assert_eq!("insert".parse::<EventSelector>(), Ok(EventSelector::Insert));
        assert_eq!(" DELETE ".parse::<EventSelector>(), Ok(EventSelector::Delete));
        assert!("upsert".parse::<EventSelector>().is_err());
    }

    #[test]
    fn payload_uses_wire_field_names() {
        let payload = ChangePayload::update(
            "public",
            "posts",
            json!({"id": 5, "title": "Apples"}),
            json!({"id": 5, "title": "Pears"}),
        );

        let wire = serde_json::to_value(&payload).unwrap();
        assert_eq!(wire["eventType"], "UPDATE");
        assert_eq!(wire["table"], "posts");
        assert_eq!(wire["new"]["title"], "Pears");
        assert!(wire.get("commit_timestamp").is_none());
    }

    #[test]
    fn payload_parses_service_message() {
        let payload: ChangePayload = serde_json::from_value(json!({
            "schema": "public",
            "table": "posts",
            "eventType": "DELETE",
            "commit_timestamp": "2024-05-01T10:00:00Z",
            "old": {"id": 9}
        }))
        .unwrap();

        assert_eq!(payload.event_type, ChangeKind::Delete);
        assert!(payload.commit_timestamp.is_some());
        assert_eq!(payload.record(), Some(&json!({"id": 9})));
    }
}
