// ABOUTME: Row-level change events produced by the log-tailing source
// ABOUTME: Field values are a closed sum type; row images keep column order

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;

use crate::checkpoint::ResumePosition;

/// Kind of row mutation relayed downstream. Deletes are not captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Insert,
    Update,
}

impl EventKind {
    /// Binlog event name, used by the envelope payload format.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Insert => "WriteRowsEvent",
            EventKind::Update => "UpdateRowsEvent",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Temporal column values.
#[derive(Debug, Clone, PartialEq)]
pub enum Temporal {
    DateTime(NaiveDateTime),
    Date(NaiveDate),
    /// MySQL TIME columns, which may be negative or exceed 24 hours.
    Duration(chrono::Duration),
}

/// A single column value as decoded from the transaction log.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Temporal(Temporal),
    Decimal(Decimal),
    Map(RowImage),
    /// Already-structured JSON, passed through untouched.
    Json(serde_json::Value),
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl From<Decimal> for FieldValue {
    fn from(value: Decimal) -> Self {
        FieldValue::Decimal(value)
    }
}

impl From<NaiveDateTime> for FieldValue {
    fn from(value: NaiveDateTime) -> Self {
        FieldValue::Temporal(Temporal::DateTime(value))
    }
}

impl From<NaiveDate> for FieldValue {
    fn from(value: NaiveDate) -> Self {
        FieldValue::Temporal(Temporal::Date(value))
    }
}

impl From<chrono::Duration> for FieldValue {
    fn from(value: chrono::Duration) -> Self {
        FieldValue::Temporal(Temporal::Duration(value))
    }
}

impl From<RowImage> for FieldValue {
    fn from(value: RowImage) -> Self {
        FieldValue::Map(value)
    }
}

/// Ordered mapping of column name to value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowImage(Vec<(String, FieldValue)>);

impl RowImage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self(Vec::with_capacity(capacity))
    }

    /// Insert a field, replacing the value of an existing field with the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = value,
            None => self.0.push((name, value)),
        }
    }

    /// Builder-style [`RowImage::insert`].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.0
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, FieldValue)> for RowImage {
    fn from_iter<I: IntoIterator<Item = (String, FieldValue)>>(iter: I) -> Self {
        let mut image = RowImage::new();
        for (name, value) in iter {
            image.insert(name, value);
        }
        image
    }
}

impl IntoIterator for RowImage {
    type Item = (String, FieldValue);
    type IntoIter = std::vec::IntoIter<(String, FieldValue)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// One row-level mutation read from the transaction log.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub schema: String,
    pub table: String,
    pub kind: EventKind,
    /// Flat row image for inserts; `before_values` / `after_values` maps for updates.
    pub fields: RowImage,
}

impl ChangeEvent {
    pub fn new(
        schema: impl Into<String>,
        table: impl Into<String>,
        kind: EventKind,
        fields: RowImage,
    ) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            kind,
            fields,
        }
    }

    /// Get the qualified table name (schema.table)
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

/// A change event together with the source position that is safe to
/// resume from once the event has been handed to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub event: ChangeEvent,
    pub position: ResumePosition,
}

/// What a change source yields, in log order.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceItem {
    /// A row change.
    Change(SourceRecord),
    /// The log moved past a commit or rotation without a row change.
    Position(ResumePosition),
}

impl From<SourceRecord> for SourceItem {
    fn from(record: SourceRecord) -> Self {
        SourceItem::Change(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_image_keeps_insertion_order() {
        let row = RowImage::new()
            .with("zeta", 1i64)
            .with("alpha", "a")
            .with("mid", true);
        let names: Vec<&str> = row.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn row_image_insert_replaces_existing_field() {
        let mut row = RowImage::new().with("id", 1i64);
        row.insert("id", 2i64);
        assert_eq!(row.len(), 1);
        assert_eq!(row.get("id"), Some(&FieldValue::Int(2)));
    }

    #[test]
    fn event_kind_uses_binlog_event_names() {
        assert_eq!(EventKind::Insert.as_str(), "WriteRowsEvent");
        assert_eq!(EventKind::Update.to_string(), "UpdateRowsEvent");
    }

    #[test]
    fn qualified_name_joins_schema_and_table() {
        let event = ChangeEvent::new("shop", "orders", EventKind::Insert, RowImage::new());
        assert_eq!(event.qualified_name(), "shop.orders");
    }
}
