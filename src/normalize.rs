// ABOUTME: Normalizes change-event values into JSON-safe forms and encodes payloads
// ABOUTME: Temporal -> string, decimal -> f64 (lossy by design), nested maps recursively

use std::fmt::Write as _;

use chrono::Timelike;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{Map, Number, Value as JsonValue};

use crate::error::RelayError;
use crate::event::{ChangeEvent, FieldValue, RowImage, Temporal};

const MICROS_PER_SECOND: i64 = 1_000_000;
const MICROS_PER_MINUTE: i64 = 60 * MICROS_PER_SECOND;
const MICROS_PER_HOUR: i64 = 60 * MICROS_PER_MINUTE;
const MICROS_PER_DAY: i64 = 24 * MICROS_PER_HOUR;

/// Normalize a single value.
///
/// - Temporal values become their canonical string form.
/// - Decimals become the nearest `f64`. This loses precision for values a
///   double cannot represent; consumers rely on numeric payloads, so the
///   conversion is kept as is.
/// - Nested maps are normalized recursively and stay maps.
/// - Everything else passes through unchanged.
///
/// Normalization is total and idempotent.
pub fn normalize(value: FieldValue) -> FieldValue {
    match value {
        FieldValue::Temporal(temporal) => FieldValue::String(format_temporal(&temporal)),
        FieldValue::Decimal(decimal) => FieldValue::Float(decimal_to_f64(&decimal)),
        FieldValue::Map(row) => FieldValue::Map(normalize_row(row)),
        other => other,
    }
}

/// Normalize every value of a row image, keeping column order.
pub fn normalize_row(row: RowImage) -> RowImage {
    row.into_iter()
        .map(|(name, value)| (name, normalize(value)))
        .collect()
}

/// Canonical, locale-independent string form of a temporal value.
///
/// Matches the historical wire format: `2024-01-02 03:04:05[.ffffff]`,
/// `2024-01-02`, and `[N day[s], ]H:MM:SS[.ffffff]` for durations.
pub fn format_temporal(temporal: &Temporal) -> String {
    match temporal {
        Temporal::DateTime(datetime) => {
            let mut out = datetime.format("%Y-%m-%d %H:%M:%S").to_string();
            let micros = (datetime.nanosecond() % 1_000_000_000) / 1_000;
            if micros != 0 {
                let _ = write!(out, ".{:06}", micros);
            }
            out
        }
        Temporal::Date(date) => date.format("%Y-%m-%d").to_string(),
        Temporal::Duration(duration) => format_duration(duration),
    }
}

fn format_duration(duration: &chrono::Duration) -> String {
    let total = duration
        .num_microseconds()
        .unwrap_or_else(|| duration.num_milliseconds().saturating_mul(1_000));
    // Days use floor division so the clock part is never negative.
    let days = total.div_euclid(MICROS_PER_DAY);
    let rem = total.rem_euclid(MICROS_PER_DAY);
    let hours = rem / MICROS_PER_HOUR;
    let minutes = (rem % MICROS_PER_HOUR) / MICROS_PER_MINUTE;
    let seconds = (rem % MICROS_PER_MINUTE) / MICROS_PER_SECOND;
    let micros = rem % MICROS_PER_SECOND;

    let mut out = String::new();
    if days != 0 {
        let plural = if days.abs() == 1 { "" } else { "s" };
        let _ = write!(out, "{} day{}, ", days, plural);
    }
    let _ = write!(out, "{}:{:02}:{:02}", hours, minutes, seconds);
    if micros != 0 {
        let _ = write!(out, ".{:06}", micros);
    }
    out
}

/// Nearest double to the decimal. Parsing the decimal's string form gives a
/// correctly rounded result.
pub fn decimal_to_f64(decimal: &Decimal) -> f64 {
    decimal
        .to_string()
        .parse::<f64>()
        .ok()
        .or_else(|| decimal.to_f64())
        .unwrap_or(f64::NAN)
}

/// Shape of the published payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFormat {
    /// The normalized row image only, e.g. `{"id":1}`.
    #[default]
    Row,
    /// `{"schema", "table", "type", "row"}`, the legacy relay format.
    Envelope,
}

/// How byte values that are not valid UTF-8 are encoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryEncoding {
    /// Non-UTF-8 blobs are unencodable; the event fails serialization.
    #[default]
    Reject,
    /// `{"_type": "blob", "data": "<base64>"}`.
    Base64,
}

/// A change event encoded for publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedMessage {
    /// Topic name; always the source table name.
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Normalizes events and encodes them as JSON payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct PayloadEncoder {
    format: PayloadFormat,
    binary: BinaryEncoding,
}

impl PayloadEncoder {
    pub fn new(format: PayloadFormat, binary: BinaryEncoding) -> Self {
        Self { format, binary }
    }

    pub fn format(&self) -> PayloadFormat {
        self.format
    }

    /// Normalize and serialize an event.
    ///
    /// Fails with [`RelayError::Serialization`] on data JSON cannot carry:
    /// non-finite floats and, unless base64 is enabled, non-UTF-8 blobs.
    pub fn encode(&self, event: ChangeEvent) -> Result<SerializedMessage, RelayError> {
        let ChangeEvent {
            schema,
            table,
            kind,
            fields,
        } = event;

        let row = match row_to_json(normalize_row(fields), self.binary) {
            Ok(row) => row,
            Err(reason) => {
                return Err(RelayError::Serialization {
                    schema,
                    table,
                    reason,
                })
            }
        };

        let document = match self.format {
            PayloadFormat::Row => row,
            PayloadFormat::Envelope => serde_json::json!({
                "schema": schema,
                "table": table,
                "type": kind.as_str(),
                "row": row,
            }),
        };

        let payload = serde_json::to_vec(&document).map_err(|err| RelayError::Serialization {
            schema: schema.clone(),
            table: table.clone(),
            reason: err.to_string(),
        })?;

        Ok(SerializedMessage {
            topic: table,
            payload,
        })
    }
}

fn row_to_json(row: RowImage, binary: BinaryEncoding) -> Result<JsonValue, String> {
    let mut object = Map::with_capacity(row.len());
    for (name, value) in row {
        let json = value_to_json(value, binary)
            .map_err(|reason| format!("field '{}': {}", name, reason))?;
        object.insert(name, json);
    }
    Ok(JsonValue::Object(object))
}

fn value_to_json(value: FieldValue, binary: BinaryEncoding) -> Result<JsonValue, String> {
    match value {
        FieldValue::Null => Ok(JsonValue::Null),
        FieldValue::Bool(b) => Ok(JsonValue::Bool(b)),
        FieldValue::Int(i) => Ok(JsonValue::Number(i.into())),
        FieldValue::UInt(u) => Ok(JsonValue::Number(u.into())),
        FieldValue::Float(f) => float_to_json(f),
        FieldValue::String(s) => Ok(JsonValue::String(s)),
        FieldValue::Bytes(bytes) => bytes_to_json(bytes, binary),
        FieldValue::Temporal(temporal) => Ok(JsonValue::String(format_temporal(&temporal))),
        FieldValue::Decimal(decimal) => float_to_json(decimal_to_f64(&decimal)),
        FieldValue::Map(row) => row_to_json(row, binary),
        FieldValue::Json(json) => Ok(json),
    }
}

fn float_to_json(value: f64) -> Result<JsonValue, String> {
    Number::from_f64(value)
        .map(JsonValue::Number)
        .ok_or_else(|| format!("non-finite float {} has no JSON representation", value))
}

fn bytes_to_json(bytes: Vec<u8>, binary: BinaryEncoding) -> Result<JsonValue, String> {
    match String::from_utf8(bytes) {
        Ok(text) => Ok(JsonValue::String(text)),
        Err(err) => match binary {
            BinaryEncoding::Reject => Err(format!(
                "{} bytes of binary data are not valid UTF-8",
                err.as_bytes().len()
            )),
            BinaryEncoding::Base64 => {
                let encoded = base64::Engine::encode(
                    &base64::engine::general_purpose::STANDARD,
                    err.as_bytes(),
                );
                Ok(serde_json::json!({
                    "_type": "blob",
                    "data": encoded
                }))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use chrono::{NaiveDate, NaiveDateTime};
    use std::str::FromStr;

    fn datetime(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").unwrap()
    }

    #[test]
    fn datetime_normalizes_to_string() {
        let value = FieldValue::from(datetime("2024-03-05 07:08:09"));
        assert_eq!(
            normalize(value),
            FieldValue::String("2024-03-05 07:08:09".to_string())
        );
    }

    #[test]
    fn datetime_with_fraction_uses_six_digits() {
        let value = FieldValue::from(datetime("2024-03-05 07:08:09.5"));
        assert_eq!(
            normalize(value),
            FieldValue::String("2024-03-05 07:08:09.500000".to_string())
        );
    }

    #[test]
    fn date_normalizes_to_iso_date() {
        let value = FieldValue::from(NaiveDate::from_ymd_opt(999, 1, 2).unwrap());
        assert_eq!(normalize(value), FieldValue::String("0999-01-02".to_string()));
    }

    #[test]
    fn durations_format_like_timedelta() {
        let cases = [
            (chrono::Duration::seconds(3723), "1:02:03"),
            (chrono::Duration::hours(-1), "-1 day, 23:00:00"),
            (chrono::Duration::days(2), "2 days, 0:00:00"),
            (
                chrono::Duration::hours(25) + chrono::Duration::microseconds(42),
                "1 day, 1:00:00.000042",
            ),
            (chrono::Duration::zero(), "0:00:00"),
        ];
        for (duration, expected) in cases {
            assert_eq!(
                normalize(FieldValue::from(duration)),
                FieldValue::String(expected.to_string()),
                "duration {:?}",
                duration
            );
        }
    }

    #[test]
    fn temporal_normalization_is_idempotent() {
        let values = vec![
            FieldValue::from(datetime("2023-12-31 23:59:59.000001")),
            FieldValue::from(NaiveDate::from_ymd_opt(2020, 2, 29).unwrap()),
            FieldValue::from(chrono::Duration::minutes(-90)),
        ];
        for value in values {
            let once = normalize(value);
            assert!(matches!(once, FieldValue::String(_)));
            assert_eq!(normalize(once.clone()), once);
        }
    }

    #[test]
    fn decimal_becomes_nearest_double() {
        let value = FieldValue::from(Decimal::from_str("12.50").unwrap());
        assert_eq!(normalize(value), FieldValue::Float(12.5));
    }

    #[test]
    fn decimal_beyond_double_precision_loses_digits() {
        // 2^53 + 1 is the first integer a double cannot hold.
        let exact = Decimal::from_str("9007199254740993").unwrap();
        assert_eq!(
            normalize(FieldValue::from(exact)),
            FieldValue::Float(9007199254740992.0)
        );

        let long_fraction = Decimal::from_str("0.1234567890123456789012345678").unwrap();
        let expected = "0.1234567890123456789012345678".parse::<f64>().unwrap();
        assert_eq!(
            normalize(FieldValue::from(long_fraction)),
            FieldValue::Float(expected)
        );
        assert_ne!(expected.to_string(), "0.1234567890123456789012345678");
    }

    #[test]
    fn nested_maps_are_normalized_recursively() {
        let inner = RowImage::new()
            .with("price", Decimal::from_str("1.25").unwrap())
            .with("at", NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        let row = RowImage::new().with("id", 7i64).with("after_values", inner);

        let normalized = normalize_row(row);
        let Some(FieldValue::Map(inner)) = normalized.get("after_values") else {
            panic!("nested map should stay a map");
        };
        assert_eq!(inner.get("price"), Some(&FieldValue::Float(1.25)));
        assert_eq!(
            inner.get("at"),
            Some(&FieldValue::String("2024-01-01".to_string()))
        );
        assert_eq!(normalized.get("id"), Some(&FieldValue::Int(7)));
    }

    #[test]
    fn primitive_values_pass_through() {
        let values = vec![
            FieldValue::Null,
            FieldValue::Bool(true),
            FieldValue::Int(-3),
            FieldValue::UInt(u64::MAX),
            FieldValue::Float(0.25),
            FieldValue::String("text".to_string()),
            FieldValue::Bytes(vec![0, 159, 146, 150]),
            FieldValue::Json(serde_json::json!({"a": [1, 2]})),
        ];
        for value in values {
            assert_eq!(normalize(value.clone()), value);
        }
    }

    #[test]
    fn row_payload_keeps_column_order() {
        let event = ChangeEvent::new(
            "shop",
            "orders",
            EventKind::Insert,
            RowImage::new().with("zeta", 1i64).with("alpha", "x"),
        );
        let message = PayloadEncoder::default().encode(event).unwrap();
        assert_eq!(message.topic, "orders");
        assert_eq!(
            String::from_utf8(message.payload).unwrap(),
            r#"{"zeta":1,"alpha":"x"}"#
        );
    }

    #[test]
    fn envelope_payload_wraps_row() {
        let event = ChangeEvent::new(
            "shop",
            "orders",
            EventKind::Update,
            RowImage::new().with("id", 1i64),
        );
        let encoder = PayloadEncoder::new(PayloadFormat::Envelope, BinaryEncoding::Reject);
        let message = encoder.encode(event).unwrap();
        let decoded: JsonValue = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(
            decoded,
            serde_json::json!({
                "schema": "shop",
                "table": "orders",
                "type": "UpdateRowsEvent",
                "row": {"id": 1}
            })
        );
    }

    #[test]
    fn utf8_bytes_encode_as_strings() {
        let event = ChangeEvent::new(
            "shop",
            "orders",
            EventKind::Insert,
            RowImage::new().with("note", FieldValue::Bytes(b"hello".to_vec())),
        );
        let message = PayloadEncoder::default().encode(event).unwrap();
        assert_eq!(message.payload, br#"{"note":"hello"}"#.to_vec());
    }

    #[test]
    fn binary_blob_rejected_by_default() {
        let event = ChangeEvent::new(
            "shop",
            "files",
            EventKind::Insert,
            RowImage::new().with("data", FieldValue::Bytes(vec![0xff, 0xfe])),
        );
        let err = PayloadEncoder::default().encode(event).unwrap_err();
        match err {
            RelayError::Serialization { table, reason, .. } => {
                assert_eq!(table, "files");
                assert!(reason.contains("data"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn binary_blob_base64_when_enabled() {
        let event = ChangeEvent::new(
            "shop",
            "files",
            EventKind::Insert,
            RowImage::new().with("data", FieldValue::Bytes(vec![0xff, 0xfe])),
        );
        let encoder = PayloadEncoder::new(PayloadFormat::Row, BinaryEncoding::Base64);
        let message = encoder.encode(event).unwrap();
        let decoded: JsonValue = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(decoded["data"]["_type"], "blob");
        assert_eq!(decoded["data"]["data"], "//4=");
    }

    #[test]
    fn non_finite_float_fails_serialization() {
        let event = ChangeEvent::new(
            "shop",
            "metrics",
            EventKind::Insert,
            RowImage::new().with("ratio", f64::NAN),
        );
        assert!(matches!(
            PayloadEncoder::default().encode(event),
            Err(RelayError::Serialization { .. })
        ));
    }
}
