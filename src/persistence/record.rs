//! Persistence records and their on-disk envelope.
//!
//! ## File format
//!
//! Every record file holds exactly three lines:
//!
//! ```text
//! @
//! {"payload":{"key":"...","value":"...","duration":600000,"unit":"MILLISECONDS"},"expire":1700000000000,"keyCodec":"json","valueCodec":"json"}
//! @
//! ```
//!
//! The `@` lines are delimiters. Key and value are codec output encoded as
//! standard base64. Unknown fields are ignored when reading, and a missing
//! `expire` reads as an already-expired record.

use crate::codec::CodecSet;
use crate::error::{PersistError, Result};
use crate::time::{now_millis, TimeUnit};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// Line that opens and closes every record file.
pub const FRAME_DELIMITER: &str = "@";

/// Default ttl applied to records created without one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultTtl {
    pub duration: u64,
    pub unit: TimeUnit,
}

/// In-memory form of a persisted entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Record<K, V> {
    pub key: K,
    pub value: V,
    /// Ttl as given by the caller, `None` when the entry was stored undated.
    pub duration: Option<u64>,
    pub unit: Option<TimeUnit>,
    /// Absolute deadline in epoch milliseconds.
    pub expire_at: i64,
    pub key_codec: String,
    pub value_codec: String,
}

impl<K, V> Record<K, V> {
    /// Creates a record whose deadline is `now + ttl`, falling back to
    /// `defaults` for a missing duration or unit.
    pub fn new(
        key: K,
        value: V,
        duration: Option<u64>,
        unit: Option<TimeUnit>,
        defaults: DefaultTtl,
        key_codec: &str,
        value_codec: &str,
    ) -> Self {
        let mut record = Self {
            key,
            value,
            duration,
            unit,
            expire_at: 0,
            key_codec: key_codec.to_string(),
            value_codec: value_codec.to_string(),
        };
        record.expire_at = deadline(now_millis(), record.ttl_millis(defaults));
        record
    }

    /// The record's ttl in milliseconds after applying defaults.
    pub fn ttl_millis(&self, defaults: DefaultTtl) -> u64 {
        let duration = self.duration.unwrap_or(defaults.duration);
        self.effective_unit(defaults).to_millis(duration)
    }

    pub fn effective_unit(&self, defaults: DefaultTtl) -> TimeUnit {
        self.unit.unwrap_or(defaults.unit)
    }

    /// Recomputes the deadline from `now` with a new ttl.
    pub fn extend(&mut self, duration: u64, unit: TimeUnit) {
        self.duration = Some(duration);
        self.unit = Some(unit);
        self.expire_at = deadline(now_millis(), unit.to_millis(duration));
    }

    /// Recomputes the deadline from `now` with the record's own ttl.
    pub fn reset(&mut self, defaults: DefaultTtl) {
        self.expire_at = deadline(now_millis(), self.ttl_millis(defaults));
    }

    /// A record whose deadline is `now` or earlier is expired.
    #[inline]
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expire_at <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }

    /// Milliseconds left before the deadline, zero once expired.
    pub fn remaining_millis_at(&self, now: i64) -> u64 {
        u64::try_from(self.expire_at.saturating_sub(now)).unwrap_or(0)
    }

    /// Encodes the record into its framed file content.
    pub fn encode(&self, keys: &CodecSet<K>, values: &CodecSet<V>) -> Result<String> {
        let key = keys.resolve(&self.key_codec)?.serialize(&self.key)?;
        let value = values.resolve(&self.value_codec)?.serialize(&self.value)?;
        let envelope = RecordEnvelope {
            payload: PayloadEnvelope {
                key: STANDARD.encode(key),
                value: STANDARD.encode(value),
                duration: self.duration,
                unit: self.unit,
            },
            expire: Some(self.expire_at),
            key_codec: self.key_codec.clone(),
            value_codec: self.value_codec.clone(),
        };
        Ok(frame(&serde_json::to_string(&envelope)?))
    }
}

fn deadline(now: i64, ttl_millis: u64) -> i64 {
    now.saturating_add(i64::try_from(ttl_millis).unwrap_or(i64::MAX))
}

/// Serialized form of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordEnvelope {
    pub payload: PayloadEnvelope,
    #[serde(default)]
    pub expire: Option<i64>,
    pub key_codec: String,
    pub value_codec: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadEnvelope {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub duration: Option<u64>,
    #[serde(default)]
    pub unit: Option<TimeUnit>,
}

impl RecordEnvelope {
    /// Parses framed file content.
    pub fn parse(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(&unframe(content))?)
    }

    /// Decodes the payload with the codecs named in the envelope.
    ///
    /// A missing deadline decodes as epoch zero, which is always expired.
    pub fn decode<K, V>(self, keys: &CodecSet<K>, values: &CodecSet<V>) -> Result<Record<K, V>> {
        let key_codec = keys.resolve(&self.key_codec)?;
        let value_codec = values.resolve(&self.value_codec)?;

        let key = key_codec.deserialize(&decode_base64(&self.payload.key)?)?;
        let value = value_codec.deserialize(&decode_base64(&self.payload.value)?)?;

        Ok(Record {
            key,
            value,
            duration: self.payload.duration,
            unit: self.payload.unit,
            expire_at: self.expire.unwrap_or(0),
            key_codec: self.key_codec,
            value_codec: self.value_codec,
        })
    }
}

fn decode_base64(text: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(text)
        .map_err(|e| PersistError::codec("base64", e))
}

/// Wraps a JSON document in delimiter lines.
pub fn frame(json: &str) -> String {
    format!("{FRAME_DELIMITER}\n{json}\n{FRAME_DELIMITER}")
}

/// Drops delimiter lines and joins the rest.
pub fn unframe(content: &str) -> String {
    content
        .lines()
        .filter(|line| line.trim_end_matches('\r') != FRAME_DELIMITER)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{JsonCodec, Utf8Codec};
    use std::sync::Arc;

    const DEFAULTS: DefaultTtl = DefaultTtl {
        duration: 30,
        unit: TimeUnit::Minutes,
    };

    fn codecs() -> (CodecSet<String>, CodecSet<String>) {
        (
            CodecSet::new(Arc::new(Utf8Codec)),
            CodecSet::new(Arc::new(JsonCodec)),
        )
    }

    fn record(duration: Option<u64>, unit: Option<TimeUnit>) -> Record<String, String> {
        Record::new(
            "a".to_string(),
            "b".to_string(),
            duration,
            unit,
            DEFAULTS,
            Utf8Codec::NAME,
            JsonCodec::NAME,
        )
    }

    #[test]
    fn test_deadline_is_absolute() {
        let before = now_millis();
        let rec = record(Some(10), Some(TimeUnit::Minutes));
        let after = now_millis();

        assert!(rec.expire_at >= before + 600_000);
        assert!(rec.expire_at <= after + 600_000);
        assert!(!rec.is_expired());
    }

    #[test]
    fn test_defaults_fill_missing_ttl() {
        let rec = record(None, None);
        assert_eq!(rec.ttl_millis(DEFAULTS), 1_800_000);

        let rec = record(Some(2), None);
        assert_eq!(rec.ttl_millis(DEFAULTS), 120_000);
        assert_eq!(rec.effective_unit(DEFAULTS), TimeUnit::Minutes);
    }

    #[test]
    fn test_expiry_boundary() {
        let mut rec = record(Some(1), Some(TimeUnit::Seconds));
        rec.expire_at = 1_000;
        assert!(rec.is_expired_at(1_000));
        assert!(!rec.is_expired_at(999));
        assert_eq!(rec.remaining_millis_at(400), 600);
        assert_eq!(rec.remaining_millis_at(5_000), 0);
    }

    #[test]
    fn test_extend_and_reset() {
        let mut rec = record(Some(1), Some(TimeUnit::Seconds));
        rec.expire_at = 0;

        rec.extend(1, TimeUnit::Hours);
        assert_eq!(rec.duration, Some(1));
        assert_eq!(rec.unit, Some(TimeUnit::Hours));
        assert!(rec.remaining_millis_at(now_millis()) > 3_590_000);

        rec.expire_at = 0;
        rec.reset(DEFAULTS);
        assert!(rec.remaining_millis_at(now_millis()) > 3_590_000);
    }

    #[test]
    fn test_encoded_file_has_three_lines() {
        let (keys, values) = codecs();
        let rec = record(Some(10), Some(TimeUnit::Minutes));
        let content = rec.encode(&keys, &values).unwrap();

        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "@");
        assert_eq!(lines[2], "@");

        let json: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(json["expire"], rec.expire_at);
        assert_eq!(json["keyCodec"], "utf8");
        assert_eq!(json["valueCodec"], "json");
        assert_eq!(json["payload"]["unit"], "MINUTES");
        assert_eq!(json["payload"]["key"], STANDARD.encode("a"));
    }

    #[test]
    fn test_decode_recovers_record() {
        let (keys, values) = codecs();
        let rec = record(Some(10), Some(TimeUnit::Minutes));
        let content = rec.encode(&keys, &values).unwrap();

        let decoded = RecordEnvelope::parse(&content)
            .unwrap()
            .decode(&keys, &values)
            .unwrap();
        assert_eq!(decoded, rec);
    }

    #[test]
    fn test_unknown_fields_and_missing_expire() {
        let json = format!(
            r#"{{"payload":{{"key":"{}","value":"{}","extra":1}},"keyCodec":"utf8","valueCodec":"utf8","version":7}}"#,
            STANDARD.encode("k"),
            STANDARD.encode("v")
        );
        let envelope = RecordEnvelope::parse(&frame(&json)).unwrap();
        assert_eq!(envelope.expire, None);

        let keys: CodecSet<String> = CodecSet::new(Arc::new(Utf8Codec));
        let values: CodecSet<String> = CodecSet::new(Arc::new(Utf8Codec));
        let rec = envelope.decode(&keys, &values).unwrap();
        assert_eq!(rec.key, "k");
        assert!(rec.is_expired());
    }

    #[test]
    fn test_unknown_codec_is_reported() {
        let (keys, values) = codecs();
        let json = r#"{"payload":{"key":"","value":""},"expire":1,"keyCodec":"protobuf","valueCodec":"json"}"#;
        let envelope = RecordEnvelope::parse(json).unwrap();
        assert!(matches!(
            envelope.decode(&keys, &values),
            Err(PersistError::CodecNotFound(name)) if name == "protobuf"
        ));
    }

    #[test]
    fn test_bad_payload_is_reported() {
        let (keys, values) = codecs();
        let json = r#"{"payload":{"key":"!!!","value":""},"expire":1,"keyCodec":"utf8","valueCodec":"json"}"#;
        let outcome = RecordEnvelope::parse(json).unwrap().decode(&keys, &values);
        assert!(matches!(outcome, Err(PersistError::Codec { ref codec, .. }) if codec == "base64"));
    }

    #[test]
    fn test_unframe() {
        assert_eq!(unframe("@\n{\"a\":\n1}\n@\n"), "{\"a\":1}");
        assert_eq!(unframe("@\r\n{}\r\n@\r\n"), "{}");
    }
}
