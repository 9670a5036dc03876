//! Canonical payload encoding.
//!
//! A payload binds a record's identity fields to the signing context:
//!
//! ```text
//! sig-v1|<table>|<field_1>|...|<field_n>|<session_id>|<device_info>|<timestamp>
//! ```
//!
//! The material actually hashed at sign time appends the signer's user id
//! (`...|<timestamp>|<user_id>`), see
//! [`CanonicalPayloadBuilder::build_signing_payload`].
//!
//! Every value is escaped (`\` becomes `\\`, `|` becomes `\|`), so the
//! delimiter never appears unescaped inside a value. `NULL` is written as
//! `\N`, which escaping can never produce, so `None` and `Some("")` encode
//! differently. Timestamps are converted to UTC and rendered with
//! microsecond precision, independent of the host timezone or locale.

use std::fmt::Write as _;

use chrono::{DateTime, SecondsFormat, SubsecRound, TimeZone, Utc};

use crate::entity::Signable;
use crate::error::EngineError;

/// Version tag that opens every payload.
pub const PAYLOAD_VERSION: &str = "sig-v1";

/// Field delimiter.
pub const FIELD_DELIMITER: char = '|';

/// Encoding of a `NULL` field.
pub const NULL_MARKER: &str = "\\N";

/// Formats a timestamp the way payloads and `signed_at` columns store it:
/// UTC, microsecond precision, `Z` suffix.
#[must_use]
pub fn canonical_timestamp<Tz: TimeZone>(timestamp: &DateTime<Tz>) -> String {
    timestamp
        .with_timezone(&Utc)
        .to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parses a timestamp written by [`canonical_timestamp`] (or any RFC 3339
/// timestamp) back into UTC.
///
/// # Errors
///
/// Returns [`EngineError::Validation`] if `text` is not RFC 3339.
pub fn parse_canonical_timestamp(text: &str) -> Result<DateTime<Utc>, EngineError> {
    DateTime::parse_from_rfc3339(text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| EngineError::validation("timestamp", format!("'{text}': {e}")))
}

/// Converts to UTC and drops precision below one microsecond, so the value
/// survives a round-trip through [`canonical_timestamp`].
#[must_use]
pub fn normalize_timestamp<Tz: TimeZone>(timestamp: &DateTime<Tz>) -> DateTime<Utc> {
    timestamp.with_timezone(&Utc).trunc_subsecs(6)
}

/// Builds canonical payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct CanonicalPayloadBuilder;

impl CanonicalPayloadBuilder {
    /// Encodes `entity` together with the signing context.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] if the table name is empty or a
    /// required identity field is missing or blank.
    pub fn build_payload<Tz: TimeZone>(
        entity: &dyn Signable,
        session_id: Option<&str>,
        device_info: Option<&str>,
        timestamp: &DateTime<Tz>,
    ) -> Result<String, EngineError> {
        let table = entity.table_name();
        if table.trim().is_empty() {
            return Err(EngineError::validation("table_name", "canonical payload"));
        }

        let fields = entity.canonical_fields();
        let mut out = String::with_capacity(64 + fields.len() * 16);
        out.push_str(PAYLOAD_VERSION);
        push_value(&mut out, Some(table));

        for field in &fields {
            let blank = field.value.as_deref().is_none_or(|v| v.trim().is_empty());
            if field.required && blank {
                return Err(EngineError::validation(
                    field.name,
                    format!("{table} payload"),
                ));
            }
            push_value(&mut out, field.value.as_deref());
        }

        push_value(&mut out, session_id);
        push_value(&mut out, device_info);
        push_value(&mut out, Some(&canonical_timestamp(timestamp)));
        Ok(out)
    }

    /// Encodes `entity` and the full signing context, including who signed.
    ///
    /// This is [`Self::build_payload`] followed by `|<user_id>`. Signature
    /// hashes are computed over this form, so reassigning a stored
    /// signature to another user breaks verification.
    ///
    /// # Errors
    ///
    /// As [`Self::build_payload`].
    pub fn build_signing_payload<Tz: TimeZone>(
        entity: &dyn Signable,
        user_id: i64,
        session_id: Option<&str>,
        device_info: Option<&str>,
        timestamp: &DateTime<Tz>,
    ) -> Result<String, EngineError> {
        let mut out = Self::build_payload(entity, session_id, device_info, timestamp)?;
        push_value(&mut out, Some(&user_id.to_string()));
        Ok(out)
    }
}

fn push_value(out: &mut String, value: Option<&str>) {
    out.push(FIELD_DELIMITER);
    match value {
        None => out.push_str(NULL_MARKER),
        Some(v) => {
            for c in v.chars() {
                if c == '\\' || c == FIELD_DELIMITER {
                    out.push('\\');
                }
                out.push(c);
            }
        },
    }
}

/// Escapes a single value exactly as it appears inside a payload.
#[must_use]
pub fn escape_value(value: Option<&str>) -> String {
    let mut out = String::new();
    push_value(&mut out, value);
    // Drop the leading delimiter added by push_value.
    out.split_off(FIELD_DELIMITER.len_utf8())
}

/// Renders a payload for logs with the timestamp elided, e.g. when
/// comparing two payloads that differ only in signing time.
#[must_use]
pub fn describe_fields(entity: &dyn Signable) -> String {
    let mut out = String::new();
    for (i, field) in entity.canonical_fields().iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{}={}", field.name, escape_value(field.value.as_deref()));
    }
    out
}

#[cfg(test)]
mod tests {
    use chrono::FixedOffset;
    use proptest::prelude::*;

    use super::*;
    use crate::entity::{CanonicalField, EntitySnapshot, Machine, Part};

    fn at_noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 17, 12, 0, 0).unwrap()
    }

    #[test]
    fn machine_payload_layout() {
        let machine = Machine::new(7, "MX-7");
        let payload = CanonicalPayloadBuilder::build_payload(
            &machine,
            Some("sess-1"),
            Some("Device-A"),
            &at_noon(),
        )
        .unwrap();

        assert_eq!(
            payload,
            "sig-v1|machines|7|MX-7|\\N|\\N|sess-1|Device-A|2024-05-17T12:00:00.000000Z"
        );
    }

    #[test]
    fn signing_payload_appends_user() {
        let machine = Machine::new(7, "MX-7");
        let base =
            CanonicalPayloadBuilder::build_payload(&machine, Some("sess-1"), None, &at_noon()).unwrap();
        let signed = CanonicalPayloadBuilder::build_signing_payload(
            &machine,
            42,
            Some("sess-1"),
            None,
            &at_noon(),
        )
        .unwrap();

        assert_eq!(signed, format!("{base}|42"));
    }

    #[test]
    fn delimiter_in_values_cannot_shift_fields() {
        let a = Part::new(1, "A|").with_name("B");
        let b = Part::new(1, "A").with_name("|B");

        let pa = CanonicalPayloadBuilder::build_payload(&a, None, None, &at_noon()).unwrap();
        let pb = CanonicalPayloadBuilder::build_payload(&b, None, None, &at_noon()).unwrap();
        assert_ne!(pa, pb);
    }

    #[test]
    fn null_empty_and_literal_marker_differ() {
        let null = Part::new(1, "A");
        let empty = Part::new(1, "A").with_name("");
        let literal = Part::new(1, "A").with_name("\\N");

        let payloads: Vec<_> = [&null, &empty, &literal]
            .iter()
            .map(|p| CanonicalPayloadBuilder::build_payload(*p, None, None, &at_noon()).unwrap())
            .collect();

        assert_ne!(payloads[0], payloads[1]);
        assert_ne!(payloads[0], payloads[2]);
        assert_ne!(payloads[1], payloads[2]);
        assert!(payloads[2].contains("|\\\\N|"));
    }

    #[test]
    fn missing_primary_key_is_rejected() {
        let snapshot = EntitySnapshot::new(
            "machines",
            None,
            vec![CanonicalField {
                name: "id",
                value: None,
                required: true,
            }],
        );

        let err = CanonicalPayloadBuilder::build_payload(&snapshot, None, None, &at_noon())
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation { ref field, .. } if field == "id"));
    }

    #[test]
    fn timestamp_round_trips() {
        let ts = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let text = canonical_timestamp(&ts);
        assert_eq!(text, "2023-11-14T22:13:20.123456Z");
        assert_eq!(parse_canonical_timestamp(&text).unwrap(), normalize_timestamp(&ts));
        assert!(parse_canonical_timestamp("yesterday").is_err());
    }

    #[test]
    fn describe_fields_escapes_values() {
        let part = Part::new(3, "a|b");
        assert_eq!(describe_fields(&part), "id=3 code=a\\|b name=\\N");
    }

    proptest! {
        #[test]
        fn payload_is_independent_of_offset(
            code in ".*",
            name in proptest::option::of(".*"),
            session in proptest::option::of("[a-z0-9-]{0,12}"),
            secs in 0i64..4_000_000_000,
            offset_minutes in -720i32..=840,
        ) {
            let mut part = Part::new(9, code);
            part.name = name;
            let utc = Utc.timestamp_opt(secs, 0).unwrap();
            let offset = FixedOffset::east_opt(offset_minutes * 60).unwrap();
            let shifted = utc.with_timezone(&offset);

            let a = CanonicalPayloadBuilder::build_payload(&part, session.as_deref(), Some("dev"), &utc);
            let b = CanonicalPayloadBuilder::build_payload(&part, session.as_deref(), Some("dev"), &shifted);
            prop_assert_eq!(a.unwrap(), b.unwrap());
        }
    }
}
