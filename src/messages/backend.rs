//! Parsers for backend message payloads that more than one subsystem reads.

use bytes::{Buf, BytesMut};

use crate::errors::{Error, ServerError};
use crate::messages::types::BytesMutReader;

/// Parse the tagged fields of an `ErrorResponse` or `NoticeResponse` payload
/// (everything after the length prefix).
pub fn parse_error_fields(message: &mut BytesMut, include_detail: bool) -> Result<ServerError, Error> {
    let mut error = ServerError::new("ERROR", "XX000", "");
    error.include_detail = include_detail;
    let mut saw_message = false;

    while message.has_remaining() {
        let field = message.get_u8();
        if field == 0 {
            break;
        }
        let value = message.read_string()?;
        match field {
            b'S' => error.severity = value,
            // Non-localized severity wins over the localized one.
            b'V' => error.severity = value,
            b'C' => error.code = value,
            b'M' => {
                error.message = value;
                saw_message = true;
            }
            b'D' => error.detail = Some(value),
            b'H' => error.hint = Some(value),
            b'P' => error.position = value.parse().ok(),
            b'W' => error.where_context = Some(value),
            b'F' => error.file = Some(value),
            b'L' => error.line = value.parse().ok(),
            b'R' => error.routine = Some(value),
            // Unknown field codes are forward-compatible; skip the value.
            _ => (),
        }
    }

    if !saw_message {
        return Err(Error::ProtocolViolation(
            "error response carries no message field".into(),
        ));
    }
    Ok(error)
}

/// An asynchronous notification (`A` message).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub process_id: i32,
    pub channel: String,
    pub payload: String,
}

/// Parse a `NotificationResponse` payload.
pub fn parse_notification(message: &mut BytesMut) -> Result<Notification, Error> {
    if message.remaining() < 4 {
        return Err(Error::ProtocolViolation(
            "notification response is truncated".into(),
        ));
    }
    let process_id = message.get_i32();
    let channel = message.read_string()?;
    let payload = message.read_string()?;
    Ok(Notification {
        process_id,
        channel,
        payload,
    })
}

/// Parse the trailing integer of a command tag: the affected-row count of
/// `INSERT 0 3`, `UPDATE 7`, `COPY 3`, `SELECT 1` and friends.
pub fn update_count(tag: &str) -> Option<u64> {
    tag.rsplit(' ').next()?.parse().ok()
}

/// Parse the inserted OID of a single-row `INSERT <oid> 1` tag; anything else
/// reports zero, matching server behavior for multi-row inserts.
pub fn insert_oid(tag: &str) -> u32 {
    let mut parts = tag.split(' ');
    if parts.next() != Some("INSERT") {
        return 0;
    }
    let oid = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    match parts.next().and_then(|s| s.parse::<u64>().ok()) {
        Some(1) => oid,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error_payload(fields: &[(u8, &str)]) -> BytesMut {
        let mut buf = BytesMut::new();
        for (tag, value) in fields {
            buf.extend_from_slice(&[*tag]);
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(&[0]);
        }
        buf.extend_from_slice(&[0]);
        buf
    }

    #[test]
    fn parses_full_error_response() {
        let mut payload = error_payload(&[
            (b'S', "ERROR"),
            (b'C', "42703"),
            (b'M', "column \"x\" does not exist"),
            (b'P', "8"),
            (b'R', "errorMissingColumn"),
            (b'F', "parse_relation.c"),
            (b'L', "3590"),
        ]);
        let err = parse_error_fields(&mut payload, true).unwrap();
        assert_eq!(err.severity, "ERROR");
        assert_eq!(err.code, "42703");
        assert_eq!(err.position, Some(8));
        assert_eq!(err.line, Some(3590));
        assert_eq!(err.routine.as_deref(), Some("errorMissingColumn"));
    }

    #[test]
    fn missing_message_field_is_protocol_violation() {
        let mut payload = error_payload(&[(b'S', "ERROR"), (b'C', "42703")]);
        assert!(matches!(
            parse_error_fields(&mut payload, true),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn parses_notification() {
        let mut payload = BytesMut::new();
        payload.extend_from_slice(&42i32.to_be_bytes());
        payload.extend_from_slice(b"jobs\0started\0");
        let n = parse_notification(&mut payload).unwrap();
        assert_eq!(n.process_id, 42);
        assert_eq!(n.channel, "jobs");
        assert_eq!(n.payload, "started");
    }

    #[test]
    fn update_count_reads_tail_integer() {
        assert_eq!(update_count("INSERT 0 3"), Some(3));
        assert_eq!(update_count("UPDATE 7"), Some(7));
        assert_eq!(update_count("COPY 3"), Some(3));
        assert_eq!(update_count("SELECT 1"), Some(1));
        assert_eq!(update_count("BEGIN"), None);
        assert_eq!(update_count("ROLLBACK"), None);
    }

    #[test]
    fn insert_oid_only_for_single_row_insert() {
        assert_eq!(insert_oid("INSERT 16384 1"), 16384);
        assert_eq!(insert_oid("INSERT 0 3"), 0);
        assert_eq!(insert_oid("UPDATE 1"), 0);
    }
}
