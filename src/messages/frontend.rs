// Builders for every message the driver sends. Each returns a ready-to-write
// BytesMut carrying the type byte and self-inclusive length prefix.

use bytes::{BufMut, BytesMut};
use md5::{Digest, Md5};

use crate::errors::Error;
use crate::messages::constants::*;

/// Send the startup packet. The packet has no type byte; the length prefix
/// covers the whole packet. Parameter pairs end with an empty key.
pub fn startup(parameters: &[(String, String)]) -> BytesMut {
    let mut body = BytesMut::new();

    body.put_i32(PROTOCOL_VERSION_NUMBER);
    for (key, value) in parameters {
        body.put_slice(key.as_bytes());
        body.put_u8(0);
        body.put_slice(value.as_bytes());
        body.put_u8(0);
    }
    body.put_u8(0);

    let mut packet = BytesMut::with_capacity(body.len() + 4);
    packet.put_i32(body.len() as i32 + 4);
    packet.put(body);
    packet
}

/// Request a TLS upgrade before the startup packet.
pub fn ssl_request() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(8);
    bytes.put_i32(8);
    bytes.put_i32(SSL_REQUEST_CODE);
    bytes
}

/// The 16-byte cancel packet carried over its own short-lived connection.
pub fn cancel_request(process_id: i32, secret_key: i32) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(16);
    bytes.put_i32(16);
    bytes.put_i32(CANCEL_REQUEST_CODE);
    bytes.put_i32(process_id);
    bytes.put_i32(secret_key);
    bytes
}

/// Cleartext password response. The password is sent NUL-terminated.
pub fn password_message(password: &str) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(password.len() + 6);
    bytes.put_u8(FRONTEND_PASSWORD);
    bytes.put_i32(4 + password.len() as i32 + 1);
    bytes.put_slice(password.as_bytes());
    bytes.put_u8(0);
    bytes
}

/// Create md5 password hash given a salt: `md5 + hex(md5(hex(md5(pwd+user)) + salt))`.
pub fn md5_hash_password(user: &str, password: &str, salt: &[u8]) -> Vec<u8> {
    let mut md5 = Md5::new();

    // First pass
    md5.update(password.as_bytes());
    md5.update(user.as_bytes());
    let output = md5.finalize_reset();

    // Second pass
    md5.update(format!("{output:x}"));
    md5.update(salt);

    format!("md5{:x}", md5.finalize()).into_bytes()
}

/// MD5 password response.
pub fn md5_password(user: &str, password: &str, salt: &[u8]) -> BytesMut {
    let hash = md5_hash_password(user, password, salt);
    let mut bytes = BytesMut::with_capacity(hash.len() + 6);
    bytes.put_u8(FRONTEND_PASSWORD);
    bytes.put_i32(4 + hash.len() as i32 + 1);
    bytes.put_slice(&hash);
    bytes.put_u8(0);
    bytes
}

/// Extensible-digest response: digest and client nonce, each length-prefixed.
pub fn digest_response(digest: &[u8], client_nonce: &[u8]) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(digest.len() + client_nonce.len() + 13);
    bytes.put_u8(FRONTEND_DIGEST_RESPONSE);
    bytes.put_i32(4 + 4 + digest.len() as i32 + 4 + client_nonce.len() as i32);
    bytes.put_i32(digest.len() as i32);
    bytes.put_slice(digest);
    bytes.put_i32(client_nonce.len() as i32);
    bytes.put_slice(client_nonce);
    bytes
}

/// Native-IDP token response, NUL-terminated.
pub fn idp_token_message(token: &str) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(token.len() + 6);
    bytes.put_u8(FRONTEND_IDP_TOKEN);
    bytes.put_i32(4 + token.len() as i32 + 1);
    bytes.put_slice(token.as_bytes());
    bytes.put_u8(0);
    bytes
}

/// Create a simple query message.
pub fn simple_query(query: &str) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(query.len() + 6);
    bytes.put_u8(FRONTEND_QUERY);
    bytes.put_i32(4 + query.len() as i32 + 1);
    bytes.put_slice(query.as_bytes());
    bytes.put_u8(0);
    bytes
}

/// Parse: statement name, query text, and the OIDs of any pre-resolved
/// parameter types (`0` leaves resolution to the server).
pub fn parse(name: &str, query: &[u8], param_oids: &[u32]) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(name.len() + query.len() + param_oids.len() * 4 + 12);
    bytes.put_u8(FRONTEND_PARSE);
    bytes.put_i32(4 + name.len() as i32 + 1 + query.len() as i32 + 1 + 2 + param_oids.len() as i32 * 4);
    bytes.put_slice(name.as_bytes());
    bytes.put_u8(0);
    bytes.put_slice(query);
    bytes.put_u8(0);
    bytes.put_i16(param_oids.len() as i16);
    for oid in param_oids {
        bytes.put_u32(*oid);
    }
    bytes
}

/// Compute the encoded size of a Bind without building it, so oversized
/// messages can be rejected before any byte is buffered.
pub fn bind_message_length(
    portal: &str,
    statement: &str,
    param_formats: &[i16],
    params: &[Option<&[u8]>],
    result_formats: &[i16],
) -> u64 {
    let mut len: u64 = 4; // length prefix
    len += portal.len() as u64 + 1;
    len += statement.len() as u64 + 1;
    len += 2 + param_formats.len() as u64 * 2;
    len += 2;
    for value in params {
        len += 4;
        if let Some(value) = value {
            len += value.len() as u64;
        }
    }
    len += 2 + result_formats.len() as u64 * 2;
    len
}

/// Bind: attach parameter values to a statement under a portal name.
/// Fails with `BindSizeExceeded` instead of emitting an unrepresentable length.
pub fn bind(
    portal: &str,
    statement: &str,
    param_formats: &[i16],
    params: &[Option<&[u8]>],
    result_formats: &[i16],
) -> Result<BytesMut, Error> {
    let len = bind_message_length(portal, statement, param_formats, params, result_formats);
    if len > MAX_BIND_MESSAGE_LENGTH {
        return Err(Error::BindSizeExceeded(len));
    }

    let mut bytes = BytesMut::with_capacity(len as usize + 1);
    bytes.put_u8(FRONTEND_BIND);
    bytes.put_i32(len as i32);
    bytes.put_slice(portal.as_bytes());
    bytes.put_u8(0);
    bytes.put_slice(statement.as_bytes());
    bytes.put_u8(0);
    bytes.put_i16(param_formats.len() as i16);
    for format in param_formats {
        bytes.put_i16(*format);
    }
    bytes.put_i16(params.len() as i16);
    for value in params {
        match value {
            Some(value) => {
                bytes.put_i32(value.len() as i32);
                bytes.put_slice(value);
            }
            None => bytes.put_i32(-1),
        }
    }
    bytes.put_i16(result_formats.len() as i16);
    for format in result_formats {
        bytes.put_i16(*format);
    }
    Ok(bytes)
}

fn describe(target: u8, name: &str) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(name.len() + 7);
    bytes.put_u8(FRONTEND_DESCRIBE);
    bytes.put_i32(4 + 1 + name.len() as i32 + 1);
    bytes.put_u8(target);
    bytes.put_slice(name.as_bytes());
    bytes.put_u8(0);
    bytes
}

/// Describe a prepared statement (expects ParameterDescription + RowDescription/NoData).
pub fn describe_statement(name: &str) -> BytesMut {
    describe(b'S', name)
}

/// Describe a portal (expects RowDescription/NoData).
pub fn describe_portal(name: &str) -> BytesMut {
    describe(b'P', name)
}

/// Execute a portal with a row limit; `0` means no limit.
pub fn execute(portal: &str, max_rows: i32) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(portal.len() + 10);
    bytes.put_u8(FRONTEND_EXECUTE);
    bytes.put_i32(4 + portal.len() as i32 + 1 + 4);
    bytes.put_slice(portal.as_bytes());
    bytes.put_u8(0);
    bytes.put_i32(max_rows);
    bytes
}

fn close(target: u8, name: &str) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(name.len() + 7);
    bytes.put_u8(FRONTEND_CLOSE);
    bytes.put_i32(4 + 1 + name.len() as i32 + 1);
    bytes.put_u8(target);
    bytes.put_slice(name.as_bytes());
    bytes.put_u8(0);
    bytes
}

/// Close a server-side prepared statement.
pub fn close_statement(name: &str) -> BytesMut {
    close(b'S', name)
}

/// Close a server-side portal.
pub fn close_portal(name: &str) -> BytesMut {
    close(b'P', name)
}

/// Create a sync message.
pub fn sync() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(5);
    bytes.put_u8(FRONTEND_SYNC);
    bytes.put_i32(4);
    bytes
}

/// Create a flush message.
pub fn flush() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(5);
    bytes.put_u8(FRONTEND_FLUSH);
    bytes.put_i32(4);
    bytes
}

/// CopyData frame carrying a chunk of COPY payload.
pub fn copy_data(data: &[u8]) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(data.len() + 5);
    bytes.put_u8(FRONTEND_COPY_DATA);
    bytes.put_i32(4 + data.len() as i32);
    bytes.put_slice(data);
    bytes
}

/// CopyDone, ending a client-to-server COPY.
pub fn copy_done() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(5);
    bytes.put_u8(FRONTEND_COPY_DONE);
    bytes.put_i32(4);
    bytes
}

/// CopyFail with a reason, aborting a client-to-server COPY.
pub fn copy_fail(reason: &str) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(reason.len() + 6);
    bytes.put_u8(FRONTEND_COPY_FAIL);
    bytes.put_i32(4 + reason.len() as i32 + 1);
    bytes.put_slice(reason.as_bytes());
    bytes.put_u8(0);
    bytes
}

/// Terminate, the graceful goodbye.
pub fn terminate() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(5);
    bytes.put_u8(FRONTEND_TERMINATE);
    bytes.put_i32(4);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_packet_layout() {
        let packet = startup(&[
            ("user".into(), "alice".into()),
            ("database".into(), "dev".into()),
        ]);
        let len = i32::from_be_bytes(packet[0..4].try_into().unwrap());
        assert_eq!(len as usize, packet.len());
        assert_eq!(
            i32::from_be_bytes(packet[4..8].try_into().unwrap()),
            PROTOCOL_VERSION_NUMBER
        );
        // pairs end with the empty-key terminator
        assert_eq!(packet[packet.len() - 1], 0);
        assert_eq!(&packet[8..13], b"user\0");
    }

    #[test]
    fn cancel_request_is_exactly_sixteen_bytes() {
        let bytes = cancel_request(4711, -123);
        assert_eq!(bytes.len(), 16);
        assert_eq!(i32::from_be_bytes(bytes[0..4].try_into().unwrap()), 16);
        assert_eq!(
            i32::from_be_bytes(bytes[4..8].try_into().unwrap()),
            CANCEL_REQUEST_CODE
        );
        assert_eq!(i32::from_be_bytes(bytes[8..12].try_into().unwrap()), 4711);
        assert_eq!(i32::from_be_bytes(bytes[12..16].try_into().unwrap()), -123);
    }

    #[test]
    fn md5_password_matches_known_vector() {
        // md5(md5("secretalice") + salt) for a fixed salt
        let hash = md5_hash_password("alice", "secret", &[0x01, 0x02, 0x03, 0x04]);
        assert!(hash.starts_with(b"md5"));
        assert_eq!(hash.len(), 35);
        // Deterministic: same inputs, same hash.
        assert_eq!(hash, md5_hash_password("alice", "secret", &[1, 2, 3, 4]));
    }

    #[test]
    fn parse_message_layout() {
        let bytes = parse("S_1-7", b"SELECT $1", &[23]);
        assert_eq!(bytes[0], FRONTEND_PARSE);
        let len = i32::from_be_bytes(bytes[1..5].try_into().unwrap());
        assert_eq!(len as usize, bytes.len() - 1);
        // trailing parameter count + single oid
        let tail = &bytes[bytes.len() - 6..];
        assert_eq!(i16::from_be_bytes(tail[0..2].try_into().unwrap()), 1);
        assert_eq!(u32::from_be_bytes(tail[2..6].try_into().unwrap()), 23);
    }

    #[test]
    fn bind_encodes_null_as_minus_one() {
        let bytes = bind("", "S_1", &[0], &[None], &[0]).unwrap();
        let len = i32::from_be_bytes(bytes[1..5].try_into().unwrap());
        assert_eq!(len as usize, bytes.len() - 1);
        // portal "" + statement "S_1" + 1 format + count + -1 value length
        let value_len = &bytes[5 + 1 + 4 + 2 + 2 + 2..];
        assert_eq!(i32::from_be_bytes(value_len[0..4].try_into().unwrap()), -1);
    }

    #[test]
    fn bind_message_length_matches_encoded_size() {
        let value = [0u8; 16];
        let params: [Option<&[u8]>; 2] = [Some(&value), None];
        let len = bind_message_length("C_1", "S_1", &[0, 0], &params, &[0]);
        let bytes = bind("C_1", "S_1", &[0, 0], &params, &[0]).unwrap();
        assert_eq!(len as usize, bytes.len() - 1);
    }

    #[test]
    fn execute_carries_row_limit() {
        let bytes = execute("C_1-9", 50);
        assert_eq!(bytes[0], FRONTEND_EXECUTE);
        let tail = &bytes[bytes.len() - 4..];
        assert_eq!(i32::from_be_bytes(tail.try_into().unwrap()), 50);
    }

    #[test]
    fn sync_and_flush_are_five_bytes() {
        assert_eq!(&sync()[..], &[b'S', 0, 0, 0, 4]);
        assert_eq!(&flush()[..], &[b'H', 0, 0, 0, 4]);
        assert_eq!(&terminate()[..], &[b'X', 0, 0, 0, 4]);
    }

    #[test]
    fn close_statement_and_portal_targets() {
        assert_eq!(close_statement("S_2")[5], b'S');
        assert_eq!(close_portal("C_2")[5], b'P');
    }

    #[test]
    fn digest_response_layout() {
        let bytes = digest_response(&[0xAA; 32], &[0xBB; 8]);
        assert_eq!(bytes[0], FRONTEND_DIGEST_RESPONSE);
        let len = i32::from_be_bytes(bytes[1..5].try_into().unwrap());
        assert_eq!(len, 4 + 4 + 32 + 4 + 8);
        assert_eq!(i32::from_be_bytes(bytes[5..9].try_into().unwrap()), 32);
    }
}
