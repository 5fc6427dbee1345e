//! Protocol constants shared by the frontend and backend message layers.

/// Protocol version 3.0, as sent in the startup packet.
pub const PROTOCOL_VERSION_NUMBER: i32 = 196608;

/// Special startup code requesting a TLS upgrade, magic (1234, 5679).
pub const SSL_REQUEST_CODE: i32 = 80877103;

/// Special startup code carrying a query cancellation, magic (1234, 5678).
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

// Authentication request subtypes ('R' message, first i32 of the payload).
pub const AUTHENTICATION_SUCCESSFUL: i32 = 0;
pub const AUTHENTICATION_CLEAR_PASSWORD: i32 = 3;
pub const AUTHENTICATION_MD5_PASSWORD: i32 = 5;
pub const AUTHENTICATION_GSS: i32 = 7;
pub const AUTHENTICATION_GSS_CONTINUE: i32 = 8;
pub const AUTHENTICATION_SSPI: i32 = 9;
pub const AUTHENTICATION_SASL: i32 = 10;
pub const AUTHENTICATION_SASL_CONTINUE: i32 = 11;
pub const AUTHENTICATION_SASL_FINAL: i32 = 12;
/// Redshift extensible-digest authentication (algorithm selector + dual nonce).
pub const AUTHENTICATION_DIGEST: i32 = 13;
/// Redshift native-IDP token authentication.
pub const AUTHENTICATION_IDP_TOKEN: i32 = 14;

// Backend message type bytes.
pub const BACKEND_AUTHENTICATION: u8 = b'R';
pub const BACKEND_BACKEND_KEY_DATA: u8 = b'K';
pub const BACKEND_PARAMETER_STATUS: u8 = b'S';
pub const BACKEND_READY_FOR_QUERY: u8 = b'Z';
pub const BACKEND_ERROR_RESPONSE: u8 = b'E';
pub const BACKEND_NOTICE_RESPONSE: u8 = b'N';
pub const BACKEND_NOTIFICATION_RESPONSE: u8 = b'A';
pub const BACKEND_PARSE_COMPLETE: u8 = b'1';
pub const BACKEND_BIND_COMPLETE: u8 = b'2';
pub const BACKEND_CLOSE_COMPLETE: u8 = b'3';
pub const BACKEND_PARAMETER_DESCRIPTION: u8 = b't';
pub const BACKEND_ROW_DESCRIPTION: u8 = b'T';
pub const BACKEND_DATA_ROW: u8 = b'D';
pub const BACKEND_COMMAND_COMPLETE: u8 = b'C';
pub const BACKEND_PORTAL_SUSPENDED: u8 = b's';
pub const BACKEND_EMPTY_QUERY_RESPONSE: u8 = b'I';
pub const BACKEND_NO_DATA: u8 = b'n';
pub const BACKEND_COPY_IN_RESPONSE: u8 = b'G';
pub const BACKEND_COPY_OUT_RESPONSE: u8 = b'H';
pub const BACKEND_COPY_BOTH_RESPONSE: u8 = b'W';
pub const BACKEND_COPY_DATA: u8 = b'd';
pub const BACKEND_COPY_DONE: u8 = b'c';
/// Redshift compression negotiation: server selects a method.
pub const BACKEND_SET_COMPRESSION: u8 = b'k';
/// Redshift compression negotiation: server acknowledges the startup request.
pub const BACKEND_COMPRESSION_ACK: u8 = b'z';
/// Redshift compressed frame envelope.
pub const BACKEND_COMPRESSED_DATA: u8 = b'm';

// Frontend message type bytes.
pub const FRONTEND_PASSWORD: u8 = b'p';
pub const FRONTEND_DIGEST_RESPONSE: u8 = b'd';
pub const FRONTEND_IDP_TOKEN: u8 = b'i';
pub const FRONTEND_QUERY: u8 = b'Q';
pub const FRONTEND_PARSE: u8 = b'P';
pub const FRONTEND_BIND: u8 = b'B';
pub const FRONTEND_DESCRIBE: u8 = b'D';
pub const FRONTEND_EXECUTE: u8 = b'E';
pub const FRONTEND_CLOSE: u8 = b'C';
pub const FRONTEND_SYNC: u8 = b'S';
pub const FRONTEND_FLUSH: u8 = b'H';
pub const FRONTEND_COPY_DATA: u8 = b'd';
pub const FRONTEND_COPY_DONE: u8 = b'c';
pub const FRONTEND_COPY_FAIL: u8 = b'f';
pub const FRONTEND_TERMINATE: u8 = b'X';

// Redshift `server_protocol_version` negotiation levels.
pub const BASE_SERVER_PROTOCOL_VERSION: i32 = 0;
pub const EXTENDED_RESULT_METADATA_PROTOCOL_VERSION: i32 = 1;
pub const BINARY_TRANSFER_PROTOCOL_VERSION: i32 = 2;
pub const COLLATION_METADATA_PROTOCOL_VERSION: i32 = 3;
pub const DEFAULT_CLIENT_PROTOCOL_VERSION: i32 = COLLATION_METADATA_PROTOCOL_VERSION;

/// Wire format codes for parameter and column values.
pub const FORMAT_TEXT: i16 = 0;
pub const FORMAT_BINARY: i16 = 1;

/// A Bind message may never exceed this encoded size.
pub const MAX_BIND_MESSAGE_LENGTH: u64 = 0x3fff_ffff;

/// Upper bound on any single backend message; larger lengths are treated as
/// protocol corruption rather than honored.
pub const MAX_MESSAGE_SIZE: i32 = 256 * 1024 * 1024;

/// Estimated response size charged per pipelined query that returns no rows.
pub const NODATA_QUERY_RESPONSE_SIZE_BYTES: usize = 250;

/// Once the estimated un-synced response volume passes this threshold the
/// executor force-sends a Sync and drains, so neither side deadlocks on a
/// full socket buffer.
pub const MAX_BUFFERED_RECV_BYTES: usize = 64000;

/// Savepoint taken before risky statements when autosave is enabled.
pub const AUTOSAVE_NAME: &str = "RSJDBC_AUTOSAVE";
