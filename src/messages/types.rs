//! Shared wire-level helper types: C-string reading and the constant OID table.

use bytes::{Buf, Bytes, BytesMut};

use crate::errors::Error;

/// Type OID of a parameter whose type the server has not resolved yet.
pub const OID_UNSPECIFIED: u32 = 0;
pub const OID_BOOL: u32 = 16;
pub const OID_BYTEA: u32 = 17;
pub const OID_CHAR: u32 = 18;
pub const OID_INT8: u32 = 20;
pub const OID_INT2: u32 = 21;
pub const OID_INT4: u32 = 23;
pub const OID_TEXT: u32 = 25;
pub const OID_OID: u32 = 26;
pub const OID_FLOAT4: u32 = 700;
pub const OID_FLOAT8: u32 = 701;
pub const OID_BPCHAR: u32 = 1042;
pub const OID_VARCHAR: u32 = 1043;
pub const OID_DATE: u32 = 1082;
pub const OID_TIME: u32 = 1083;
pub const OID_TIMESTAMP: u32 = 1114;
pub const OID_TIMESTAMPTZ: u32 = 1184;
pub const OID_TIMETZ: u32 = 1266;
pub const OID_NUMERIC: u32 = 1700;

/// Build-once, read-only OID to type-name mapping for diagnostics.
pub fn oid_type_name(oid: u32) -> &'static str {
    match oid {
        OID_UNSPECIFIED => "unspecified",
        OID_BOOL => "bool",
        OID_BYTEA => "bytea",
        OID_CHAR => "char",
        OID_INT8 => "int8",
        OID_INT2 => "int2",
        OID_INT4 => "int4",
        OID_TEXT => "text",
        OID_OID => "oid",
        OID_FLOAT4 => "float4",
        OID_FLOAT8 => "float8",
        OID_BPCHAR => "bpchar",
        OID_VARCHAR => "varchar",
        OID_DATE => "date",
        OID_TIME => "time",
        OID_TIMESTAMP => "timestamp",
        OID_TIMESTAMPTZ => "timestamptz",
        OID_TIMETZ => "timetz",
        OID_NUMERIC => "numeric",
        _ => "unknown",
    }
}

/// Read NUL-terminated UTF-8 strings out of message payloads.
pub trait BytesMutReader {
    fn read_string(&mut self) -> Result<String, Error>;
}

impl BytesMutReader for BytesMut {
    fn read_string(&mut self) -> Result<String, Error> {
        match self.iter().position(|&b| b == 0) {
            Some(nul) => {
                let bytes = self.split_to(nul);
                self.advance(1);
                String::from_utf8(bytes.to_vec()).map_err(|_| {
                    Error::ProtocolViolation("string field is not valid UTF-8".into())
                })
            }
            None => Err(Error::ProtocolViolation(
                "string field is not nul-terminated".into(),
            )),
        }
    }
}

impl BytesMutReader for Bytes {
    fn read_string(&mut self) -> Result<String, Error> {
        match self.iter().position(|&b| b == 0) {
            Some(nul) => {
                let bytes = self.split_to(nul);
                self.advance(1);
                String::from_utf8(bytes.to_vec()).map_err(|_| {
                    Error::ProtocolViolation("string field is not valid UTF-8".into())
                })
            }
            None => Err(Error::ProtocolViolation(
                "string field is not nul-terminated".into(),
            )),
        }
    }
}
