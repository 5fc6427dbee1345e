//! Query-side data model: the native query descriptor handed over by the SQL
//! rewriter, positional parameter lists, row-description fields and tuples.

use bytes::{Buf, Bytes, BytesMut};
use smallvec::SmallVec;

use crate::errors::Error;
use crate::messages::constants::{
    COLLATION_METADATA_PROTOCOL_VERSION, EXTENDED_RESULT_METADATA_PROTOCOL_VERSION, FORMAT_BINARY,
    FORMAT_TEXT,
};
use crate::messages::types::OID_UNSPECIFIED;

/// Classification of the logical statement, produced by the SQL rewriter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlCommandType {
    Blank,
    Select,
    Dml,
    Begin,
    Commit,
    Rollback,
    Copy,
    Prepare,
    Set,
}

impl SqlCommandType {
    pub fn returns_rows(self) -> bool {
        matches!(self, SqlCommandType::Select)
    }
}

/// Byte ranges the batched-INSERT rewriter may splice when collapsing many
/// value lists into one statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRewrite {
    pub values_start: usize,
    pub values_end: usize,
}

/// A single native query: rewritten SQL with positional placeholders, the
/// placeholder offsets, and the command classification. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeQuery {
    pub sql: String,
    pub bind_positions: Vec<usize>,
    pub command: SqlCommandType,
    pub rewrite: Option<BatchRewrite>,
    /// Whether the rewriter ran with escape processing on. The same SQL text
    /// parses differently under the two modes, so this is part of the
    /// statement's cache identity.
    pub escape_processing: bool,
    /// Generated columns the caller asked the server to return. Distinct
    /// projections of the same SQL prepare to distinct server statements.
    pub returning_columns: Vec<String>,
}

impl NativeQuery {
    pub fn new(sql: &str, bind_positions: Vec<usize>, command: SqlCommandType) -> NativeQuery {
        NativeQuery {
            sql: sql.into(),
            bind_positions,
            command,
            rewrite: None,
            escape_processing: false,
            returning_columns: Vec::new(),
        }
    }

    /// Convenience constructor classifying the SQL itself; real callers pass
    /// the rewriter's classification through `new`.
    pub fn simple(sql: &str) -> NativeQuery {
        NativeQuery::new(sql, Vec::new(), classify(sql))
    }

    /// Record that the rewriter processed escapes for this text.
    pub fn with_escape_processing(mut self, on: bool) -> NativeQuery {
        self.escape_processing = on;
        self
    }

    /// Record the generated-column projection requested by the caller.
    pub fn with_returning_columns(mut self, columns: Vec<String>) -> NativeQuery {
        self.returning_columns = columns;
        self
    }

    pub fn bind_count(&self) -> usize {
        self.bind_positions.len()
    }

    /// Whether a server-reported ROLLBACK status contradicts this statement.
    /// COMMIT and PREPARE TRANSACTION are the statements whose silent
    /// rollback must surface; ROLLBACK itself legitimately reports it.
    pub fn expects_commit_tag(&self) -> bool {
        if self.command == SqlCommandType::Rollback {
            return false;
        }
        let mut words = self
            .sql
            .split(|c: char| c.is_whitespace() || c == ';')
            .filter(|w| !w.is_empty());
        match words.next().map(|w| w.to_ascii_uppercase()) {
            Some(first) if first == "COMMIT" || first == "END" => true,
            Some(first) if first == "PREPARE" => {
                matches!(words.next().map(|w| w.to_ascii_uppercase()),
                         Some(second) if second == "TRANSACTION")
            }
            _ => false,
        }
    }
}

/// First-keyword classification, used where no rewriter output is available.
pub fn classify(sql: &str) -> SqlCommandType {
    let mut words = sql
        .split(|c: char| c.is_whitespace() || c == ';' || c == '(')
        .filter(|w| !w.is_empty());
    let first = match words.next() {
        Some(word) => word.to_ascii_uppercase(),
        None => return SqlCommandType::Blank,
    };
    match first.as_str() {
        "SELECT" | "WITH" | "SHOW" | "TABLE" | "VALUES" => SqlCommandType::Select,
        "BEGIN" | "START" => SqlCommandType::Begin,
        "COMMIT" | "END" => SqlCommandType::Commit,
        "ROLLBACK" | "ABORT" => SqlCommandType::Rollback,
        "COPY" => SqlCommandType::Copy,
        "PREPARE" => SqlCommandType::Prepare,
        "SET" => SqlCommandType::Set,
        _ => SqlCommandType::Dml,
    }
}

/// One bound parameter slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Null,
    Text(Bytes),
    Binary(Bytes),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub value: ParamValue,
    /// Resolved type OID; `0` until a Describe fills it in.
    pub oid: u32,
}

/// Positional parameter list for one Bind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterList {
    params: Vec<Parameter>,
}

impl ParameterList {
    pub fn new(count: usize) -> ParameterList {
        ParameterList {
            params: vec![
                Parameter {
                    value: ParamValue::Null,
                    oid: OID_UNSPECIFIED,
                };
                count
            ],
        }
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn set_null(&mut self, index: usize, oid: u32) {
        self.params[index] = Parameter {
            value: ParamValue::Null,
            oid,
        };
    }

    pub fn set_text(&mut self, index: usize, bytes: impl Into<Bytes>, oid: u32) {
        self.params[index] = Parameter {
            value: ParamValue::Text(bytes.into()),
            oid,
        };
    }

    pub fn set_binary(&mut self, index: usize, bytes: impl Into<Bytes>, oid: u32) {
        self.params[index] = Parameter {
            value: ParamValue::Binary(bytes.into()),
            oid,
        };
    }

    /// The OID signature as it will be sent in Parse.
    pub fn oids(&self) -> Vec<u32> {
        self.params.iter().map(|p| p.oid).collect()
    }

    /// True when at least one slot still has an unresolved type.
    pub fn has_unresolved_types(&self) -> bool {
        self.params.iter().any(|p| p.oid == OID_UNSPECIFIED)
    }

    /// Adopt the OIDs of a ParameterDescription for still-unspecified slots.
    pub fn resolve_oids(&mut self, oids: &[u32]) {
        for (param, oid) in self.params.iter_mut().zip(oids) {
            if param.oid == OID_UNSPECIFIED {
                param.oid = *oid;
            }
        }
    }

    pub fn formats(&self) -> SmallVec<[i16; 8]> {
        self.params
            .iter()
            .map(|p| match p.value {
                ParamValue::Binary(_) => FORMAT_BINARY,
                _ => FORMAT_TEXT,
            })
            .collect()
    }

    pub fn values(&self) -> Vec<Option<&[u8]>> {
        self.params
            .iter()
            .map(|p| match &p.value {
                ParamValue::Null => None,
                ParamValue::Text(bytes) | ParamValue::Binary(bytes) => Some(bytes.as_ref()),
            })
            .collect()
    }
}

/// Extended Redshift column metadata, present from protocol version 1 on.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldExtension {
    pub catalog_name: String,
    pub schema_name: String,
    pub table_name: String,
    pub column_name: String,
    pub nullable: bool,
    pub autoincrement: bool,
    pub read_only: bool,
    pub searchable: bool,
    /// Meaningful only when the collation metadata level was negotiated.
    pub case_sensitive: bool,
}

/// One column of a RowDescription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub label: String,
    pub table_oid: u32,
    pub column_attr: i16,
    pub type_oid: u32,
    pub type_len: i16,
    pub type_mod: i32,
    pub format: i16,
    pub extension: Option<FieldExtension>,
}

impl FieldDescription {
    pub fn is_binary(&self) -> bool {
        self.format == FORMAT_BINARY
    }

    /// Worst-case per-row byte estimate used to seed the deadlock-avoidance
    /// counter. Variable-width columns are charged a fixed allowance.
    pub fn max_value_size(&self) -> usize {
        if self.type_len > 0 {
            self.type_len as usize
        } else {
            64
        }
    }
}

fn read_cstring(message: &mut BytesMut) -> Result<String, Error> {
    use crate::messages::types::BytesMutReader;
    message.read_string()
}

/// Parse a RowDescription payload. The extended per-column block is read iff
/// the negotiated server protocol version is at least 1; the case-sensitive
/// bit is only meaningful at the collation level.
pub fn parse_row_description(
    message: &mut BytesMut,
    server_protocol_version: i32,
) -> Result<Vec<FieldDescription>, Error> {
    if message.remaining() < 2 {
        return Err(Error::ProtocolViolation("row description is truncated".into()));
    }
    let count = message.get_i16();
    if count < 0 {
        return Err(Error::ProtocolViolation(format!(
            "row description reports {count} columns"
        )));
    }
    let mut fields = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let label = read_cstring(message)?;
        if message.remaining() < 18 {
            return Err(Error::ProtocolViolation("row description is truncated".into()));
        }
        let table_oid = message.get_u32();
        let column_attr = message.get_i16();
        let type_oid = message.get_u32();
        let type_len = message.get_i16();
        let type_mod = message.get_i32();
        let format = message.get_i16();

        let extension = if server_protocol_version >= EXTENDED_RESULT_METADATA_PROTOCOL_VERSION {
            let catalog_name = read_cstring(message)?;
            let schema_name = read_cstring(message)?;
            let table_name = read_cstring(message)?;
            let column_name = read_cstring(message)?;
            if !message.has_remaining() {
                return Err(Error::ProtocolViolation(
                    "extended row description is truncated".into(),
                ));
            }
            let bits = message.get_u8();
            Some(FieldExtension {
                catalog_name,
                schema_name,
                table_name,
                column_name,
                nullable: bits & 0x01 != 0,
                autoincrement: bits & 0x02 != 0,
                read_only: bits & 0x04 != 0,
                searchable: bits & 0x08 != 0,
                case_sensitive: server_protocol_version >= COLLATION_METADATA_PROTOCOL_VERSION
                    && bits & 0x10 != 0,
            })
        } else {
            None
        };

        fields.push(FieldDescription {
            label,
            table_oid,
            column_attr,
            type_oid,
            type_len,
            type_mod,
            format,
            extension,
        });
    }
    Ok(fields)
}

/// Parse a ParameterDescription payload into its OID list.
pub fn parse_parameter_description(message: &mut BytesMut) -> Result<Vec<u32>, Error> {
    if message.remaining() < 2 {
        return Err(Error::ProtocolViolation(
            "parameter description is truncated".into(),
        ));
    }
    let count = message.get_i16();
    if count < 0 || message.remaining() < count as usize * 4 {
        return Err(Error::ProtocolViolation(
            "parameter description is truncated".into(),
        ));
    }
    Ok((0..count).map(|_| message.get_u32()).collect())
}

/// One result row. The end-of-rows sentinel is an empty marker tuple the ring
/// buffer uses to tell the consumer the result is exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuple {
    columns: Vec<Option<Bytes>>,
    end: bool,
}

impl Tuple {
    pub fn new(columns: Vec<Option<Bytes>>) -> Tuple {
        Tuple {
            columns,
            end: false,
        }
    }

    pub fn end_of_rows() -> Tuple {
        Tuple {
            columns: Vec::new(),
            end: true,
        }
    }

    pub fn is_end_of_rows(&self) -> bool {
        self.end
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn get(&self, index: usize) -> Option<&Bytes> {
        self.columns.get(index).and_then(|c| c.as_ref())
    }

    pub fn is_null(&self, index: usize) -> bool {
        matches!(self.columns.get(index), Some(None))
    }

    /// Payload bytes held by this tuple, the unit of the ring buffer's
    /// size-bounded backpressure.
    pub fn size_bytes(&self) -> usize {
        self.columns
            .iter()
            .map(|c| c.as_ref().map(|b| b.len()).unwrap_or(0))
            .sum()
    }
}

/// Parse a DataRow payload.
pub fn parse_data_row(message: &mut BytesMut) -> Result<Tuple, Error> {
    if message.remaining() < 2 {
        return Err(Error::ProtocolViolation("data row is truncated".into()));
    }
    let count = message.get_i16();
    if count < 0 {
        return Err(Error::ProtocolViolation(format!(
            "data row reports {count} columns"
        )));
    }
    let mut columns = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if message.remaining() < 4 {
            return Err(Error::ProtocolViolation("data row is truncated".into()));
        }
        let len = message.get_i32();
        if len < 0 {
            columns.push(None);
        } else {
            if message.remaining() < len as usize {
                return Err(Error::ProtocolViolation("data row is truncated".into()));
            }
            columns.push(Some(message.split_to(len as usize).freeze()));
        }
    }
    Ok(Tuple::new(columns))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn classify_first_keyword() {
        assert_eq!(classify("SELECT 1"), SqlCommandType::Select);
        assert_eq!(classify("  with t as (select 1) select * from t"), SqlCommandType::Select);
        assert_eq!(classify("insert into t values (1)"), SqlCommandType::Dml);
        assert_eq!(classify("BEGIN"), SqlCommandType::Begin);
        assert_eq!(classify("commit;"), SqlCommandType::Commit);
        assert_eq!(classify("ROLLBACK"), SqlCommandType::Rollback);
        assert_eq!(classify("COPY t FROM STDIN"), SqlCommandType::Copy);
        assert_eq!(classify("set search_path = app"), SqlCommandType::Set);
        assert_eq!(classify(""), SqlCommandType::Blank);
        assert_eq!(classify("   "), SqlCommandType::Blank);
    }

    #[test]
    fn commit_tag_expectation_excludes_rollback() {
        assert!(NativeQuery::simple("COMMIT").expects_commit_tag());
        assert!(NativeQuery::simple("commit ;").expects_commit_tag());
        assert!(NativeQuery::simple("END").expects_commit_tag());
        assert!(NativeQuery::simple("PREPARE TRANSACTION 'tx1'").expects_commit_tag());
        assert!(!NativeQuery::simple("ROLLBACK").expects_commit_tag());
        assert!(!NativeQuery::simple("PREPARE plan AS SELECT 1").expects_commit_tag());
        assert!(!NativeQuery::simple("SELECT 1").expects_commit_tag());
    }

    #[test]
    fn parameter_list_formats_and_values() {
        let mut params = ParameterList::new(3);
        params.set_text(0, &b"42"[..], 23);
        params.set_binary(1, &[0u8, 1][..], 17);
        // slot 2 stays NULL with unspecified type
        assert_eq!(params.formats().as_slice(), &[0, 1, 0]);
        assert_eq!(params.values()[0], Some(&b"42"[..]));
        assert_eq!(params.values()[2], None);
        assert!(params.has_unresolved_types());
        params.resolve_oids(&[23, 17, 25]);
        assert_eq!(params.oids(), vec![23, 17, 25]);
        assert!(!params.has_unresolved_types());
    }

    fn base_field(buf: &mut BytesMut, label: &str, type_oid: u32) {
        buf.put_slice(label.as_bytes());
        buf.put_u8(0);
        buf.put_u32(0);
        buf.put_i16(0);
        buf.put_u32(type_oid);
        buf.put_i16(4);
        buf.put_i32(-1);
        buf.put_i16(0);
    }

    #[test]
    fn parses_base_row_description() {
        let mut buf = BytesMut::new();
        buf.put_i16(1);
        base_field(&mut buf, "count", 23);
        let fields = parse_row_description(&mut buf, 0).unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].label, "count");
        assert_eq!(fields[0].type_oid, 23);
        assert!(fields[0].extension.is_none());
    }

    #[test]
    fn parses_extended_row_description() {
        let mut buf = BytesMut::new();
        buf.put_i16(1);
        base_field(&mut buf, "id", 23);
        for name in ["dev", "public", "users", "id"] {
            buf.put_slice(name.as_bytes());
            buf.put_u8(0);
        }
        buf.put_u8(0x01 | 0x08 | 0x10); // nullable, searchable, case-sensitive

        let fields = parse_row_description(&mut buf, 3).unwrap();
        let ext = fields[0].extension.as_ref().unwrap();
        assert_eq!(ext.schema_name, "public");
        assert_eq!(ext.table_name, "users");
        assert!(ext.nullable);
        assert!(ext.searchable);
        assert!(!ext.autoincrement);
        assert!(ext.case_sensitive);
    }

    #[test]
    fn case_sensitive_bit_needs_collation_level() {
        let mut buf = BytesMut::new();
        buf.put_i16(1);
        base_field(&mut buf, "id", 23);
        for name in ["dev", "public", "users", "id"] {
            buf.put_slice(name.as_bytes());
            buf.put_u8(0);
        }
        buf.put_u8(0x10);
        let fields = parse_row_description(&mut buf, 1).unwrap();
        assert!(!fields[0].extension.as_ref().unwrap().case_sensitive);
    }

    #[test]
    fn parses_data_row_with_nulls() {
        let mut buf = BytesMut::new();
        buf.put_i16(2);
        buf.put_i32(2);
        buf.put_slice(b"42");
        buf.put_i32(-1);
        let tuple = parse_data_row(&mut buf).unwrap();
        assert_eq!(tuple.column_count(), 2);
        assert_eq!(tuple.get(0).unwrap().as_ref(), b"42");
        assert!(tuple.is_null(1));
        assert_eq!(tuple.size_bytes(), 2);
        assert!(!tuple.is_end_of_rows());
    }

    #[test]
    fn truncated_data_row_is_protocol_violation() {
        let mut buf = BytesMut::new();
        buf.put_i16(1);
        buf.put_i32(10);
        buf.put_slice(b"abc");
        assert!(matches!(
            parse_data_row(&mut buf),
            Err(Error::ProtocolViolation(_))
        ));
    }
}
