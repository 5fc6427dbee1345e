// Wire message construction and parsing.

pub mod backend;
pub mod constants;
pub mod frontend;
pub mod types;

pub use backend::{insert_oid, parse_error_fields, parse_notification, update_count, Notification};
pub use constants::*;
pub use types::{oid_type_name, BytesMutReader, OID_UNSPECIFIED};
