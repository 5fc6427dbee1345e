//! Connection configuration.
//!
//! `ConnectOptions` carries every knob the runtime recognizes. The URL layer
//! that produces the key/value map is an external collaborator; this module
//! validates and types the values it hands over.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::errors::Error;
use crate::messages::constants::DEFAULT_CLIENT_PROTOCOL_VERSION;

/// TLS negotiation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslMode {
    Disable,
    /// Plaintext first; upgrade to TLS when plaintext authentication fails.
    Allow,
    /// TLS first; downgrade to plaintext when post-TLS authentication fails.
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    pub fn accepts_plaintext(self) -> bool {
        matches!(self, SslMode::Disable | SslMode::Allow | SslMode::Prefer)
    }

    pub fn verifies_certificate(self) -> bool {
        matches!(self, SslMode::VerifyCa | SslMode::VerifyFull)
    }

    pub fn verifies_hostname(self) -> bool {
        matches!(self, SslMode::VerifyFull)
    }
}

impl std::str::FromStr for SslMode {
    type Err = ();

    fn from_str(s: &str) -> Result<SslMode, ()> {
        match s.to_ascii_lowercase().as_str() {
            "disable" => Ok(SslMode::Disable),
            "allow" => Ok(SslMode::Allow),
            "prefer" => Ok(SslMode::Prefer),
            "require" => Ok(SslMode::Require),
            "verify-ca" => Ok(SslMode::VerifyCa),
            "verify-full" => Ok(SslMode::VerifyFull),
            _ => Err(()),
        }
    }
}

/// When to take the implicit savepoint before a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Autosave {
    Never,
    Always,
    /// Only before statements expected to produce rows.
    Conservative,
}

/// Which query sub-protocol to prefer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    Extended,
    ExtendedForPrepared,
    ExtendedCacheEverything,
    Simple,
}

/// Candidate-host role requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetServerType {
    Any,
    /// `transaction_read_only` must be `off`.
    Primary,
    /// `transaction_read_only` must be `on`.
    Secondary,
}

/// One candidate endpoint; the host-chooser collaborator supplies the order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpec {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for HostSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Resolved credentials handed over by the credential collaborator.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub user: Option<String>,
    pub password: Option<String>,
    /// Bearer token for the native-IDP authentication path.
    pub idp_token: Option<String>,
}

/// Native-IDP startup identity, forwarded verbatim into the startup packet.
#[derive(Debug, Clone, Default)]
pub struct IdpIdentity {
    pub idp_type: String,
    pub provider_name: String,
    pub token_type: String,
    pub identity_namespace: Option<String>,
    pub idc_client_display_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub hosts: Vec<HostSpec>,
    pub database: String,
    pub ssl_mode: SslMode,
    pub target_server_type: TargetServerType,

    pub connect_timeout: Duration,
    pub login_timeout: Duration,
    pub socket_timeout_ms: u64,
    pub cancel_signal_timeout: Duration,
    pub tcp_keep_alive: bool,
    pub receive_buffer_size: Option<usize>,
    pub send_buffer_size: Option<usize>,

    pub compression: bool,
    pub client_protocol_version: i32,
    pub assume_min_server_version: Option<(u32, u32)>,

    pub application_name: Option<String>,
    pub current_schema: Option<String>,
    pub options: Option<String>,
    pub query_group: Option<String>,
    pub driver_version: String,
    pub os_version: String,
    pub plugin_name: Option<String>,
    pub idp_identity: Option<IdpIdentity>,

    pub prefer_query_mode: QueryMode,
    pub autosave: Autosave,
    pub cleanup_savepoints: bool,
    pub rewrite_batched_inserts: bool,
    pub enable_multi_sql_support: bool,
    pub raise_exception_on_silent_rollback: bool,
    pub log_server_error_detail: bool,

    pub enable_statement_cache: bool,
    pub statement_cache_queries: usize,
    pub statement_cache_bytes: usize,

    pub enable_fetch_ring_buffer: bool,
    pub fetch_ring_buffer_bytes: u64,
    pub default_row_fetch_size: u32,
    pub max_result_buffer: Option<usize>,
}

impl Default for ConnectOptions {
    fn default() -> ConnectOptions {
        ConnectOptions {
            hosts: vec![HostSpec {
                host: "localhost".into(),
                port: 5439,
            }],
            database: String::new(),
            ssl_mode: SslMode::Prefer,
            target_server_type: TargetServerType::Any,
            connect_timeout: Duration::from_secs(10),
            login_timeout: Duration::from_secs(0),
            socket_timeout_ms: 0,
            cancel_signal_timeout: Duration::from_secs(10),
            tcp_keep_alive: true,
            receive_buffer_size: None,
            send_buffer_size: None,
            compression: false,
            client_protocol_version: DEFAULT_CLIENT_PROTOCOL_VERSION,
            assume_min_server_version: None,
            application_name: None,
            current_schema: None,
            options: None,
            query_group: None,
            driver_version: concat!("redshift_wire ", env!("CARGO_PKG_VERSION")).into(),
            os_version: std::env::consts::OS.into(),
            plugin_name: None,
            idp_identity: None,
            prefer_query_mode: QueryMode::Extended,
            autosave: Autosave::Never,
            cleanup_savepoints: false,
            rewrite_batched_inserts: false,
            enable_multi_sql_support: true,
            raise_exception_on_silent_rollback: false,
            log_server_error_detail: true,
            enable_statement_cache: true,
            statement_cache_queries: 256,
            statement_cache_bytes: 5 * 1024 * 1024,
            enable_fetch_ring_buffer: true,
            fetch_ring_buffer_bytes: 1024 * 1024,
            default_row_fetch_size: 0,
            max_result_buffer: None,
        }
    }
}

impl ConnectOptions {
    pub fn new(database: &str) -> ConnectOptions {
        ConnectOptions {
            database: database.into(),
            ..ConnectOptions::default()
        }
    }

    /// Apply URL-style parameters. Unknown keys are ignored (they belong to
    /// collaborator layers); recognized keys with malformed values fail with
    /// `InvalidParameterValue`.
    pub fn apply_parameters(&mut self, params: &HashMap<String, String>) -> Result<(), Error> {
        for (key, value) in params {
            self.apply_parameter(key, value)?;
        }
        Ok(())
    }

    pub fn apply_parameter(&mut self, key: &str, value: &str) -> Result<(), Error> {
        let invalid = || Error::InvalidParameterValue {
            name: key.to_string(),
            value: value.to_string(),
        };

        match key {
            "ssl" => {
                // Legacy boolean: true means require.
                if parse_bool(value).ok_or_else(invalid)? {
                    self.ssl_mode = SslMode::Require;
                } else {
                    self.ssl_mode = SslMode::Disable;
                }
            }
            "sslMode" | "sslmode" => {
                self.ssl_mode = value.parse().map_err(|_| invalid())?;
            }
            "socketTimeout" => {
                let seconds: u64 = value.parse().map_err(|_| invalid())?;
                self.socket_timeout_ms = seconds * 1000;
            }
            "connectTimeout" => {
                self.connect_timeout = Duration::from_secs(value.parse().map_err(|_| invalid())?);
            }
            "loginTimeout" => {
                self.login_timeout = Duration::from_secs(value.parse().map_err(|_| invalid())?);
            }
            "cancelSignalTimeout" => {
                self.cancel_signal_timeout =
                    Duration::from_secs(value.parse().map_err(|_| invalid())?);
            }
            "tcpKeepAlive" => self.tcp_keep_alive = parse_bool(value).ok_or_else(invalid)?,
            "receiveBufferSize" => {
                self.receive_buffer_size = Some(value.parse().map_err(|_| invalid())?)
            }
            "sendBufferSize" => {
                self.send_buffer_size = Some(value.parse().map_err(|_| invalid())?)
            }
            "compression" => {
                self.compression = match value {
                    "lz4" => true,
                    "off" => false,
                    _ => parse_bool(value).ok_or_else(invalid)?,
                }
            }
            "protocolVersion" => {
                let version: i32 = value.parse().map_err(|_| invalid())?;
                if !(0..=3).contains(&version) {
                    return Err(invalid());
                }
                self.client_protocol_version = version;
            }
            "assumeMinServerVersion" => {
                self.assume_min_server_version = Some(parse_version(value).ok_or_else(invalid)?);
            }
            "applicationName" => self.application_name = Some(value.to_string()),
            "currentSchema" => self.current_schema = Some(value.to_string()),
            "options" => self.options = Some(value.to_string()),
            "queryGroup" => self.query_group = Some(value.to_string()),
            "preferQueryMode" => {
                self.prefer_query_mode = match value {
                    "extended" => QueryMode::Extended,
                    "extendedForPrepared" => QueryMode::ExtendedForPrepared,
                    "extendedCacheEverything" => QueryMode::ExtendedCacheEverything,
                    "simple" => QueryMode::Simple,
                    _ => return Err(invalid()),
                }
            }
            "autosave" => {
                self.autosave = match value {
                    "never" => Autosave::Never,
                    "always" => Autosave::Always,
                    "conservative" => Autosave::Conservative,
                    _ => return Err(invalid()),
                }
            }
            "cleanupSavepoints" => {
                self.cleanup_savepoints = parse_bool(value).ok_or_else(invalid)?
            }
            "reWriteBatchedInserts" => {
                self.rewrite_batched_inserts = parse_bool(value).ok_or_else(invalid)?
            }
            "enableMultiSqlSupport" => {
                self.enable_multi_sql_support = parse_bool(value).ok_or_else(invalid)?
            }
            "raiseExceptionOnSilentRollback" => {
                self.raise_exception_on_silent_rollback = parse_bool(value).ok_or_else(invalid)?
            }
            "logServerErrorDetail" => {
                self.log_server_error_detail = parse_bool(value).ok_or_else(invalid)?
            }
            "enableStatementCache" => {
                self.enable_statement_cache = parse_bool(value).ok_or_else(invalid)?
            }
            "preparedStatementCacheQueries" => {
                self.statement_cache_queries = value.parse().map_err(|_| invalid())?
            }
            "preparedStatementCacheSizeMiB" => {
                let mib: usize = value.parse().map_err(|_| invalid())?;
                self.statement_cache_bytes = mib * 1024 * 1024;
            }
            "enableFetchRingBuffer" => {
                self.enable_fetch_ring_buffer = parse_bool(value).ok_or_else(invalid)?
            }
            "fetchRingBufferSize" => {
                self.fetch_ring_buffer_bytes = parse_byte_size(value).ok_or_else(invalid)?
            }
            "defaultRowFetchSize" => {
                self.default_row_fetch_size = value.parse().map_err(|_| invalid())?
            }
            "maxResultBuffer" => {
                self.max_result_buffer =
                    Some(parse_byte_size(value).ok_or_else(invalid)? as usize)
            }
            // Keys owned by collaborator layers (credential plugins, URL
            // parsing, logging setup) pass through untouched.
            _ => {}
        }
        Ok(())
    }

    /// `extra_float_digits` to request: 2 below server 9.0, 3 from 9.0 on.
    pub fn extra_float_digits(&self) -> i32 {
        match self.assume_min_server_version {
            Some((major, _)) if major < 9 => 2,
            _ => 3,
        }
    }

    pub fn socket_timeout(&self) -> Option<Duration> {
        if self.socket_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.socket_timeout_ms))
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Some(true),
        "false" | "off" | "no" | "0" => Some(false),
        _ => None,
    }
}

/// Parse `major.minor` or bare `major` into a version pair.
fn parse_version(value: &str) -> Option<(u32, u32)> {
    let mut parts = value.splitn(2, '.');
    let major = parts.next()?.parse().ok()?;
    let minor = match parts.next() {
        Some(minor) => minor.parse().ok()?,
        None => 0,
    };
    Some((major, minor))
}

/// Byte sizes accept plain numbers or a binary suffix: `1024`, `64K`, `1M`, `2G`.
fn parse_byte_size(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Ok(bytes) = value.parse::<u64>() {
        return Some(bytes);
    }
    let upper = value.to_ascii_uppercase();
    let (digits, multiplier) = if let Some(prefix) = upper
        .strip_suffix("KB")
        .or_else(|| upper.strip_suffix('K'))
    {
        (prefix, 1024)
    } else if let Some(prefix) = upper.strip_suffix("MB").or_else(|| upper.strip_suffix('M')) {
        (prefix, 1024 * 1024)
    } else if let Some(prefix) = upper.strip_suffix("GB").or_else(|| upper.strip_suffix('G')) {
        (prefix, 1024 * 1024 * 1024)
    } else {
        return None;
    };
    digits.trim().parse::<u64>().ok().map(|n| n * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let opts = ConnectOptions::new("dev");
        assert_eq!(opts.ssl_mode, SslMode::Prefer);
        assert_eq!(opts.client_protocol_version, 3);
        assert!(opts.enable_fetch_ring_buffer);
        assert_eq!(opts.extra_float_digits(), 3);
    }

    #[test]
    fn applies_recognized_parameters() {
        let mut opts = ConnectOptions::new("dev");
        let mut params = HashMap::new();
        params.insert("sslMode".to_string(), "verify-full".to_string());
        params.insert("socketTimeout".to_string(), "30".to_string());
        params.insert("compression".to_string(), "lz4".to_string());
        params.insert("autosave".to_string(), "conservative".to_string());
        params.insert("fetchRingBufferSize".to_string(), "1M".to_string());
        params.insert("preparedStatementCacheSizeMiB".to_string(), "2".to_string());
        opts.apply_parameters(&params).unwrap();

        assert_eq!(opts.ssl_mode, SslMode::VerifyFull);
        assert_eq!(opts.socket_timeout_ms, 30_000);
        assert!(opts.compression);
        assert_eq!(opts.autosave, Autosave::Conservative);
        assert_eq!(opts.fetch_ring_buffer_bytes, 1024 * 1024);
        assert_eq!(opts.statement_cache_bytes, 2 * 1024 * 1024);
    }

    #[test]
    fn rejects_malformed_values() {
        let mut opts = ConnectOptions::new("dev");
        assert!(matches!(
            opts.apply_parameter("sslMode", "sometimes"),
            Err(Error::InvalidParameterValue { .. })
        ));
        assert!(matches!(
            opts.apply_parameter("socketTimeout", "soon"),
            Err(Error::InvalidParameterValue { .. })
        ));
        assert!(matches!(
            opts.apply_parameter("protocolVersion", "9"),
            Err(Error::InvalidParameterValue { .. })
        ));
    }

    #[test]
    fn unknown_keys_pass_through() {
        let mut opts = ConnectOptions::new("dev");
        opts.apply_parameter("iamDuration", "900").unwrap();
    }

    #[test]
    fn extra_float_digits_depends_on_assumed_version() {
        let mut opts = ConnectOptions::new("dev");
        opts.apply_parameter("assumeMinServerVersion", "8.4").unwrap();
        assert_eq!(opts.extra_float_digits(), 2);
        opts.apply_parameter("assumeMinServerVersion", "9.6").unwrap();
        assert_eq!(opts.extra_float_digits(), 3);
    }

    #[test]
    fn byte_size_suffixes() {
        assert_eq!(parse_byte_size("4096"), Some(4096));
        assert_eq!(parse_byte_size("64K"), Some(64 * 1024));
        assert_eq!(parse_byte_size("1MB"), Some(1024 * 1024));
        assert_eq!(parse_byte_size("2G"), Some(2u64 * 1024 * 1024 * 1024));
        assert_eq!(parse_byte_size("lots"), None);
    }
}
