//! Server-reported runtime parameters.

use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct ServerParameters {
    /// Keyed case-insensitively; the last write wins.
    parameters: HashMap<String, String>,
}

impl ServerParameters {
    pub fn new() -> ServerParameters {
        ServerParameters {
            parameters: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.parameters
            .insert(key.to_ascii_lowercase(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.parameters
            .get(&key.to_ascii_lowercase())
            .map(|s| s.as_str())
    }

    pub fn bool_flag(&self, key: &str) -> bool {
        matches!(self.get(key), Some("on") | Some("true") | Some("1"))
    }

    /// `server_version` as a `(major, minor)` pair where parseable.
    pub fn server_version(&self) -> Option<(u32, u32)> {
        let raw = self.get("server_version")?;
        let mut parts = raw.split(|c: char| !c.is_ascii_digit()).filter(|p| !p.is_empty());
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        Some((major, minor))
    }

    /// Negotiated Redshift protocol level, absent on stock PostgreSQL.
    pub fn server_protocol_version(&self) -> i32 {
        self.get("server_protocol_version")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn time_zone(&self) -> Option<&str> {
        self.get("timezone")
    }

    pub fn as_hashmap(&self) -> HashMap<String, String> {
        self.parameters.clone()
    }
}
