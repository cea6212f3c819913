//! Runtime configuration: host/port pairs, latency, and limits, loaded from
//! TOML or JSON (spec §7).
//!
//! The teacher has no config-file loader of its own (its settings are
//! compiled-in constants), so this module is grounded in the broader pack's
//! convention of a `serde`-derived struct with a `Default` impl and a
//! `from_*_str` constructor — the same shape `imbolc-core`'s own
//! `Cargo.toml` dependency on `serde`/`serde_json` anticipates but never
//! exercises for config (it uses `serde_json` only for project-file
//! persistence).

use serde::{Deserialize, Serialize};

use crate::error::{OscError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine_host: String,
    pub engine_port: u16,
    pub interpreter_host: String,
    pub interpreter_port: u16,
    pub receive_port: u16,
    pub latency_seconds: f64,
    pub mtu_bytes: usize,
    pub default_timeout_seconds: f64,
    pub client_id: i32,
    pub max_logins: i32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            engine_host: "127.0.0.1".to_string(),
            engine_port: 57110,
            interpreter_host: "127.0.0.1".to_string(),
            interpreter_port: 57120,
            receive_port: 0,
            latency_seconds: 0.0,
            mtu_bytes: 8192,
            default_timeout_seconds: 5.0,
            client_id: 0,
            max_logins: 64,
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| OscError::ProtocolMismatch(format!("invalid config: {e}")))
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s)
            .map_err(|e| OscError::ProtocolMismatch(format!("invalid config: {e}")))
    }

    /// Load a TOML config file from disk (e.g. a session's `osc.toml`).
    pub fn from_toml_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Load a JSON config file from disk.
    pub fn from_json_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn engine_addr(&self) -> Result<std::net::SocketAddr> {
        format!("{}:{}", self.engine_host, self.engine_port)
            .parse()
            .map_err(|e| OscError::ProtocolMismatch(format!("invalid engine address: {e}")))
    }

    pub fn interpreter_addr(&self) -> Result<std::net::SocketAddr> {
        format!("{}:{}", self.interpreter_host, self.interpreter_port)
            .parse()
            .map_err(|e| OscError::ProtocolMismatch(format!("invalid interpreter address: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = Config::default();
        assert_eq!(c.engine_port, 57110);
        assert_eq!(c.mtu_bytes, 8192);
    }

    #[test]
    fn toml_overrides_selected_fields() {
        let c = Config::from_toml_str(
            r#"
            engine_port = 9000
            latency_seconds = 0.05
            "#,
        )
        .unwrap();
        assert_eq!(c.engine_port, 9000);
        assert_eq!(c.latency_seconds, 0.05);
        // unspecified fields keep their defaults
        assert_eq!(c.engine_host, "127.0.0.1");
    }

    #[test]
    fn malformed_toml_is_rejected() {
        let err = Config::from_toml_str("not = [valid").unwrap_err();
        matches!(err, OscError::ProtocolMismatch(_));
    }

    #[test]
    fn loads_from_a_toml_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("osc.toml");
        std::fs::write(&path, "engine_port = 12345\nclient_id = 3\n").unwrap();
        let c = Config::from_toml_file(&path).unwrap();
        assert_eq!(c.engine_port, 12345);
        assert_eq!(c.client_id, 3);
    }

    #[test]
    fn missing_config_file_surfaces_as_io_error() {
        let err = Config::from_toml_file("/nonexistent/osc.toml").unwrap_err();
        assert!(matches!(err, OscError::Io(_)));
    }
}
