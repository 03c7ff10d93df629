//! Server settings, read once from `LEDGER_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a valid {expected}, got {value:?}")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("both LEDGER_TLS_CERT and LEDGER_TLS_KEY must be set, or neither")]
    TlsPair,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends after which the compactor rewrites the log.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "ledger".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            log_json: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source; unset variables take defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let tls_cert = lookup("LEDGER_TLS_CERT");
        let tls_key = lookup("LEDGER_TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::TlsPair);
        }

        Ok(Self {
            bind: lookup("LEDGER_BIND").unwrap_or(defaults.bind),
            port: parse_var(&lookup, "LEDGER_PORT", "port number")?.unwrap_or(defaults.port),
            data_dir: lookup("LEDGER_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            password: lookup("LEDGER_PASSWORD").unwrap_or(defaults.password),
            max_connections: parse_var(&lookup, "LEDGER_MAX_CONNECTIONS", "connection count")?
                .unwrap_or(defaults.max_connections),
            compact_threshold: parse_var(&lookup, "LEDGER_COMPACT_THRESHOLD", "append count")?
                .unwrap_or(defaults.compact_threshold),
            metrics_port: parse_var(&lookup, "LEDGER_METRICS_PORT", "port number")?,
            tls_cert,
            tls_key,
            log_json: lookup("LEDGER_LOG_JSON")
                .is_some_and(|v| !matches!(v.as_str(), "" | "0" | "false")),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("ledger.wal")
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    expected: &'static str,
) -> Result<Option<T>, ConfigError> {
    lookup(var)
        .map(|value| {
            value.trim().parse().map_err(|_| ConfigError::Invalid {
                var,
                expected,
                value,
            })
        })
        .transpose()
}
