use std::path::PathBuf;
use std::str::FromStr;

use crate::engine::QuotaPolicy;
use crate::model::Ms;
use crate::tenant::TenantSettings;

/// Server settings, read from `SCOPETIME_*` environment variables.
/// Unset or unparsable values fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    /// Login name of the built-in administrator.
    pub admin_user: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub purge_retention_ms: Ms,
    pub quota_counts_requested: bool,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "scopetime".into(),
            admin_user: "admin".into(),
            max_connections: 256,
            compact_threshold: 1000,
            purge_retention_ms: 7 * 24 * 3_600_000,
            quota_counts_requested: false,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            port: parse_var(&get, "SCOPETIME_PORT").unwrap_or(defaults.port),
            bind: get("SCOPETIME_BIND").unwrap_or(defaults.bind),
            data_dir: get("SCOPETIME_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            password: get("SCOPETIME_PASSWORD").unwrap_or(defaults.password),
            admin_user: get("SCOPETIME_ADMIN_USER").unwrap_or(defaults.admin_user),
            max_connections: parse_var(&get, "SCOPETIME_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            compact_threshold: parse_var(&get, "SCOPETIME_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            purge_retention_ms: parse_var(&get, "SCOPETIME_PURGE_RETENTION_MS")
                .unwrap_or(defaults.purge_retention_ms),
            quota_counts_requested: parse_var(&get, "SCOPETIME_QUOTA_COUNTS_REQUESTED")
                .unwrap_or(defaults.quota_counts_requested),
            metrics_port: parse_var(&get, "SCOPETIME_METRICS_PORT"),
            tls_cert: get("SCOPETIME_TLS_CERT"),
            tls_key: get("SCOPETIME_TLS_KEY"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn tenant_settings(&self) -> TenantSettings {
        TenantSettings {
            compact_threshold: self.compact_threshold,
            purge_retention_ms: self.purge_retention_ms,
            quota_policy: QuotaPolicy {
                count_requested: self.quota_counts_requested,
            },
        }
    }
}

fn parse_var<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    get(key).and_then(|s| s.trim().parse().ok())
}
