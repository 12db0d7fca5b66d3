//! Server configuration for `Strongroom`.
//!
//! Read from `STRONGROOM_*` environment variables. Unset or unparsable
//! values fall back to the defaults below.

use std::net::SocketAddr;
use std::time::Duration;

use strongroom_core::{LeaseManagerOptions, SecretStoreOptions};

const DEFAULT_PORT: u16 = 8200;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to.
    pub bind_addr: SocketAddr,
    /// Storage backend type.
    pub storage_backend: StorageBackendType,
    /// Log filter used when `RUST_LOG` is unset.
    pub log_level: String,
    /// JSON-lines audit file, if any.
    pub audit_file_path: Option<String>,
    /// Seconds between lease sweeps.
    pub lease_sweep_interval_secs: u64,
    /// Auto-renew leases with at most this many seconds left.
    pub auto_renew_threshold_secs: u64,
    /// `max_versions` for newly created secrets (0 = unlimited).
    pub default_max_versions: u32,
    /// Skip `mlockall` (development without `CAP_IPC_LOCK`).
    pub disable_mlock: bool,
}

/// Supported storage backend types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackendType {
    /// In-memory, lost on restart.
    Memory,
    RocksDb { path: String },
    Redb { path: String },
    Postgres { url: String },
}

impl ServerConfig {
    /// Load configuration from the process environment.
    ///
    /// - `STRONGROOM_BIND_ADDR`: full bind address (wins over `PORT`)
    /// - `PORT`: port on `0.0.0.0`
    /// - `STRONGROOM_STORAGE`: `memory`, `rocksdb`, `redb` or `postgres`
    /// - `STRONGROOM_STORAGE_PATH`: directory for file backends (`./data`)
    /// - `DATABASE_URL`: PostgreSQL connection string
    /// - `STRONGROOM_LOG_LEVEL`: log filter (`info`)
    /// - `STRONGROOM_AUDIT_FILE`: audit log path (unset = no file sink)
    /// - `STRONGROOM_LEASE_SWEEP_INTERVAL`: seconds (`60`)
    /// - `STRONGROOM_AUTO_RENEW_THRESHOLD`: seconds (`300`)
    /// - `STRONGROOM_DEFAULT_MAX_VERSIONS`: (`10`)
    /// - `STRONGROOM_DISABLE_MLOCK`: `true`/`1` to skip `mlockall`
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let bind_addr = match (var("STRONGROOM_BIND_ADDR"), var("PORT")) {
            (Some(addr), _) => addr
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT))),
            (None, Some(port)) => {
                SocketAddr::from(([0, 0, 0, 0], port.parse().unwrap_or(DEFAULT_PORT)))
            }
            (None, None) => SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
        };

        let storage_path = var("STRONGROOM_STORAGE_PATH").unwrap_or_else(|| "./data".to_owned());
        let storage_backend = match var("STRONGROOM_STORAGE")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "rocksdb" => StorageBackendType::RocksDb { path: storage_path },
            "redb" => StorageBackendType::Redb { path: storage_path },
            "postgres" | "postgresql" => StorageBackendType::Postgres {
                url: var("DATABASE_URL")
                    .unwrap_or_else(|| "postgres://localhost/strongroom".to_owned()),
            },
            _ => StorageBackendType::Memory,
        };

        let number = |name: &str, default: u64| {
            var(name).and_then(|v| v.parse().ok()).unwrap_or(default)
        };

        Self {
            bind_addr,
            storage_backend,
            log_level: var("STRONGROOM_LOG_LEVEL").unwrap_or_else(|| "info".to_owned()),
            audit_file_path: var("STRONGROOM_AUDIT_FILE").filter(|p| !p.is_empty()),
            lease_sweep_interval_secs: number("STRONGROOM_LEASE_SWEEP_INTERVAL", 60).max(1),
            auto_renew_threshold_secs: number("STRONGROOM_AUTO_RENEW_THRESHOLD", 300),
            default_max_versions: var("STRONGROOM_DEFAULT_MAX_VERSIONS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            disable_mlock: var("STRONGROOM_DISABLE_MLOCK").is_some_and(|v| v == "true" || v == "1"),
        }
    }

    #[must_use]
    pub fn lease_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.lease_sweep_interval_secs)
    }

    #[must_use]
    pub fn secret_store_options(&self) -> SecretStoreOptions {
        SecretStoreOptions {
            default_max_versions: self.default_max_versions,
        }
    }

    #[must_use]
    pub fn lease_manager_options(&self) -> LeaseManagerOptions {
        let threshold = i64::try_from(self.auto_renew_threshold_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or_else(|| LeaseManagerOptions::default().auto_renew_threshold);
        LeaseManagerOptions {
            auto_renew_threshold: threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        ServerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults() {
        let c = config(&[]);
        assert_eq!(c.bind_addr, SocketAddr::from(([127, 0, 0, 1], 8200)));
        assert_eq!(c.storage_backend, StorageBackendType::Memory);
        assert_eq!(c.log_level, "info");
        assert_eq!(c.audit_file_path, None);
        assert_eq!(c.lease_sweep_interval(), Duration::from_secs(60));
        assert_eq!(c.secret_store_options().default_max_versions, 10);
        assert_eq!(
            c.lease_manager_options().auto_renew_threshold,
            chrono::Duration::seconds(300)
        );
        assert!(!c.disable_mlock);
    }

    #[test]
    fn bind_addr_prefers_explicit_address_over_port() {
        let c = config(&[("PORT", "9000")]);
        assert_eq!(c.bind_addr, SocketAddr::from(([0, 0, 0, 0], 9000)));

        let c = config(&[("PORT", "9000"), ("STRONGROOM_BIND_ADDR", "10.0.0.1:8300")]);
        assert_eq!(c.bind_addr, SocketAddr::from(([10, 0, 0, 1], 8300)));
    }

    #[test]
    fn storage_selection() {
        let c = config(&[("STRONGROOM_STORAGE", "RocksDB"), ("STRONGROOM_STORAGE_PATH", "/var/lib/sr")]);
        assert_eq!(
            c.storage_backend,
            StorageBackendType::RocksDb {
                path: "/var/lib/sr".to_owned()
            }
        );

        let c = config(&[("STRONGROOM_STORAGE", "postgres")]);
        assert_eq!(
            c.storage_backend,
            StorageBackendType::Postgres {
                url: "postgres://localhost/strongroom".to_owned()
            }
        );
    }

    #[test]
    fn tunables_parse_and_fall_back() {
        let c = config(&[
            ("STRONGROOM_LEASE_SWEEP_INTERVAL", "0"),
            ("STRONGROOM_AUTO_RENEW_THRESHOLD", "45"),
            ("STRONGROOM_DEFAULT_MAX_VERSIONS", "not-a-number"),
            ("STRONGROOM_DISABLE_MLOCK", "1"),
        ]);
        assert_eq!(c.lease_sweep_interval_secs, 1);
        assert_eq!(
            c.lease_manager_options().auto_renew_threshold,
            chrono::Duration::seconds(45)
        );
        assert_eq!(c.default_max_versions, 10);
        assert!(c.disable_mlock);
    }
}
