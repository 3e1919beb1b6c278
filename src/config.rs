//! Environment-driven configuration.
//!
//! The proxy is configured entirely through environment variables; every
//! knob has a default except `ADMIN_API_KEY`, which gates the admin
//! surface and must be set.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use uuid::Uuid;

/// Runtime configuration assembled from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port for the plain-HTTP listener (challenges + redirect).
    pub http_port: u16,
    /// Port for the TLS listener.
    pub https_port: u16,
    /// Port for the admin REST surface (loopback).
    pub admin_port: u16,
    /// Shared secret for the admin surface.
    pub admin_api_key: String,
    /// Root for metadata files, uploaded binaries and the ACME webroot.
    pub data_dir: PathBuf,
    /// Directory holding the per-project Unix sockets.
    pub sockets_dir: PathBuf,
    /// ACME client binary.
    pub certbot_path: PathBuf,
    /// Directory the ACME client writes certificates into.
    pub letsencrypt_dir: PathBuf,
    /// Contact email passed to the ACME client.
    pub certbot_email: Option<String>,
    /// Log filter directive.
    pub log_level: String,
    /// True disables the ACME staging endpoint.
    pub production: bool,
    /// Interval between backend health probes.
    pub health_check_interval: Duration,
    /// How long to wait for a spawned backend's socket to appear.
    pub process_start_timeout: Duration,
}

fn default_listen_port() -> u16 {
    80
}

fn default_tls_port() -> u16 {
    443
}

fn default_admin_port() -> u16 {
    8080
}

fn default_health_interval_ms() -> u64 {
    30_000
}

fn default_start_timeout_ms() -> u64 {
    10_000
}

impl Config {
    /// Reads configuration from the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let admin_api_key = lookup("ADMIN_API_KEY")
            .filter(|key| !key.is_empty())
            .context("ADMIN_API_KEY must be set")?;

        let data_dir = PathBuf::from(lookup("DATA_DIR").unwrap_or_else(|| "./data".to_string()));
        let sockets_dir = lookup("SOCKETS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("sockets"));

        Ok(Self {
            http_port: parse_var(&lookup, "HTTP_PORT", default_listen_port())?,
            https_port: parse_var(&lookup, "HTTPS_PORT", default_tls_port())?,
            admin_port: parse_var(&lookup, "ADMIN_PORT", default_admin_port())?,
            admin_api_key,
            data_dir,
            sockets_dir,
            certbot_path: PathBuf::from(
                lookup("CERTBOT_PATH").unwrap_or_else(|| "certbot".to_string()),
            ),
            letsencrypt_dir: PathBuf::from(
                lookup("LETSENCRYPT_DIR").unwrap_or_else(|| "/etc/letsencrypt/live".to_string()),
            ),
            certbot_email: lookup("CERTBOT_EMAIL").filter(|email| !email.is_empty()),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            production: lookup("NODE_ENV").as_deref() == Some("production"),
            health_check_interval: Duration::from_millis(parse_var(
                &lookup,
                "HEALTH_CHECK_INTERVAL",
                default_health_interval_ms(),
            )?),
            process_start_timeout: Duration::from_millis(parse_var(
                &lookup,
                "PROCESS_START_TIMEOUT",
                default_start_timeout_ms(),
            )?),
        })
    }

    pub fn domains_db_path(&self) -> PathBuf {
        self.data_dir.join("domains.db")
    }

    pub fn projects_db_path(&self) -> PathBuf {
        self.data_dir.join("projects.db")
    }

    /// Uploaded project binaries live under `<data>/projects/<id>`.
    pub fn projects_dir(&self) -> PathBuf {
        self.data_dir.join("projects")
    }

    pub fn binary_path_for(&self, id: Uuid) -> PathBuf {
        self.projects_dir().join(id.to_string())
    }

    pub fn socket_path_for(&self, id: Uuid) -> PathBuf {
        self.sockets_dir.join(format!("{id}.sock"))
    }

    pub fn webroot_dir(&self) -> PathBuf {
        self.data_dir.join("webroot")
    }

    pub fn challenge_dir(&self) -> PathBuf {
        self.webroot_dir().join(".well-known/acme-challenge")
    }

    /// Creates every directory the proxy writes into.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.sockets_dir)?;
        std::fs::create_dir_all(self.projects_dir())?;
        std::fs::create_dir_all(self.challenge_dir())?;
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw}: {e}")),
        None => Ok(default),
    }
}
