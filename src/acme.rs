//! Certificate materialization and ACME plumbing.
//!
//! Certificates are issued and renewed by an external ACME client
//! (certbot) invoked as a subprocess against the shared webroot; this
//! module owns the in-memory certificate cache the HTTPS listener resolves
//! SNI names from, the pending HTTP-01 challenge map, and the 12-hour
//! renewal loop.
//!
//! Cache entries are loaded lazily from
//! `<letsencrypt-dir>/<hostname>/{fullchain,privkey}.pem`; a missing pair
//! simply means the HTTPS listener will not advertise that name.

use std::collections::HashMap;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rustls::pki_types::CertificateDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db::now_ms;

/// Renewal loop period.
const RENEWAL_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// Entries closer than this to expiry are renewed.
const RENEWAL_WINDOW_MS: i64 = 30 * 24 * 60 * 60 * 1000;

/// Assumed lifetime when the PEM `notAfter` cannot be parsed.
const FALLBACK_LIFETIME_MS: i64 = 90 * 24 * 60 * 60 * 1000;

#[derive(Debug, thiserror::Error)]
pub enum AcmeError {
    #[error("certificate issuance for {hostname} failed: {stderr}")]
    IssuanceFailed { hostname: String, stderr: String },

    #[error("no usable certificate for {hostname}: {reason}")]
    BadCertificate { hostname: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AcmeError>;

/// One cached certificate.
pub struct CertEntry {
    pub hostname: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// PEM `notAfter` in ms epoch, or now + 90 days when unparsable.
    pub expires_at: i64,
    pub certified: Arc<CertifiedKey>,
}

type CertCache = Arc<RwLock<HashMap<String, Arc<CertEntry>>>>;

/// SNI certificate resolver over the shared cache.
pub struct SniResolver {
    cache: CertCache,
}

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniResolver")
            .field("hostnames", &self.cache.read().keys().cloned().collect::<Vec<_>>())
            .finish()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name()?;
        self.cache.read().get(name).map(|entry| Arc::clone(&entry.certified))
    }
}

/// Owns the certificate cache, the pending HTTP-01 challenge map, and
/// drives the external ACME client.
pub struct CertManager {
    config: Config,
    cache: CertCache,
    /// token → key authorization, for challenges answered in-process.
    pending_challenges: RwLock<HashMap<String, String>>,
    bundle_tx: watch::Sender<bool>,
    bundle_rx: watch::Receiver<bool>,
}

impl CertManager {
    pub fn new(config: Config) -> Self {
        let (bundle_tx, bundle_rx) = watch::channel(false);
        Self {
            config,
            cache: Arc::new(RwLock::new(HashMap::new())),
            pending_challenges: RwLock::new(HashMap::new()),
            bundle_tx,
            bundle_rx,
        }
    }

    /// Registers a pending HTTP-01 challenge.
    pub fn set_challenge(&self, token: &str, key_authorization: &str) {
        self.pending_challenges
            .write()
            .insert(token.to_string(), key_authorization.to_string());
    }

    /// Drops a challenge once it validated or timed out.
    pub fn clear_challenge(&self, token: &str) {
        self.pending_challenges.write().remove(token);
    }

    /// Resolver handed to the rustls server config; shares the live cache,
    /// so a reload is visible to existing listeners without a restart.
    pub fn resolver(&self) -> Arc<SniResolver> {
        Arc::new(SniResolver { cache: Arc::clone(&self.cache) })
    }

    /// Flips to true once the cache holds at least one certificate.
    pub fn bundle_watch(&self) -> watch::Receiver<bool> {
        self.bundle_rx.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.read().is_empty()
    }

    pub fn entry(&self, hostname: &str) -> Option<Arc<CertEntry>> {
        self.cache.read().get(hostname).cloned()
    }

    /// Hostnames currently advertised over SNI.
    pub fn hostnames(&self) -> Vec<String> {
        self.cache.read().keys().cloned().collect()
    }

    /// Loads disk certificates for the given hostnames; misses tolerated.
    pub fn warm(&self, hostnames: &[String]) {
        let mut loaded = HashMap::new();
        for hostname in hostnames {
            match self.load_entry(hostname) {
                Ok(entry) => {
                    info!(hostname, "certificate loaded from disk");
                    loaded.insert(hostname.clone(), Arc::new(entry));
                }
                Err(e) => {
                    debug!(hostname, error = %e, "no disk certificate");
                }
            }
        }
        if !loaded.is_empty() {
            // Replace wholesale rather than editing entries in place.
            let mut cache = self.cache.write();
            for (hostname, entry) in loaded {
                cache.insert(hostname, entry);
            }
        }
        self.notify_bundle();
    }

    /// Drops and re-reads one hostname's certificate from disk.
    pub fn reload(&self, hostname: &str) -> Result<()> {
        let entry = self.load_entry(hostname)?;
        self.cache.write().insert(hostname.to_string(), Arc::new(entry));
        self.notify_bundle();
        Ok(())
    }

    pub fn evict(&self, hostname: &str) {
        self.cache.write().remove(hostname);
        self.notify_bundle();
    }

    /// Serves a pending challenge, falling back to the webroot file.
    pub async fn challenge_response(&self, token: &str) -> Option<String> {
        if let Some(key_auth) = self.pending_challenges.read().get(token) {
            return Some(key_auth.clone());
        }
        // The external ACME client writes its tokens under the webroot.
        if token.contains('/') || token.contains("..") {
            return None;
        }
        let path = self.config.challenge_dir().join(token);
        tokio::fs::read_to_string(path).await.ok()
    }

    /// Obtains a certificate for `hostname` via the ACME client binary.
    ///
    /// Blocks until the client exits, so callers must keep it off the
    /// request-serving path. On success the fresh certificate is loaded
    /// into the cache.
    pub async fn issue(&self, hostname: &str) -> Result<Arc<CertEntry>> {
        std::fs::create_dir_all(self.config.challenge_dir())?;

        let email = self
            .config
            .certbot_email
            .clone()
            .unwrap_or_else(|| format!("admin@{hostname}"));

        let mut command = tokio::process::Command::new(&self.config.certbot_path);
        command
            .arg("certonly")
            .arg("--webroot")
            .arg("-w")
            .arg(self.config.webroot_dir())
            .arg("-d")
            .arg(hostname)
            .arg("--non-interactive")
            .arg("--agree-tos")
            .arg("--email")
            .arg(&email);
        if !self.config.production {
            command.arg("--staging");
        }

        info!(hostname, email, staging = !self.config.production, "invoking ACME client");
        let output = command.output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            error!(hostname, code = ?output.status.code(), "ACME client failed");
            return Err(AcmeError::IssuanceFailed {
                hostname: hostname.to_string(),
                stderr,
            });
        }

        let entry = Arc::new(self.load_entry(hostname)?);
        self.cache.write().insert(hostname.to_string(), Arc::clone(&entry));
        self.notify_bundle();
        info!(hostname, expires_at = entry.expires_at, "certificate issued");
        Ok(entry)
    }

    /// Renewal loop: every 12 hours, renew entries within 30 days of
    /// expiry. Failures are logged and retried next tick.
    pub async fn run_renewal_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!("certificate renewal loop started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(RENEWAL_INTERVAL) => {
                    self.renew_expiring().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("renewal loop shutting down");
                        return;
                    }
                }
            }
        }
    }

    async fn renew_expiring(&self) {
        let expiring: Vec<String> = {
            let cache = self.cache.read();
            cache
                .values()
                .filter(|entry| needs_renewal(entry.expires_at))
                .map(|entry| entry.hostname.clone())
                .collect()
        };

        for hostname in expiring {
            match self.renew(&hostname).await {
                Ok(()) => info!(hostname, "certificate renewed"),
                Err(e) => warn!(hostname, error = %e, "certificate renewal failed"),
            }
        }
    }

    async fn renew(&self, hostname: &str) -> Result<()> {
        let output = tokio::process::Command::new(&self.config.certbot_path)
            .arg("renew")
            .arg("--cert-name")
            .arg(hostname)
            .arg("--non-interactive")
            .output()
            .await?;

        if !output.status.success() {
            return Err(AcmeError::IssuanceFailed {
                hostname: hostname.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        // Invalidate and pick up the renewed files.
        self.evict(hostname);
        self.reload(hostname)
    }

    fn load_entry(&self, hostname: &str) -> Result<CertEntry> {
        let dir = self.config.letsencrypt_dir.join(hostname);
        let cert_path = dir.join("fullchain.pem");
        let key_path = dir.join("privkey.pem");

        let bad = |reason: String| AcmeError::BadCertificate {
            hostname: hostname.to_string(),
            reason,
        };

        let cert_data = std::fs::read(&cert_path)
            .map_err(|e| bad(format!("{}: {e}", cert_path.display())))?;
        let key_data = std::fs::read(&key_path)
            .map_err(|e| bad(format!("{}: {e}", key_path.display())))?;

        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut BufReader::new(&cert_data[..]))
                .filter_map(|c| c.ok())
                .collect();
        if certs.is_empty() {
            return Err(bad("no certificates in fullchain.pem".to_string()));
        }

        let key = rustls_pemfile::private_key(&mut BufReader::new(&key_data[..]))
            .ok()
            .flatten()
            .ok_or_else(|| bad("no private key in privkey.pem".to_string()))?;

        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
            .map_err(|e| bad(format!("unusable private key: {e}")))?;
        let certified = Arc::new(CertifiedKey::new(certs.clone(), signing_key));

        let expires_at = cert_not_after_ms(&certs[0]).unwrap_or_else(|| {
            warn!(hostname, "could not parse certificate expiry, assuming 90 days");
            now_ms() + FALLBACK_LIFETIME_MS
        });

        Ok(CertEntry {
            hostname: hostname.to_string(),
            cert_path,
            key_path,
            expires_at,
            certified,
        })
    }

    fn notify_bundle(&self) {
        let _ = self.bundle_tx.send(!self.cache.read().is_empty());
    }
}

fn needs_renewal(expires_at: i64) -> bool {
    expires_at - now_ms() < RENEWAL_WINDOW_MS
}

/// `notAfter` of a DER certificate in ms epoch.
fn cert_not_after_ms(cert: &CertificateDer<'_>) -> Option<i64> {
    use x509_parser::prelude::*;

    let (_, parsed) = X509Certificate::from_der(cert.as_ref()).ok()?;
    Some(parsed.validity().not_after.timestamp() * 1000)
}
