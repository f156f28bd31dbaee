use crate::metrics::CertificateMetrics;
use chrono::{DateTime, Utc};
use hpa_guard_core::WebhookError;
use parking_lot::{Mutex, RwLock};
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer},
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::time;
use tracing::{debug, info, warn};
use x509_parser::{extensions::GeneralName, prelude::X509Certificate};

/// Where the webhook's TLS material lives on disk.
#[derive(Clone, Debug)]
pub struct CertificatePaths {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: Option<PathBuf>,
}

/// Facts about the leaf certificate currently being served.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateInfo {
    pub subject: String,
    pub not_after: DateTime<Utc>,
    pub days_until_expiry: i64,
    pub dns_names: Vec<String>,
}

/// Owns the webhook's serving certificate.
///
/// The manager is the only writer of the active certificate. New material is
/// installed only when the files on disk differ from what is being served, and
/// is then handed to a single registered callback.
pub struct CertificateManager {
    paths: CertificatePaths,
    active: Mutex<Material>,
    on_reload: Mutex<Option<ReloadCallback>>,
    metrics: CertificateMetrics,
}

type ReloadCallback = Box<dyn Fn(Arc<CertifiedKey>) + Send + Sync>;

/// Serves the most recently installed certificate to TLS handshakes.
#[derive(Debug)]
pub struct CertResolver {
    current: RwLock<Arc<CertifiedKey>>,
}

struct Material {
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
    key: Arc<CertifiedKey>,
    info: CertificateInfo,
    ca_certificates: Option<usize>,
}

// === impl CertificateManager ===

impl CertificateManager {
    /// Loads the configured material. Failure here is fatal to startup.
    pub async fn load(
        paths: CertificatePaths,
        metrics: CertificateMetrics,
    ) -> Result<Self, WebhookError> {
        let material = Material::read(&paths).await?;
        metrics.set_expiry_days(material.info.days_until_expiry);
        info!(
            subject = %material.info.subject,
            not_after = %material.info.not_after,
            days_until_expiry = material.info.days_until_expiry,
            dns_names = ?material.info.dns_names,
            "Loaded TLS certificate"
        );
        Ok(Self {
            paths,
            active: Mutex::new(material),
            on_reload: Mutex::new(None),
            metrics,
        })
    }

    /// Registers the callback invoked with each newly installed certificate.
    ///
    /// Registering again replaces the previous callback.
    pub fn on_reload(&self, callback: impl Fn(Arc<CertifiedKey>) + Send + Sync + 'static) {
        *self.on_reload.lock() = Some(Box::new(callback));
    }

    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        self.active.lock().key.clone()
    }

    pub fn info(&self) -> CertificateInfo {
        self.active.lock().info.clone()
    }

    /// The number of certificates in the configured CA bundle, if any.
    pub fn ca_certificates(&self) -> Option<usize> {
        self.active.lock().ca_certificates
    }

    /// Re-reads the configured files and installs them if they changed.
    ///
    /// Returns whether new material was installed. On error the active
    /// certificate is left untouched.
    pub async fn reload(&self) -> Result<bool, WebhookError> {
        let material = match Material::read(&self.paths).await {
            Ok(material) => material,
            Err(error) => {
                self.metrics.reloaded("error");
                return Err(error);
            }
        };

        // The callback runs under the active lock so that concurrent reloads
        // publish in the order they were installed.
        let mut active = self.active.lock();
        if active.cert_pem == material.cert_pem && active.key_pem == material.key_pem {
            self.metrics.set_expiry_days(active.info.refreshed().days_until_expiry);
            self.metrics.reloaded("unchanged");
            return Ok(false);
        }
        self.metrics.set_expiry_days(material.info.days_until_expiry);
        info!(
            subject = %material.info.subject,
            not_after = %material.info.not_after,
            "Installing new TLS certificate"
        );
        let key = material.key.clone();
        *active = material;

        self.metrics.reloaded("installed");
        if let Some(callback) = &*self.on_reload.lock() {
            callback(key);
        }
        Ok(true)
    }

    /// Confirms the configured files can still be loaded, without installing
    /// them.
    pub async fn check_loadable(&self) -> Result<CertificateInfo, WebhookError> {
        Material::read(&self.paths).await.map(|m| m.info)
    }

    /// Periodically reloads the certificate until shutdown is signaled.
    pub async fn monitor(self: Arc<Self>, interval: Duration, drain: drain::Watch) {
        let mut ticks = time::interval(interval);
        ticks.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        // The first tick completes immediately and the material was just loaded.
        ticks.tick().await;

        let shutdown = drain.signaled();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = ticks.tick() => {}
                handle = &mut shutdown => {
                    debug!("Stopping certificate monitor");
                    drop(handle);
                    return;
                }
            }

            match self.reload().await {
                Ok(true) => info!("TLS certificate reloaded"),
                Ok(false) => debug!("TLS certificate unchanged"),
                Err(error) => {
                    warn!(%error, "Failed to reload TLS certificate; keeping the active one")
                }
            }
        }
    }
}

impl std::fmt::Debug for CertificateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateManager")
            .field("paths", &self.paths)
            .field("info", &self.info())
            .finish_non_exhaustive()
    }
}

// === impl Material ===

impl Material {
    async fn read(paths: &CertificatePaths) -> Result<Self, WebhookError> {
        let cert_pem = read_file(&paths.cert).await?;
        let key_pem = read_file(&paths.key).await?;

        let chain = rustls_pemfile::certs(&mut cert_pem.as_slice())
            .collect::<Result<Vec<CertificateDer<'static>>, _>>()
            .map_err(|error| {
                WebhookError::certificate(format!("invalid certificate PEM: {error}"))
                    .with_details(paths.cert.display().to_string())
            })?;
        let leaf = chain.first().ok_or_else(|| {
            WebhookError::certificate("no certificates found")
                .with_details(paths.cert.display().to_string())
        })?;
        let info = CertificateInfo::parse(leaf)?;

        let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
            .map_err(|error| WebhookError::certificate(format!("invalid private key PEM: {error}")))?
            .ok_or_else(|| {
                WebhookError::certificate("no private key found")
                    .with_details(paths.key.display().to_string())
            })?;
        let key = signing_key(&key)?;

        let ca_certificates = match &paths.ca {
            None => None,
            Some(path) => {
                let pem = read_file(path).await?;
                let bundle = rustls_pemfile::certs(&mut pem.as_slice())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|error| {
                        WebhookError::certificate(format!("invalid CA bundle PEM: {error}"))
                            .with_details(path.display().to_string())
                    })?;
                if bundle.is_empty() {
                    return Err(WebhookError::certificate("CA bundle contains no certificates")
                        .with_details(path.display().to_string()));
                }
                Some(bundle.len())
            }
        };

        let key = CertifiedKey::new(chain, key);
        match key.keys_match() {
            // Signing keys that cannot expose a public key are not checked.
            Ok(()) | Err(rustls::Error::InconsistentKeys(rustls::InconsistentKeys::Unknown)) => {}
            Err(error) => {
                return Err(WebhookError::certificate(format!(
                    "private key does not match certificate: {error}"
                ))
                .with_details(format!(
                    "{} and {}",
                    paths.cert.display(),
                    paths.key.display()
                ))
                .with_suggestion("Check that the certificate and key were rotated together")
                .with_source(error));
            }
        }

        Ok(Self {
            key: Arc::new(key),
            cert_pem,
            key_pem,
            info,
            ca_certificates,
        })
    }
}

async fn read_file(path: &std::path::Path) -> Result<Vec<u8>, WebhookError> {
    tokio::fs::read(path).await.map_err(|error| {
        WebhookError::certificate(format!("failed to read {}: {error}", path.display()))
            .with_suggestion("Check that the TLS secret is mounted at the configured path")
            .with_source(error)
    })
}

fn signing_key(
    key: &PrivateKeyDer<'_>,
) -> Result<Arc<dyn rustls::sign::SigningKey>, WebhookError> {
    rustls::crypto::ring::sign::any_supported_type(key).map_err(|error| {
        WebhookError::certificate(format!("unsupported private key: {error}")).with_source(error)
    })
}

// === impl CertificateInfo ===

impl CertificateInfo {
    fn parse(der: &CertificateDer<'_>) -> Result<Self, WebhookError> {
        let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref()).map_err(|error| {
            WebhookError::certificate(format!("failed to parse certificate: {error}"))
        })?;
        let not_after = DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
            .ok_or_else(|| WebhookError::certificate("certificate expiry is out of range"))?;
        Ok(Self {
            subject: cert.subject().to_string(),
            not_after,
            days_until_expiry: (not_after - Utc::now()).num_days(),
            dns_names: dns_names(&cert),
        })
    }

    pub fn is_expired(&self) -> bool {
        self.not_after <= Utc::now()
    }

    fn refreshed(&self) -> Self {
        Self {
            days_until_expiry: (self.not_after - Utc::now()).num_days(),
            ..self.clone()
        }
    }
}

fn dns_names(cert: &X509Certificate<'_>) -> Vec<String> {
    match cert.subject_alternative_name() {
        Ok(Some(san)) => san
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

// === impl CertResolver ===

impl CertResolver {
    pub fn new(key: Arc<CertifiedKey>) -> Self {
        Self {
            current: RwLock::new(key),
        }
    }

    pub fn swap(&self, key: Arc<CertifiedKey>) {
        *self.current.write() = key;
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, _: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.current.read().clone())
    }
}
