use crate::{
    certs::{CertificateManager, CertificatePaths},
    duration::GoDuration,
    server, Admission, ErrorHandler, Metrics,
};
use anyhow::{bail, ensure, Result};
use clap::Parser;
use hpa_guard_core::{Environment, Validator};
use hpa_guard_k8s_api::KubeCluster;
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "hpa-guard",
    about = "Denies HorizontalPodAutoscalers that target single-replica Deployments"
)]
pub struct Args {
    #[clap(long, default_value = "hpa_guard=info,warn", env = "HPA_GUARD_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The address on which the admission webhook serves HTTPS.
    #[clap(long, default_value = "0.0.0.0:8443", env = "HPA_GUARD_ADDR")]
    addr: SocketAddr,

    #[clap(
        long,
        default_value = "/etc/webhook/certs/tls.crt",
        env = "HPA_GUARD_TLS_CERT"
    )]
    tls_cert_path: PathBuf,

    #[clap(
        long,
        default_value = "/etc/webhook/certs/tls.key",
        env = "HPA_GUARD_TLS_KEY"
    )]
    tls_key_path: PathBuf,

    /// A CA bundle to validate and report on. It is not used for client
    /// authentication.
    #[clap(long, env = "HPA_GUARD_TLS_CA")]
    tls_ca_path: Option<PathBuf>,

    /// Bounds how long a single admission review may spend reading cluster
    /// state.
    #[clap(long, default_value = "10s", env = "HPA_GUARD_REQUEST_TIMEOUT")]
    request_timeout: GoDuration,

    /// How often the certificate files are checked for changes.
    #[clap(long, default_value = "5m", env = "HPA_GUARD_CERT_MONITOR_INTERVAL")]
    cert_monitor_interval: GoDuration,

    /// How long in-flight connections may take to finish on shutdown.
    #[clap(long, default_value = "30s")]
    shutdown_timeout: GoDuration,

    /// One of `development`, `staging` or `production`. Production redacts
    /// internal error details from admission responses.
    #[clap(long, default_value = "development", env = "HPA_GUARD_ENVIRONMENT")]
    environment: Environment,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            addr,
            tls_cert_path,
            tls_key_path,
            tls_ca_path,
            request_timeout,
            cert_monitor_interval,
            shutdown_timeout,
            environment,
        } = self;

        let request_timeout = Duration::from(request_timeout);
        let cert_monitor_interval = Duration::from(cert_monitor_interval);
        ensure!(
            !request_timeout.is_zero(),
            "--request-timeout must be greater than zero"
        );
        ensure!(
            !cert_monitor_interval.is_zero(),
            "--cert-monitor-interval must be greater than zero"
        );

        // The kube client and the webhook listener share one rustls provider.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut prom = <Registry>::default();
        let metrics = Metrics::register(prom.sub_registry_with_prefix("hpa_guard"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));
        let registry = Arc::new(prom);

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder())
            .with_client(client)
            .build()
            .await?;

        let certs = CertificateManager::load(
            CertificatePaths {
                cert: tls_cert_path,
                key: tls_key_path,
                ca: tls_ca_path,
            },
            metrics.certificates.clone(),
        )
        .await
        .map(Arc::new)?;
        let tls = server::tls_config(&certs)?;

        let validator = Validator::new(KubeCluster::new(runtime.client()));
        let admission = Admission::new(
            validator,
            ErrorHandler::new(environment, metrics.errors.clone()),
            certs.clone(),
            metrics.admission.clone(),
            registry,
            request_timeout,
        );

        tokio::spawn(
            certs
                .monitor(cert_monitor_interval, runtime.shutdown_handle())
                .instrument(info_span!("certificates")),
        );

        let listener = TcpListener::bind(addr).await?;
        tokio::spawn(
            server::serve(
                listener,
                tls,
                admission,
                runtime.shutdown_handle(),
                shutdown_timeout.into(),
            )
            .instrument(info_span!("admission", port = %addr.port())),
        );

        info!(%environment, ?request_timeout, "Started");

        // Block the main thread on the shutdown signal. Once it fires, wait for
        // the listener and the certificate monitor to finish before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
