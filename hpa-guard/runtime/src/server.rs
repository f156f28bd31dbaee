use crate::certs::{CertResolver, CertificateManager};
use hpa_guard_core::WebhookError;
use hyper::{body::Incoming, server::conn::http1, Request, Response};
use hyper_util::{rt::TokioIo, service::TowerToHyperService};
use rustls::{crypto::CryptoProvider, ServerConfig};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, time};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, debug_span, info, warn, Instrument};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Bounds how long a client may take to complete the TLS handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds the listener's TLS configuration.
///
/// The returned config resolves its certificate through a slot that is
/// swapped whenever the certificate manager installs new material.
pub fn tls_config(certs: &CertificateManager) -> Result<Arc<ServerConfig>, WebhookError> {
    use rustls::crypto::ring::{cipher_suite as suite, default_provider};

    let resolver = Arc::new(CertResolver::new(certs.certified_key()));
    certs.on_reload({
        let resolver = resolver.clone();
        move |key| resolver.swap(key)
    });

    // AEAD-only suites. TLS 1.2 handshakes must use ECDHE.
    let provider = CryptoProvider {
        cipher_suites: vec![
            suite::TLS13_AES_256_GCM_SHA384,
            suite::TLS13_AES_128_GCM_SHA256,
            suite::TLS13_CHACHA20_POLY1305_SHA256,
            suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
            suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
            suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
            suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        ],
        ..default_provider()
    };

    let mut config = ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .map_err(|error| {
            WebhookError::configuration(format!("invalid TLS configuration: {error}"))
                .with_source(error)
        })?
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Serves HTTPS connections until shutdown is signaled.
///
/// On shutdown the listener is closed first; in-flight connections are then
/// asked to finish and are given up to `shutdown_timeout` to do so.
pub async fn serve<S, B>(
    listener: TcpListener,
    tls: Arc<ServerConfig>,
    svc: S,
    drain: drain::Watch,
    shutdown_timeout: Duration,
) where
    S: tower::Service<Request<Incoming>, Response = Response<B>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    let acceptor = TlsAcceptor::from(tls);
    let (conns_signal, conns) = drain::channel();

    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Admission webhook listening");
    }

    let shutdown = drain.signaled();
    tokio::pin!(shutdown);
    let release = loop {
        let (tcp, peer) = tokio::select! {
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(error) => {
                    warn!(%error, "Failed to accept connection");
                    continue;
                }
            },
            release = &mut shutdown => break release,
        };

        tokio::spawn(
            serve_conn(tcp, peer, acceptor.clone(), svc.clone(), conns.clone())
                .instrument(debug_span!("conn", %peer)),
        );
    };

    drop(listener);
    drop(conns);
    info!("Draining admission connections");
    if time::timeout(shutdown_timeout, conns_signal.drain())
        .await
        .is_err()
    {
        warn!(
            timeout = ?shutdown_timeout,
            "Connections did not finish before the shutdown timeout"
        );
    }
    drop(release);
}

async fn serve_conn<S, B>(
    tcp: tokio::net::TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    svc: S,
    drain: drain::Watch,
) where
    S: tower::Service<Request<Incoming>, Response = Response<B>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    let handshake = time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(tcp));
    let stream = tokio::select! {
        res = handshake => match res {
            Ok(Ok(stream)) => stream,
            Ok(Err(error)) => {
                debug!(%error, %peer, "TLS handshake failed");
                return;
            }
            Err(_) => {
                debug!(%peer, timeout = ?HANDSHAKE_TIMEOUT, "TLS handshake timed out");
                return;
            }
        },
        _ = drain.clone().signaled() => {
            debug!(%peer, "Dropping connection before TLS handshake");
            return;
        }
    };

    let conn = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), TowerToHyperService::new(svc));
    tokio::pin!(conn);
    let res = tokio::select! {
        res = conn.as_mut() => res,
        release = drain.signaled() => {
            conn.as_mut().graceful_shutdown();
            release.release_after(conn).await
        }
    };
    if let Err(error) = res {
        debug!(%error, "Connection closed with error");
    }
}
