//! Router assembly and the mutual-TLS listener.
//!
//! The listener requires a client certificate signed by the cluster's
//! request-header CA. A custom acceptor copies the verified peer chain into
//! a request extension so the auth gate can enforce the CN allow-list.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::middleware::{self, AddExtension};
use axum::routing::get;
use axum::{Extension, Router};
use axum_server::accept::Accept;
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use futures::future::BoxFuture;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::reflector::Store;
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tower::Layer;
use tracing::info;

use crate::auth::{authenticate, ClientCertChain};
use crate::consts::API_PREFIX;
use crate::handlers::{self, AppState};

/// Builds the aggregated API router with the auth gate wrapped around every
/// route.
pub fn router(state: AppState, config_maps: Store<ConfigMap>) -> Router {
    Router::new()
        .route(API_PREFIX, get(handlers::discovery))
        .route(
            &format!("{API_PREFIX}/{{resource}}"),
            get(handlers::cluster_scope),
        )
        .route(
            &format!("{API_PREFIX}/namespaces/{{namespace}}/{{resource}}"),
            get(handlers::subtree_scope),
        )
        .layer(middleware::from_fn_with_state(config_maps, authenticate))
        .with_state(state)
}

/// Paths to the serving certificate and key.
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Serves the router over mutual TLS until the process exits.
pub async fn serve(
    addr: SocketAddr,
    paths: TlsPaths,
    client_ca_pem: &str,
    app: Router,
) -> anyhow::Result<()> {
    let config = tls_config(&paths, client_ca_pem).await?;
    let acceptor = PeerCertAcceptor::new(RustlsAcceptor::new(RustlsConfig::from_config(Arc::new(
        config,
    ))));

    info!(%addr, "starting server");
    axum_server::bind(addr)
        .acceptor(acceptor)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}

/// Server TLS config requiring a client certificate signed by the
/// request-header CA bundle.
async fn tls_config(paths: &TlsPaths, client_ca_pem: &str) -> anyhow::Result<rustls::ServerConfig> {
    let cert_pem = tokio::fs::read(&paths.cert).await?;
    let key_pem = tokio::fs::read(&paths.key).await?;

    let certs = rustls_pemfile::certs(&mut cert_pem.as_slice()).collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {}", paths.key.display()))?;

    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut client_ca_pem.as_bytes()) {
        roots.add(cert?)?;
    }
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|err| anyhow::anyhow!("could not build client verifier: {err}"))?;

    let config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)?;
    Ok(config)
}

/// TLS acceptor that exposes the verified peer certificate chain to
/// handlers through the [`ClientCertChain`] request extension.
#[derive(Clone)]
pub struct PeerCertAcceptor {
    inner: RustlsAcceptor,
}

impl PeerCertAcceptor {
    pub fn new(inner: RustlsAcceptor) -> Self {
        Self { inner }
    }
}

impl<I, S> Accept<I, S> for PeerCertAcceptor
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Send + 'static,
{
    type Stream = TlsStream<I>;
    type Service = AddExtension<S, ClientCertChain>;
    type Future = BoxFuture<'static, io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let acceptor = self.inner.clone();
        Box::pin(async move {
            let (stream, service) = acceptor.accept(stream, service).await?;
            let (_, session) = stream.get_ref();
            let chain = session
                .peer_certificates()
                .map(|certs| certs.iter().map(|cert| cert.as_ref().to_vec()).collect())
                .unwrap_or_default();
            let service = Extension(ClientCertChain::new(chain)).layer(service);
            Ok((stream, service))
        })
    }
}
