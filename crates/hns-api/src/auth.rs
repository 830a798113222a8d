//! Client-certificate authentication gate.
//!
//! The TLS listener already requires a certificate signed by the cluster's
//! request-header CA; this layer only enforces the common-name allow-list
//! published in the `extension-apiserver-authentication` ConfigMap. The
//! identity is the CN of the first certificate in the peer chain.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::reflector::{ObjectRef, Store};
use tracing::{trace, warn};

use crate::consts::{ALLOWED_CN_KEY, CLIENT_CA_KEY, EXTENSION_CONFIG_MAP, KUBE_SYSTEM_NAMESPACE};
use crate::error::{Error, Result};

/// Client certificate chain captured from the TLS handshake.
///
/// Stored as a request extension by the TLS acceptor so handlers can access
/// it; certificates are DER bytes.
#[derive(Clone, Debug, Default)]
pub struct ClientCertChain(pub Vec<Vec<u8>>);

impl ClientCertChain {
    pub fn new(certs: Vec<Vec<u8>>) -> Self {
        Self(certs)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Middleware wrapping every handler with the CN allow-list check.
pub async fn authenticate(
    State(config_maps): State<Store<ConfigMap>>,
    request: Request,
    next: Next,
) -> Response {
    match check_request(&request, &config_maps) {
        Ok(user) => {
            trace!(%user, "authenticated user");
            next.run(request).await
        }
        Err(err) => err.into_response(),
    }
}

fn check_request(request: &Request, config_maps: &Store<ConfigMap>) -> Result<String> {
    let chain = request
        .extensions()
        .get::<ClientCertChain>()
        .filter(|chain| !chain.is_empty())
        .ok_or_else(|| {
            warn!("user is not authenticated");
            Error::Unauthenticated
        })?;
    let user = common_name(&chain.0[0])?;
    trace!(%user, "authenticating user");

    let allowed = allowed_names(config_maps)?;
    if !allowed.iter().any(|name| name == &user) {
        warn!(%user, "could not find user in allowed users");
        return Err(Error::UserNotAllowed(user));
    }
    Ok(user)
}

/// Extract the subject common name from a DER certificate.
fn common_name(der: &[u8]) -> Result<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|err| Error::AuthConfig(format!("failed to parse client certificate: {err}")))?;
    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .ok_or(Error::Unauthenticated)?;
    Ok(cn.to_string())
}

/// The allowed common names published by the extension ConfigMap.
pub fn allowed_names(config_maps: &Store<ConfigMap>) -> Result<Vec<String>> {
    let config = auth_config_map(config_maps)?;
    let raw = config
        .data
        .as_ref()
        .and_then(|data| data.get(ALLOWED_CN_KEY))
        .ok_or(Error::InvalidAuthConfig)?;
    serde_json::from_str(raw).map_err(|err| Error::AuthConfig(err.to_string()))
}

/// The PEM client CA bundle the TLS listener verifies peers against.
pub fn client_ca(config_maps: &Store<ConfigMap>) -> Result<String> {
    let config = auth_config_map(config_maps)?;
    config
        .data
        .as_ref()
        .and_then(|data| data.get(CLIENT_CA_KEY))
        .cloned()
        .ok_or(Error::InvalidAuthConfig)
}

fn auth_config_map(config_maps: &Store<ConfigMap>) -> Result<Arc<ConfigMap>> {
    let key = ObjectRef::new(EXTENSION_CONFIG_MAP).within(KUBE_SYSTEM_NAMESPACE);
    config_maps.get(&key).ok_or_else(|| {
        Error::AuthConfig(format!("configmap \"{EXTENSION_CONFIG_MAP}\" not found"))
    })
}
