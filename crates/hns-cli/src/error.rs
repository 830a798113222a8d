//! Error types for the CLI

/// CLI Result type
pub type Result<T> = std::result::Result<T, Error>;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Kube(#[from] kube::Error),

    #[error("could not load kubeconfig: {0}")]
    Kubeconfig(String),

    #[error("{0}")]
    Api(String),

    #[error("invalid request: {0}")]
    Http(#[from] http::Error),
}
