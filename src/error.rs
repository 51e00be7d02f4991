use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Typed error hierarchy for the proxy's control and data planes.
///
/// Control-plane variants (`BindFailure`, `DuplicateService`,
/// `UnknownService`) are surfaced synchronously to the `Proxier` caller and
/// never leave the service table partially mutated. Data-plane variants
/// (`MissingService`, `NoEndpoints`, `DialFailure`) are encountered inside a
/// listener task, logged, and never propagated as a panic.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to bind {addr}: {source}")]
    BindFailure { addr: SocketAddr, source: io::Error },

    #[error("service '{id}' is already registered")]
    DuplicateService { id: String },

    #[error("service '{id}' is not registered")]
    UnknownService { id: String },

    #[error("service '{id}' has no known endpoints in the load balancer")]
    MissingService { id: String },

    #[error("service '{id}' has an empty endpoint list")]
    NoEndpoints { id: String },

    #[error("failed to dial backend {endpoint}: {source}")]
    DialFailure { endpoint: String, source: io::Error },
}

pub type ProxyResult<T> = Result<T, ProxyError>;
