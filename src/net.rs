use serde::{Deserialize, Serialize};
use std::fmt;

/// Transport protocol a service listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
        }
    }
}

/// A logical service the proxy fronts: an identity, a local port, and the
/// protocol it speaks. Identity is `id`; two services may not bind the same
/// `(port, protocol)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub port: u16,
    pub protocol: Protocol,
}

impl Service {
    pub fn new(id: impl Into<String>, port: u16, protocol: Protocol) -> Self {
        Self {
            id: id.into(),
            port,
            protocol,
        }
    }

    /// The `(port, protocol)` pair that must be unique across the desired set.
    pub fn key(&self) -> (u16, Protocol) {
        (self.port, self.protocol)
    }
}

/// A backend address in `host:port` form. An endpoint list for a service is
/// an ordered sequence; duplicates are allowed but produce undefined
/// round-robin fairness. Kept as an owned `String` rather than a parsed
/// `SocketAddr` because endpoints may be hostnames requiring DNS resolution
/// at dial time, not at `OnUpdate` time.
pub type Endpoint = String;
