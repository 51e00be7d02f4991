pub mod balancer;
pub mod config;
pub mod error;
pub mod net;
pub mod proxier;

pub use balancer::LoadBalancer;
pub use error::{ProxyError, ProxyResult};
pub use net::{Endpoint, Protocol, Service};
pub use proxier::Proxier;
