//! Owns the set of active per-service listener tasks: starts, stops, and
//! reconciles them against a desired service list while concurrent
//! connections remain in flight.

pub mod io;
pub mod tcp;
pub mod udp;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::balancer::LoadBalancer;
use crate::error::{ProxyError, ProxyResult};
use crate::net::{Protocol, Service};

/// Default idle timeout applied to UDP services added through `on_update`
/// (which carries no per-service timeout parameter, unlike
/// `add_service_on_unused_port`).
pub const DEFAULT_UDP_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-service bookkeeping the Proxier keeps while a listener task is
/// running. Destroyed when `stop_proxy` runs or `on_update` omits the id.
struct ServiceInfo {
    port: u16,
    protocol: Protocol,
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Registry of per-service listener tasks. The service table is exclusively
/// written by `Proxier` methods, guarded by a single `std::sync::Mutex`
/// held only for the map mutation itself (spec §9) — never across an
/// `.await`, so listener teardown never blocks a concurrent `on_update`.
pub struct Proxier {
    bind_address: std::net::IpAddr,
    balancer: Arc<LoadBalancer>,
    services: Mutex<HashMap<String, ServiceInfo>>,
}

impl Proxier {
    pub fn new(bind_address: std::net::IpAddr, balancer: Arc<LoadBalancer>) -> Self {
        Self {
            bind_address,
            balancer,
            services: Mutex::new(HashMap::new()),
        }
    }

    /// Reconciles the current service table with `desired`. For each
    /// desired service: starts it if absent, leaves it running if present
    /// with the same `(port, protocol)`, or restarts it (stop then start)
    /// if `(port, protocol)` differs. Services present but not in
    /// `desired` are stopped. Validates the entire desired set's
    /// `(port, protocol)` uniqueness up front so a rejected update never
    /// leaves the table partially mutated.
    pub async fn on_update(&self, desired: Vec<Service>) -> ProxyResult<()> {
        let mut seen_keys = std::collections::HashSet::new();
        for service in &desired {
            if !seen_keys.insert(service.key()) {
                return Err(ProxyError::DuplicateService {
                    id: service.id.clone(),
                });
            }
        }

        let desired_by_id: HashMap<String, Service> =
            desired.into_iter().map(|s| (s.id.clone(), s)).collect();

        let to_stop: Vec<String> = {
            let table = self.services.lock().unwrap();
            table
                .keys()
                .filter(|id| !desired_by_id.contains_key(*id))
                .cloned()
                .collect()
        };
        for id in to_stop {
            self.stop_proxy(&id).await?;
        }

        for service in desired_by_id.values() {
            let needs_restart = {
                let table = self.services.lock().unwrap();
                match table.get(&service.id) {
                    None => true,
                    Some(info) => (info.port, info.protocol) != service.key(),
                }
            };

            if needs_restart {
                if self.services.lock().unwrap().contains_key(&service.id) {
                    self.stop_proxy(&service.id).await?;
                }
                self.start_service(
                    service.id.clone(),
                    service.port,
                    service.protocol,
                    DEFAULT_UDP_TIMEOUT,
                )
                .await?;
            }
        }

        Ok(())
    }

    /// Signals the named service's listener task to terminate and removes
    /// its entry. Returns once the signal is delivered and the listening
    /// socket has been dropped by the listener task's return; callers that
    /// need proof the OS port is re-bindable must poll (spec §4.2).
    pub async fn stop_proxy(&self, id: &str) -> ProxyResult<()> {
        let info = {
            let mut table = self.services.lock().unwrap();
            table.remove(id)
        }
        .ok_or_else(|| ProxyError::UnknownService { id: id.to_string() })?;

        // Oneshot send never fails in a way we need to react to: either the
        // listener task is still in its accept loop (it'll observe the
        // signal) or it has already exited on its own (send is then a
        // harmless no-op against a dropped receiver).
        let _ = info.stop_tx.send(());

        // Wait for the task to actually return so the listening socket is
        // guaranteed closed before we report success, per spec §4.2.
        let _ = info.handle.await;

        info!("proxier: stopped service '{id}'");
        Ok(())
    }

    /// Binds to an OS-assigned ephemeral port, registers the service, starts
    /// its listener, and returns the chosen port.
    pub async fn add_service_on_unused_port(
        &self,
        id: String,
        protocol: Protocol,
        udp_timeout: Duration,
    ) -> ProxyResult<u16> {
        if self.services.lock().unwrap().contains_key(&id) {
            return Err(ProxyError::DuplicateService { id });
        }
        self.start_service(id, 0, protocol, udp_timeout).await
    }

    async fn start_service(
        &self,
        id: String,
        port: u16,
        protocol: Protocol,
        udp_timeout: Duration,
    ) -> ProxyResult<u16> {
        let addr = SocketAddr::new(self.bind_address, port);

        let (bound_port, stop_tx, handle) = match protocol {
            Protocol::Tcp => {
                let listener = TcpListener::bind(addr)
                    .await
                    .map_err(|source| ProxyError::BindFailure { addr, source })?;
                let bound_port = listener
                    .local_addr()
                    .map_err(|source| ProxyError::BindFailure { addr, source })?
                    .port();

                let (stop_tx, stop_rx) = oneshot::channel();
                let balancer = Arc::clone(&self.balancer);
                let service_id = id.clone();
                let handle = tokio::spawn(async move {
                    tcp::run(listener, service_id, balancer, stop_rx).await;
                });

                (bound_port, stop_tx, handle)
            }
            Protocol::Udp => {
                let socket = UdpSocket::bind(addr)
                    .await
                    .map_err(|source| ProxyError::BindFailure { addr, source })?;
                let bound_port = socket
                    .local_addr()
                    .map_err(|source| ProxyError::BindFailure { addr, source })?
                    .port();

                let (stop_tx, stop_rx) = oneshot::channel();
                let balancer = Arc::clone(&self.balancer);
                let service_id = id.clone();
                let handle = tokio::spawn(async move {
                    udp::run(socket, service_id, balancer, udp_timeout, stop_rx).await;
                });

                (bound_port, stop_tx, handle)
            }
        };

        self.services.lock().unwrap().insert(
            id.clone(),
            ServiceInfo {
                port: bound_port,
                protocol,
                stop_tx,
                handle,
            },
        );

        let bind_address = self.bind_address;
        info!("proxier: started service '{id}' on {bind_address}:{bound_port} ({protocol})");
        let table_size = self.services.lock().unwrap().len();
        debug!("proxier: service table now has {table_size} entries");

        Ok(bound_port)
    }

    /// Number of services currently in the table. Exposed for tests.
    pub fn active_service_count(&self) -> usize {
        self.services.lock().unwrap().len()
    }

    /// `(port, protocol)` of a currently active service, if any. Exposed
    /// for tests verifying reconciliation outcomes without reaching into
    /// private state.
    pub fn service_binding(&self, id: &str) -> Option<(u16, Protocol)> {
        self.services
            .lock()
            .unwrap()
            .get(id)
            .map(|info| (info.port, info.protocol))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxier() -> Proxier {
        Proxier::new(
            std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            Arc::new(LoadBalancer::new()),
        )
    }

    #[tokio::test]
    async fn on_update_starts_and_tracks_services() {
        let proxier = proxier();
        proxier
            .on_update(vec![Service::new("echo", 0, Protocol::Tcp)])
            .await
            .unwrap();

        assert_eq!(proxier.active_service_count(), 1);
        assert!(proxier.service_binding("echo").is_some());
    }

    #[tokio::test]
    async fn on_update_is_idempotent_without_restart() {
        let proxier = proxier();
        let port = proxier
            .add_service_on_unused_port("echo".into(), Protocol::Tcp, DEFAULT_UDP_TIMEOUT)
            .await
            .unwrap();

        proxier
            .on_update(vec![Service::new("echo", port, Protocol::Tcp)])
            .await
            .unwrap();
        let first_binding = proxier.service_binding("echo");

        proxier
            .on_update(vec![Service::new("echo", port, Protocol::Tcp)])
            .await
            .unwrap();
        let second_binding = proxier.service_binding("echo");

        assert_eq!(first_binding, second_binding);
    }

    #[tokio::test]
    async fn on_update_removes_services_absent_from_desired_set() {
        let proxier = proxier();
        proxier
            .on_update(vec![Service::new("echo", 0, Protocol::Tcp)])
            .await
            .unwrap();
        assert_eq!(proxier.active_service_count(), 1);

        proxier.on_update(vec![]).await.unwrap();
        assert_eq!(proxier.active_service_count(), 0);
    }

    #[tokio::test]
    async fn on_update_rejects_duplicate_port_protocol_pairs() {
        let proxier = proxier();
        let err = proxier
            .on_update(vec![
                Service::new("a", 18080, Protocol::Tcp),
                Service::new("b", 18080, Protocol::Tcp),
            ])
            .await
            .unwrap_err();

        assert!(matches!(err, ProxyError::DuplicateService { .. }));
        assert_eq!(proxier.active_service_count(), 0);
    }

    #[tokio::test]
    async fn stop_proxy_on_unknown_id_errors() {
        let proxier = proxier();
        let err = proxier.stop_proxy("nope").await.unwrap_err();
        assert!(matches!(err, ProxyError::UnknownService { .. }));
    }

    #[tokio::test]
    async fn add_service_on_unused_port_rejects_duplicate_id() {
        let proxier = proxier();
        proxier
            .add_service_on_unused_port("echo".into(), Protocol::Tcp, DEFAULT_UDP_TIMEOUT)
            .await
            .unwrap();

        let err = proxier
            .add_service_on_unused_port("echo".into(), Protocol::Tcp, DEFAULT_UDP_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::DuplicateService { .. }));
    }

    #[tokio::test]
    async fn port_released_after_stop_proxy() {
        let proxier = proxier();
        let port = proxier
            .add_service_on_unused_port("echo".into(), Protocol::Tcp, DEFAULT_UDP_TIMEOUT)
            .await
            .unwrap();

        proxier.stop_proxy("echo").await.unwrap();

        let addr = SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), port);
        let mut bound = false;
        for _ in 0..50 {
            if TcpListener::bind(addr).await.is_ok() {
                bound = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(bound, "port {port} should become re-bindable after stop_proxy");
    }
}
