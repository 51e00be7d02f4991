//! Round-robin endpoint selection, kept consistent under concurrent
//! dispatch while the endpoint table is replaced wholesale by `OnUpdate`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::error::{ProxyError, ProxyResult};
use crate::net::Endpoint;

/// One service's endpoint list plus its round-robin cursor.
///
/// Invariant: `cursor < endpoints.len()` whenever `endpoints` is non-empty.
/// The cursor is an atomic so `next_endpoint` only needs the table's read
/// lock, never its write lock — concurrent callers for the same service
/// contend on a single `fetch_add`, and callers for different services
/// don't contend at all.
struct EndpointSet {
    endpoints: Vec<Endpoint>,
    cursor: AtomicUsize,
}

impl EndpointSet {
    fn new(endpoints: Vec<Endpoint>) -> Self {
        Self {
            endpoints,
            cursor: AtomicUsize::new(0),
        }
    }
}

/// Maps a service id to an ordered endpoint list and vends the next
/// endpoint for a given service. Thread-safe under concurrent
/// `next_endpoint` and `on_update` calls.
pub struct LoadBalancer {
    table: RwLock<HashMap<String, EndpointSet>>,
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(HashMap::new()),
        }
    }

    /// Atomically replaces the entire endpoint table with the supplied set.
    /// Services absent from `endpoints_by_service` are removed; a later
    /// `next_endpoint` against them fails with `MissingService`. Cursors
    /// always reset to 0, including for services present in both the old
    /// and new tables — see DESIGN.md for why reset was chosen over
    /// preserving position across a full-table swap.
    pub fn on_update(&self, endpoints_by_service: HashMap<String, Vec<Endpoint>>) {
        let mut table = self.table.write();
        table.clear();
        table.extend(
            endpoints_by_service
                .into_iter()
                .map(|(id, endpoints)| (id, EndpointSet::new(endpoints))),
        );
    }

    /// Returns the endpoint at the service's cursor, then advances the
    /// cursor modulo the list length. Safe under concurrent calls: the
    /// increment is a single atomic op, so no two callers ever observe (and
    /// advance past) the same index.
    pub fn next_endpoint(&self, service_id: &str) -> ProxyResult<Endpoint> {
        let table = self.table.read();
        let set = table
            .get(service_id)
            .ok_or_else(|| ProxyError::MissingService {
                id: service_id.to_string(),
            })?;

        if set.endpoints.is_empty() {
            return Err(ProxyError::NoEndpoints {
                id: service_id.to_string(),
            });
        }

        let idx = set.cursor.fetch_add(1, Ordering::Relaxed) % set.endpoints.len();
        Ok(set.endpoints[idx].clone())
    }

    /// Number of endpoints currently registered for a service, or `None` if
    /// the service is unknown to the balancer. Exposed for tests and for a
    /// future admin surface; not part of the spec's required API.
    pub fn endpoint_count(&self, service_id: &str) -> Option<usize> {
        self.table.read().get(service_id).map(|s| s.endpoints.len())
    }
}
