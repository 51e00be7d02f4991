//! UDP listener task: synthesises connection semantics over a single
//! unconnected listening socket via a per-client session table.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::balancer::LoadBalancer;

/// Maximum datagram size (64KiB, the largest possible UDP payload).
const MAX_DATAGRAM_SIZE: usize = 65535;

/// Hard cap on concurrent sessions per UDP service. Bounds memory against
/// an unbounded set of client sources; the oldest session (by insertion
/// order) is evicted to make room for a new one. Spec §9 leaves the exact
/// eviction policy as an open question — insertion-order eviction is
/// simpler than true LRU and sufficient to bound growth.
const MAX_UDP_SESSIONS: usize = 8192;

struct SessionEntry {
    backend_socket: Arc<UdpSocket>,
    last_activity: Instant,
    /// The reply-forwarding task for this session. Tracked so the session
    /// table can abort it the moment the session is removed — on sweep,
    /// eviction, or listener shutdown — rather than leaving it to notice
    /// on its own next timeout tick.
    reader_handle: Option<JoinHandle<()>>,
}

/// Per-client-address forwarding state. Owned exclusively by the UDP
/// listener task that created it; the sweeper (run from the same task)
/// accesses it through `table`'s mutex.
struct SessionTable {
    table: Mutex<HashMap<SocketAddr, SessionEntry>>,
    insertion_order: Mutex<VecDeque<SocketAddr>>,
}

impl SessionTable {
    fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            insertion_order: Mutex::new(VecDeque::new()),
        }
    }

    fn get_backend_socket(&self, client: &SocketAddr) -> Option<Arc<UdpSocket>> {
        let mut table = self.table.lock();
        let entry = table.get_mut(client)?;
        entry.last_activity = Instant::now();
        Some(Arc::clone(&entry.backend_socket))
    }

    fn insert(&self, client: SocketAddr, backend_socket: Arc<UdpSocket>) {
        let mut table = self.table.lock();
        let mut order = self.insertion_order.lock();

        if table.len() >= MAX_UDP_SESSIONS {
            while let Some(oldest) = order.pop_front() {
                if let Some(entry) = table.remove(&oldest) {
                    if let Some(handle) = entry.reader_handle {
                        handle.abort();
                    }
                    break;
                }
            }
        }

        table.insert(
            client,
            SessionEntry {
                backend_socket,
                last_activity: Instant::now(),
                reader_handle: None,
            },
        );
        order.push_back(client);
    }

    /// Attaches the spawned reply-forwarding task to its session so it can
    /// be aborted when the session is removed. If the session is already
    /// gone (evicted or expired before the reader was registered), there's
    /// nothing left to track it from, so abort it immediately instead.
    fn attach_reader(&self, client: SocketAddr, handle: JoinHandle<()>) {
        match self.table.lock().get_mut(&client) {
            Some(entry) => entry.reader_handle = Some(handle),
            None => handle.abort(),
        }
    }

    fn touch(&self, client: &SocketAddr) {
        if let Some(entry) = self.table.lock().get_mut(client) {
            entry.last_activity = Instant::now();
        }
    }

    fn contains(&self, client: &SocketAddr) -> bool {
        self.table.lock().contains_key(client)
    }

    /// Removes one session outright (its reader task self-terminating
    /// after an idle timeout). Cleans up `insertion_order` too so a
    /// long-running service whose sessions churn under the cap never
    /// accumulates stale entries there.
    fn remove(&self, client: &SocketAddr) {
        let entry = self.table.lock().remove(client);
        if let Some(entry) = entry {
            if let Some(handle) = entry.reader_handle {
                handle.abort();
            }
        }
        self.insertion_order.lock().retain(|addr| addr != client);
    }

    fn sweep_expired(&self, timeout: Duration) {
        let now = Instant::now();
        let mut removed = Vec::new();
        {
            let mut table = self.table.lock();
            table.retain(|addr, entry| {
                let alive = now.duration_since(entry.last_activity) <= timeout;
                if !alive {
                    if let Some(handle) = entry.reader_handle.take() {
                        handle.abort();
                    }
                    removed.push(*addr);
                }
                alive
            });
        }
        if !removed.is_empty() {
            let removed: std::collections::HashSet<_> = removed.into_iter().collect();
            self.insertion_order.lock().retain(|addr| !removed.contains(addr));
            debug!("udp: swept {} expired session(s)", removed.len());
        }
    }

    /// Takes every still-tracked reader task out of the table for the
    /// caller to abort and join, and clears the table and insertion order.
    /// Used on listener shutdown so every session's backend socket (and the
    /// reader's clone of the listening socket) is dropped before the
    /// listener task returns, independent of how long `udp_timeout` is.
    fn take_all_readers(&self) -> Vec<JoinHandle<()>> {
        let mut table = self.table.lock();
        let handles = table
            .values_mut()
            .filter_map(|entry| entry.reader_handle.take())
            .collect();
        table.clear();
        self.insertion_order.lock().clear();
        handles
    }
}

/// Runs the receive loop for one UDP service until `stop_rx` fires. Unlike
/// TCP, UDP sessions are torn down promptly on stop because the listening
/// socket is their only ingress — there is no independent backend
/// connection to drain.
pub async fn run(
    socket: UdpSocket,
    service_id: String,
    balancer: Arc<LoadBalancer>,
    udp_timeout: Duration,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let socket = Arc::new(socket);
    let sessions = Arc::new(SessionTable::new());

    let sweep_period = udp_timeout.min(Duration::from_secs(30)).max(Duration::from_millis(50));
    let sweeper_sessions = Arc::clone(&sessions);
    let sweeper = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_period);
        loop {
            ticker.tick().await;
            sweeper_sessions.sweep_expired(udp_timeout);
        }
    });

    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, client_addr)) => {
                        handle_datagram(
                            &socket,
                            &sessions,
                            &balancer,
                            &service_id,
                            client_addr,
                            &buf[..len],
                            udp_timeout,
                        ).await;
                    }
                    Err(e) => {
                        warn!("udp[{service_id}]: recv error: {e}");
                    }
                }
            }
            _ = &mut stop_rx => {
                debug!("udp[{service_id}]: stop signal received");
                break;
            }
        }
    }

    sweeper.abort();

    // Abort and join every still-running reader task so each session's
    // backend socket and its clone of the listening socket are dropped
    // before this task returns — the listening socket's port can't be
    // reused until its last Arc clone is gone, per spec §4.4's "torn down
    // promptly" guarantee, regardless of how long udp_timeout is.
    for handle in sessions.take_all_readers() {
        handle.abort();
        let _ = handle.await;
    }
}

async fn handle_datagram(
    listening_socket: &Arc<UdpSocket>,
    sessions: &Arc<SessionTable>,
    balancer: &LoadBalancer,
    service_id: &str,
    client_addr: SocketAddr,
    data: &[u8],
    udp_timeout: Duration,
) {
    if let Some(backend_socket) = sessions.get_backend_socket(&client_addr) {
        if let Err(e) = backend_socket.send(data).await {
            debug!("udp[{service_id}]: forward to existing session for {client_addr} failed: {e}");
        }
        return;
    }

    let endpoint = match balancer.next_endpoint(service_id) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            debug!("udp[{service_id}]: no endpoint for {client_addr}: {e}");
            return;
        }
    };

    let backend_socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(s) => s,
        Err(e) => {
            warn!("udp[{service_id}]: failed to bind session socket for {client_addr}: {e}");
            return;
        }
    };

    // Connecting the session's backend socket means the OS itself rejects
    // any datagram not from this exact backend address — the session
    // structurally cannot relay a reply from a different backend, even
    // under a racing sweeper/lookup.
    if let Err(e) = backend_socket.connect(&endpoint).await {
        warn!("udp[{service_id}]: dial {endpoint} failed for {client_addr}: {e}");
        return;
    }

    let backend_socket = Arc::new(backend_socket);
    sessions.insert(client_addr, Arc::clone(&backend_socket));

    if let Err(e) = backend_socket.send(data).await {
        debug!("udp[{service_id}]: initial forward to {endpoint} failed: {e}");
        return;
    }

    let reader_socket = Arc::clone(&backend_socket);
    let reader_listening_socket = Arc::clone(listening_socket);
    let reader_sessions = Arc::clone(sessions);
    let reader_service_id = service_id.to_string();

    let reader_handle = tokio::spawn(async move {
        forward_replies(
            reader_socket,
            reader_listening_socket,
            reader_sessions,
            reader_service_id,
            client_addr,
            udp_timeout,
        )
        .await;
    });
    sessions.attach_reader(client_addr, reader_handle);
}

/// Forwards datagrams from a session's connected backend socket back to the
/// client via the shared listening socket, stamping `last_activity` on each
/// send. Exits (and removes its own session) the moment it goes a full
/// `udp_timeout` without hearing from the backend, or sooner if the
/// sweeper/listener shutdown removes the session out from under it and
/// aborts this task directly.
async fn forward_replies(
    backend_socket: Arc<UdpSocket>,
    listening_socket: Arc<UdpSocket>,
    sessions: Arc<SessionTable>,
    service_id: String,
    client_addr: SocketAddr,
    udp_timeout: Duration,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        if !sessions.contains(&client_addr) {
            debug!("udp[{service_id}]: session for {client_addr} expired, stopping reader");
            break;
        }

        match tokio::time::timeout(udp_timeout, backend_socket.recv(&mut buf)).await {
            Ok(Ok(len)) => {
                sessions.touch(&client_addr);
                if let Err(e) = listening_socket.send_to(&buf[..len], client_addr).await {
                    debug!("udp[{service_id}]: reply to {client_addr} failed: {e}");
                    break;
                }
            }
            Ok(Err(e)) => {
                debug!("udp[{service_id}]: backend read error for {client_addr}: {e}");
                break;
            }
            Err(_) => {
                debug!("udp[{service_id}]: session for {client_addr} idle past timeout, closing");
                sessions.remove(&client_addr);
                break;
            }
        }
    }
}
