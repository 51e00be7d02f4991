//! TCP listener task: accept a connection, balance to a backend, dial, and
//! splice the two sockets until either side closes.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::balancer::LoadBalancer;
use crate::proxier::io::copy_stream;

/// Runs the accept loop for one TCP service until `stop_rx` fires or the
/// listening socket itself errors out. No per-connection timeout is
/// imposed by this layer, matching spec §4.3.
pub async fn run(
    listener: TcpListener,
    service_id: String,
    balancer: Arc<LoadBalancer>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let service_id = service_id.clone();
                        let balancer = Arc::clone(&balancer);
                        tokio::spawn(async move {
                            handle_connection(stream, peer, &service_id, &balancer).await;
                        });
                    }
                    Err(e) => {
                        // Listener closure surfaces here as an accept error;
                        // treat any accept failure as a cue to exit rather
                        // than spin — the stop signal (or socket teardown)
                        // is the normal shutdown path.
                        debug!("tcp[{service_id}]: accept error, stopping: {e}");
                        break;
                    }
                }
            }
            _ = &mut stop_rx => {
                debug!("tcp[{service_id}]: stop signal received");
                break;
            }
        }
    }
}

async fn handle_connection(
    client: TcpStream,
    peer: std::net::SocketAddr,
    service_id: &str,
    balancer: &LoadBalancer,
) {
    let endpoint = match balancer.next_endpoint(service_id) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            debug!("tcp[{service_id}]: no endpoint for {peer}: {e}");
            return;
        }
    };

    let backend = match TcpStream::connect(&endpoint).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("tcp[{service_id}]: dial {endpoint} failed for {peer}: {e}");
            return;
        }
    };

    let _ = client.set_nodelay(true);
    let _ = backend.set_nodelay(true);

    proxy_bidirectional(client, backend, service_id, peer).await;
}

/// Splices `client` and `backend` with two concurrent copy tasks. Returns
/// once either direction finishes; the other direction's task keeps
/// running independently (already `tokio::spawn`ed) and is unblocked by the
/// peer's `shutdown()` call inside `copy_stream`, per spec §4.5.
async fn proxy_bidirectional(
    client: TcpStream,
    backend: TcpStream,
    service_id: &str,
    peer: std::net::SocketAddr,
) {
    let (client_read, client_write) = client.into_split();
    let (backend_read, backend_write) = backend.into_split();

    let client_to_backend = tokio::spawn(copy_stream(client_read, backend_write));
    let backend_to_client = tokio::spawn(copy_stream(backend_read, client_write));

    tokio::select! {
        result = client_to_backend => {
            log_copy_result(service_id, peer, "client->backend", result);
        }
        result = backend_to_client => {
            log_copy_result(service_id, peer, "backend->client", result);
        }
    }
}

fn log_copy_result(
    service_id: &str,
    peer: std::net::SocketAddr,
    direction: &str,
    result: Result<std::io::Result<u64>, tokio::task::JoinError>,
) {
    match result {
        Ok(Ok(bytes)) => debug!("tcp[{service_id}]: {peer} {direction} finished, {bytes} bytes"),
        Ok(Err(e)) => debug!("tcp[{service_id}]: {peer} {direction} error: {e}"),
        Err(e) => debug!("tcp[{service_id}]: {peer} {direction} task error: {e}"),
    }
}
