//! UDP session relay
//!
//! One inbound socket receives datagrams from every client. Each new client
//! endpoint gets its own upstream socket connected to the target, so backend
//! replies can be told apart and sent back to the right client from the
//! inbound socket. A per-client reverse task pumps those replies until the
//! connection is closed.

use crate::config::ProxyConfig;
use crate::error::RelayError;
use crate::lifecycle::TrafficSignal;
use crate::monitor::ActivitySource;
use crate::table::{ConnectionEntry, ConnectionTable};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Upstream half of a relayed connection
#[derive(Debug)]
pub struct Upstream {
    socket: Arc<UdpSocket>,
    close_tx: watch::Sender<bool>,
    close_rx: watch::Receiver<bool>,
}

impl Upstream {
    /// Open a socket connected to `target`.
    ///
    /// Runs synchronously so it can be called under the connection table lock.
    fn dial(target: SocketAddr) -> std::io::Result<Self> {
        let local: SocketAddr = if target.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };

        let std_socket = std::net::UdpSocket::bind(local)?;
        std_socket.connect(target)?;
        std_socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(std_socket)?;

        let (close_tx, close_rx) = watch::channel(false);
        Ok(Self {
            socket: Arc::new(socket),
            close_tx,
            close_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Stop the reverse task; the socket closes once it exits
    pub fn close(&self) {
        let _ = self.close_tx.send(true);
    }

}

type Entry = Arc<ConnectionEntry<Upstream>>;

/// Datagram relay between clients and a single backend address
pub struct UdpRelay {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    target: SocketAddr,
    target_address: String,
    buffer_size: usize,
    connection_timeout: Duration,
    table: ConnectionTable<Upstream>,
    traffic_signal: Option<TrafficSignal>,
}

impl UdpRelay {
    /// Resolve the target and bind the inbound socket
    pub async fn bind(
        config: &ProxyConfig,
        traffic_signal: Option<TrafficSignal>,
    ) -> Result<Arc<Self>, RelayError> {
        let target_address = config
            .target_address
            .clone()
            .ok_or(RelayError::MissingTarget)?;

        let target = tokio::net::lookup_host(&target_address)
            .await
            .map_err(|source| RelayError::Resolve {
                target: target_address.clone(),
                source,
            })?
            .next()
            .ok_or_else(|| RelayError::NoAddress {
                target: target_address.clone(),
            })?;

        let listen = config.listen_address();
        let socket = UdpSocket::bind(&listen)
            .await
            .map_err(|e| RelayError::bind(listen.clone(), e))?;
        let local_addr = socket.local_addr().map_err(RelayError::LocalAddr)?;

        info!(
            listen = %local_addr,
            target = %target_address,
            resolved = %target,
            buffer_size = config.buffer_size,
            "UDP relay listening"
        );

        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            local_addr,
            target,
            target_address,
            buffer_size: config.buffer_size,
            connection_timeout: config.connection_timeout(),
            table: ConnectionTable::new(),
            traffic_signal,
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Actual port of the inbound socket, useful when bound to port 0
    pub fn listening_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Target as configured
    pub fn target_address(&self) -> &str {
        &self.target_address
    }

    /// Target as resolved at startup
    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn connection_count(&self) -> usize {
        self.table.len()
    }

    pub fn clients(&self) -> Vec<SocketAddr> {
        self.table.clients()
    }

    /// Receive and forward client datagrams until shutdown
    pub async fn run(self: &Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut buf = vec![0u8; self.buffer_size];

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, client)) => self.forward(&buf[..len], client).await,
                        Err(e) => debug!(error = %e, "Failed to receive datagram"),
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("UDP relay shutting down");
                        break;
                    }
                }
            }
        }

        self.close_all();
    }

    async fn forward(self: &Arc<Self>, payload: &[u8], client: SocketAddr) {
        let target = self.target;
        let (entry, created) = match self
            .table
            .get_or_try_insert_with(client, || Upstream::dial(target))
        {
            Ok(found) => found,
            Err(e) => {
                warn!(client = %client, target = %target, error = %e, "Failed to open upstream socket, dropping datagram");
                return;
            }
        };

        if created {
            debug!(
                client = %client,
                connections = self.table.len(),
                "New client connection"
            );
            self.spawn_reverse(Arc::clone(&entry));
        }

        entry.touch();
        trace!(client = %client, len = payload.len(), "Client -> target");
        if let Err(e) = entry.handle().socket.send(payload).await {
            debug!(client = %client, error = %e, "Failed to forward datagram to target");
            // Never relayed: forget it so the next datagram counts as new again
            if created {
                self.table.remove(&client);
                entry.handle().close();
            }
            return;
        }

        if created {
            if let Some(signal) = &self.traffic_signal {
                signal.notify();
            }
        }
    }

    fn spawn_reverse(&self, entry: Entry) {
        let inbound = Arc::clone(&self.socket);
        let upstream = Arc::clone(&entry.handle().socket);
        let mut closed = entry.handle().close_rx.clone();
        let buffer_size = self.buffer_size;

        tokio::spawn(async move {
            let client = entry.client();
            let mut buf = vec![0u8; buffer_size];

            loop {
                tokio::select! {
                    result = upstream.recv(&mut buf) => {
                        match result {
                            Ok(len) => {
                                entry.touch();
                                trace!(client = %client, len, "Target -> client");
                                if let Err(e) = inbound.send_to(&buf[..len], client).await {
                                    debug!(client = %client, error = %e, "Failed to send reply to client");
                                }
                            }
                            // Connected UDP reports ICMP errors here; the backend may come back
                            Err(e) => debug!(client = %client, error = %e, "Upstream receive failed"),
                        }
                    }
                    _ = closed.changed() => break,
                }
            }

            debug!(client = %client, "Reverse path closed");
        });
    }

    /// Close every connection idle for longer than the connection timeout
    pub fn prune_idle(&self) -> usize {
        let removed = self.table.sweep(self.connection_timeout);
        for entry in &removed {
            entry.handle().close();
            debug!(
                client = %entry.client(),
                idle_secs = self.connection_timeout.as_secs_f64(),
                "Client connection timed out"
            );
        }
        removed.len()
    }

    /// Close every connection
    pub fn close_all(&self) {
        let removed = self.table.drain();
        for entry in &removed {
            entry.handle().close();
        }
        if !removed.is_empty() {
            debug!(connections = removed.len(), "Closed all client connections");
        }
    }
}

impl ActivitySource for UdpRelay {
    fn prune_idle(&self) -> usize {
        UdpRelay::prune_idle(self)
    }

    fn active_connections(&self) -> usize {
        self.connection_count()
    }
}
