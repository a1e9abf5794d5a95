//! The stream and datagram acceptor units.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::center::Center;
use crate::comms::{ApplicationCommand, Terminated};
use crate::daemon::ListenSockets;
use crate::session::{DatagramSession, Session};

/// Per-client datagram queue depth before datagrams are dropped.
const DATAGRAM_QUEUE: usize = 64;

//----------- ListenerKind -----------------------------------------------------

/// What flavor of stream acceptor a unit runs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ListenerKind {
    /// Transparent plain-TCP interception.
    Plain,

    /// Transparent interception of TLS ports.
    Tls,

    /// REDIRECT-style interception.
    Redirect,
}

impl ListenerKind {
    fn name(&self) -> &'static str {
        match self {
            Self::Plain => "TCP",
            Self::Tls => "TLS",
            Self::Redirect => "RED",
        }
    }
}

//----------- StreamListenerUnit -----------------------------------------------

/// A TCP acceptor unit.
///
/// The accepted socket's local address is the flow's original destination:
/// transparent listeners receive pre-configured (IP_TRANSPARENT) sockets
/// through the listen-socket pool, where the kernel preserves the intended
/// destination on the accepted socket.
pub struct StreamListenerUnit {
    pub center: Arc<Center>,
    pub kind: ListenerKind,
    pub addr: SocketAddr,
    pub workers: u16,
}

impl StreamListenerUnit {
    pub async fn run(
        self,
        mut cmd_rx: mpsc::UnboundedReceiver<ApplicationCommand>,
        ready_tx: oneshot::Sender<()>,
        listen_sockets: Arc<Mutex<ListenSockets>>,
    ) -> Result<(), Terminated> {
        let name = self.kind.name();

        let listener = {
            let mut sockets = listen_sockets.lock().unwrap();
            sockets.claim_tcp(&self.addr)
        };
        let listener = match listener {
            Some(listener) => listener,
            None => TcpListener::bind(self.addr).await.map_err(|e| {
                error!("[{name}] cannot bind {}: {e}", self.addr);
                Terminated
            })?,
        };
        let listener = Arc::new(listener);
        info!("[{name}] listening on {}", self.addr);

        let mut accept_handles = Vec::new();
        for worker in 0..self.workers.max(1) {
            let listener = listener.clone();
            let center = self.center.clone();
            accept_handles.push(tokio::spawn(async move {
                loop {
                    let (stream, client) = match listener.accept().await {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!("[{name}:{worker}] accept failed: {err}");
                            continue;
                        }
                    };
                    if center.is_terminating() {
                        return;
                    }

                    let dst = match stream.local_addr() {
                        Ok(dst) => dst,
                        Err(err) => {
                            warn!("[{name}:{worker}] no local address: {err}");
                            continue;
                        }
                    };
                    debug!("[{name}:{worker}] accepted {client} -> {dst}");

                    let session = Session::new_tcp(center.clone(), stream, client, dst);
                    tokio::spawn(session.run());
                }
            }));
        }

        let _ = ready_tx.send(());

        loop {
            let Some(cmd) = cmd_rx.recv().await else {
                break;
            };
            debug!("[{name}] received command: {cmd}");
            if let ApplicationCommand::Terminate = cmd {
                break;
            }
        }

        for handle in accept_handles {
            handle.abort();
        }
        Err(Terminated)
    }
}

//----------- DatagramListenerUnit ---------------------------------------------

/// A UDP acceptor unit.
///
/// One listener socket serves many clients; datagrams are dispatched to a
/// per-client session through a bounded queue.  When the listener is bound
/// to a wildcard address the original destination cannot be recovered from
/// the socket, and flows are directed at the first configured nameserver
/// (the DNS ALG deployment).
pub struct DatagramListenerUnit {
    pub center: Arc<Center>,
    pub addr: SocketAddr,
}

impl DatagramListenerUnit {
    pub async fn run(
        self,
        mut cmd_rx: mpsc::UnboundedReceiver<ApplicationCommand>,
        ready_tx: oneshot::Sender<()>,
        listen_sockets: Arc<Mutex<ListenSockets>>,
    ) -> Result<(), Terminated> {
        let socket = {
            let mut sockets = listen_sockets.lock().unwrap();
            sockets.claim_udp(&self.addr)
        };
        let socket = match socket {
            Some(socket) => socket,
            None => UdpSocket::bind(self.addr).await.map_err(|e| {
                error!("[UDP] cannot bind {}: {e}", self.addr);
                Terminated
            })?,
        };
        let socket = Arc::new(socket);
        info!("[UDP] listening on {}", self.addr);

        let dst = self.flow_destination(&socket);

        let _ = ready_tx.send(());

        let mut peers: foldhash::HashMap<SocketAddr, mpsc::Sender<BytesMut>> = Default::default();
        let mut buf = BytesMut::with_capacity(64 * 1024);

        loop {
            tokio::select! {
                biased;

                cmd = cmd_rx.recv() => {
                    match cmd {
                        None | Some(ApplicationCommand::Terminate) => return Err(Terminated),
                        Some(cmd) => debug!("[UDP] received command: {cmd}"),
                    }
                }

                res = socket.recv_buf_from(&mut buf) => {
                    let (_, client) = match res {
                        Ok(received) => received,
                        Err(err) => {
                            warn!("[UDP] receive failed: {err}");
                            continue;
                        }
                    };
                    let datagram = buf.split();
                    if self.center.is_terminating() {
                        continue;
                    }

                    let stale = match peers.get(&client) {
                        Some(tx) => match tx.try_send(datagram.clone()) {
                            Ok(()) => false,
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                debug!("[UDP] queue full, dropping datagram from {client}");
                                false
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => true,
                        },
                        None => true,
                    };
                    if stale {
                        let (tx, rx) = mpsc::channel(DATAGRAM_QUEUE);
                        let session = DatagramSession::new(
                            self.center.clone(),
                            client,
                            dst,
                            socket.clone(),
                            rx,
                        );
                        tokio::spawn(session.run());
                        if tx.try_send(datagram).is_err() {
                            debug!("[UDP] dropping datagram from {client}");
                        }
                        peers.insert(client, tx);
                    }
                }
            }
        }
    }

    fn flow_destination(&self, socket: &UdpSocket) -> SocketAddr {
        let local = socket
            .local_addr()
            .unwrap_or(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
        if !local.ip().is_unspecified() {
            return local;
        }

        let config = self.center.config.lock().unwrap();
        match config.nameservers.first() {
            Some(ns) => SocketAddr::new(*ns, 53),
            None => local,
        }
    }
}
