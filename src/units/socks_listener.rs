//! The SOCKS acceptor unit.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::center::Center;
use crate::comms::{ApplicationCommand, Terminated};
use crate::daemon::ListenSockets;
use crate::socks::SocksAcceptor;

//----------- SocksListenerUnit ------------------------------------------------

pub struct SocksListenerUnit {
    pub center: Arc<Center>,
    pub addr: SocketAddr,
    pub workers: u16,
}

impl SocksListenerUnit {
    pub async fn run(
        self,
        mut cmd_rx: mpsc::UnboundedReceiver<ApplicationCommand>,
        ready_tx: oneshot::Sender<()>,
        listen_sockets: Arc<Mutex<ListenSockets>>,
    ) -> Result<(), Terminated> {
        let listener = {
            let mut sockets = listen_sockets.lock().unwrap();
            sockets.claim_tcp(&self.addr)
        };
        let listener = match listener {
            Some(listener) => listener,
            None => TcpListener::bind(self.addr).await.map_err(|e| {
                error!("[SOCKS] cannot bind {}: {e}", self.addr);
                Terminated
            })?,
        };
        let listener = Arc::new(listener);
        info!("[SOCKS] listening on {}", self.addr);

        let mut accept_handles = Vec::new();
        for worker in 0..self.workers.max(1) {
            let listener = listener.clone();
            let center = self.center.clone();
            accept_handles.push(tokio::spawn(async move {
                loop {
                    let (stream, client) = match listener.accept().await {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!("[SOCKS:{worker}] accept failed: {err}");
                            continue;
                        }
                    };
                    if center.is_terminating() {
                        return;
                    }

                    debug!("[SOCKS:{worker}] accepted {client}");
                    let acceptor = SocksAcceptor::new(center.clone());
                    tokio::spawn(acceptor.run(stream, client));
                }
            }));
        }

        let _ = ready_tx.send(());

        loop {
            let Some(cmd) = cmd_rx.recv().await else {
                break;
            };
            debug!("[SOCKS] received command: {cmd}");
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
