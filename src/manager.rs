//! Controlling the entire operation.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::debug;

use crate::center::Center;
use crate::comms::{ApplicationCommand, Terminated};
use crate::daemon::ListenSockets;
use crate::units::control::ControlUnit;
use crate::units::listener::{DatagramListenerUnit, ListenerKind, StreamListenerUnit};
use crate::units::socks_listener::SocksListenerUnit;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    Terminated,
}

impl From<Terminated> for Error {
    fn from(_: Terminated) -> Self {
        Error::Terminated
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Terminated => Terminated.fmt(f),
        }
    }
}

fn any_addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
}

/// Spawn all units.
pub async fn spawn(
    center: &Arc<Center>,
    unit_tx_slots: &mut foldhash::HashMap<String, mpsc::UnboundedSender<ApplicationCommand>>,
    listen_sockets: ListenSockets,
) -> Result<(), Error> {
    let listen_sockets = Arc::new(Mutex::new(listen_sockets));

    let listeners = {
        let config = center.config.lock().unwrap();
        config.listeners.clone()
    };
    let control_port = {
        let config = center.config.lock().unwrap();
        config.control.port
    };

    // Collate oneshot unit ready signal receivers by unit name.
    let mut unit_ready_rxs = vec![];

    if listeners.dtls.enabled() {
        // rustls offers no DTLS; the setting round-trips but cannot start.
        tracing::warn!("DTLS listener configured but not supported, ignoring");
    }

    if listeners.tcp.enabled() {
        tracing::info!("Starting unit 'TCP'");
        let unit = StreamListenerUnit {
            center: center.clone(),
            kind: ListenerKind::Plain,
            addr: any_addr(listeners.tcp.port),
            workers: listeners.tcp.workers,
        };
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        unit_ready_rxs.push(ready_rx);
        tokio::spawn(unit.run(cmd_rx, ready_tx, listen_sockets.clone()));
        unit_tx_slots.insert("TCP".into(), cmd_tx);
    }

    if listeners.tls.enabled() {
        tracing::info!("Starting unit 'TLS'");
        let unit = StreamListenerUnit {
            center: center.clone(),
            kind: ListenerKind::Tls,
            addr: any_addr(listeners.tls.port),
            workers: listeners.tls.workers,
        };
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        unit_ready_rxs.push(ready_rx);
        tokio::spawn(unit.run(cmd_rx, ready_tx, listen_sockets.clone()));
        unit_tx_slots.insert("TLS".into(), cmd_tx);
    }

    if listeners.redirect.enabled() {
        tracing::info!("Starting unit 'RED'");
        let unit = StreamListenerUnit {
            center: center.clone(),
            kind: ListenerKind::Redirect,
            addr: any_addr(listeners.redirect.port),
            workers: listeners.redirect.workers,
        };
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        unit_ready_rxs.push(ready_rx);
        tokio::spawn(unit.run(cmd_rx, ready_tx, listen_sockets.clone()));
        unit_tx_slots.insert("RED".into(), cmd_tx);
    }

    if listeners.udp.enabled() {
        tracing::info!("Starting unit 'UDP'");
        let unit = DatagramListenerUnit {
            center: center.clone(),
            addr: any_addr(listeners.udp.port),
        };
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        unit_ready_rxs.push(ready_rx);
        tokio::spawn(unit.run(cmd_rx, ready_tx, listen_sockets.clone()));
        unit_tx_slots.insert("UDP".into(), cmd_tx);
    }

    if listeners.socks.enabled() {
        tracing::info!("Starting unit 'SOCKS'");
        let unit = SocksListenerUnit {
            center: center.clone(),
            addr: any_addr(listeners.socks.port),
            workers: listeners.socks.workers,
        };
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        unit_ready_rxs.push(ready_rx);
        tokio::spawn(unit.run(cmd_rx, ready_tx, listen_sockets.clone()));
        unit_tx_slots.insert("SOCKS".into(), cmd_tx);
    }

    if control_port != 0 {
        tracing::info!("Starting unit 'CP'");
        let unit = ControlUnit {
            center: center.clone(),
            port: control_port,
        };
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        unit_ready_rxs.push(ready_rx);
        tokio::spawn(unit.run(cmd_rx, ready_tx, listen_sockets.clone()));
        unit_tx_slots.insert("CP".into(), cmd_tx);
    }

    // Wait for the units above to be ready so all pre-bound sockets have
    // been claimed.
    join_all(unit_ready_rxs).await;

    tracing::info!("All units report ready.");

    Ok(())
}

/// Forward application commands.
///
/// A unit name of "*" broadcasts to every unit.
pub async fn forward_app_cmds(
    rx: &mut mpsc::UnboundedReceiver<(String, ApplicationCommand)>,
    unit_txs: &foldhash::HashMap<String, mpsc::UnboundedSender<ApplicationCommand>>,
) {
    while let Some((unit_name, data)) = rx.recv().await {
        if unit_name == "*" {
            for (name, tx) in unit_txs {
                debug!("Forwarding application command to unit '{name}'");
                let _ = tx.send(data.clone());
            }
        } else if let Some(tx) = unit_txs.get(&unit_name) {
            debug!("Forwarding application command to unit '{unit_name}'");
            let _ = tx.send(data);
        } else {
            debug!("Unrecognized unit: {unit_name}");
        }
    }
}

/// Tell every unit to stop.
pub fn terminate_all(
    unit_txs: &foldhash::HashMap<String, mpsc::UnboundedSender<ApplicationCommand>>,
) {
    for (name, tx) in unit_txs {
        debug!("Terminating unit '{name}'");
        let _ = tx.send(ApplicationCommand::Terminate);
    }
}
