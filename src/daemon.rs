//! Daemon plumbing: privilege handling and listener sockets.
//!
//! Interpose may start as root to claim privileged ports and then drop to
//! a configured identity.  Listener sockets come from two places: file
//! descriptors handed over by the service manager (systemd socket units,
//! which is also how transparent sockets arrive with IP_TRANSPARENT
//! already set), and plain binds done by the process itself.
//! [`ListenSockets`] merges both, so a unit can claim its listener without
//! caring where it came from.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;

use daemonbase::process::{EnvSockets, EnvSocketsError, Process};
use tracing::{debug, warn};

use crate::config::{DaemonConfig, GroupId, UserId};

//----------- daemonize --------------------------------------------------------

/// Detach and drop privileges per the daemon configuration.
///
/// Must run after every listener has been bound: the configured identity
/// usually cannot bind privileged ports.
pub fn daemonize(config: &DaemonConfig) -> Result<(), String> {
    let mut settings = daemonbase::process::Config::default();

    if let Some((UserId::Named(user), GroupId::Named(group))) = &config.identity {
        settings = settings
            .with_user(user)
            .map_err(|err| format!("unusable user '{user}': {err}"))?
            .with_group(group)
            .map_err(|err| format!("unusable group '{group}': {err}"))?;
    }
    if let Some(pid_file) = &config.pid_file {
        settings = settings.with_pid_file(daemonbase::config::ConfigPath::from(
            pid_file.clone().into_std_path_buf(),
        ));
    }

    let mut process = Process::from_config(settings);

    if config.daemonize {
        debug!("detaching into the background");
        process
            .setup_daemon(true)
            .map_err(|_| "could not detach into the background".to_string())?;
    }
    if let Some((user, group)) = &config.identity {
        debug!("dropping privileges to {user}:{group}");
        process
            .drop_privileges()
            .map_err(|_| format!("could not drop privileges to {user}:{group}"))?;
    }

    Ok(())
}

//----------- BindError --------------------------------------------------------

/// A listener could not be bound.  Fatal at startup.
#[derive(Debug)]
pub struct BindError {
    proto: &'static str,
    addr: SocketAddr,
    source: io::Error,
}

impl fmt::Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot bind {} listener on {}: {}",
            self.proto, self.addr, self.source
        )
    }
}

impl std::error::Error for BindError {}

//----------- ListenSockets ----------------------------------------------------

/// The pool of pre-bound listener sockets.
///
/// Sockets inherited from the environment take precedence over own binds:
/// [`ListenSockets::ensure_tcp`] does nothing for an address the service
/// manager already covers, and the `claim` calls look at the inherited set
/// first.  Sockets needing special options must arrive pre-configured
/// through the environment; own binds carry none.
#[derive(Debug, Default)]
pub struct ListenSockets {
    inherited: EnvSockets,
    tcp: BTreeMap<SocketAddr, std::net::TcpListener>,
    udp: BTreeMap<SocketAddr, std::net::UdpSocket>,
}

impl ListenSockets {
    /// Collect the sockets handed over by the service manager.
    ///
    /// LISTEN_PID and LISTEN_FDS are interpreted per `sd_listen_fds()`;
    /// only AF_INET TCP and UDP sockets whose address can be determined
    /// are kept, anything else is left alone.
    pub fn gather(max_env_fds: Option<usize>) -> Self {
        let mut sockets = Self::default();
        match sockets.inherited.init_from_env(max_env_fds) {
            Ok(())
            | Err(EnvSocketsError::AlreadyInitialized)
            | Err(EnvSocketsError::NotForUs)
            | Err(EnvSocketsError::NotAvailable) => {}
            Err(EnvSocketsError::Malformed) => {
                warn!("LISTEN_PID/LISTEN_FDS are malformed, ignoring them");
            }
            Err(EnvSocketsError::Unusable) => {
                warn!("ignoring unusable sockets passed via LISTEN_FDS");
            }
        }
        sockets
    }

    /// Bind a TCP listener unless one for this address was inherited or
    /// bound already.
    pub fn ensure_tcp(&mut self, addr: SocketAddr) -> Result<(), BindError> {
        if self.inherited.has_tcp(&addr) || self.tcp.contains_key(&addr) {
            return Ok(());
        }
        let listener = std::net::TcpListener::bind(addr).map_err(|source| BindError {
            proto: "TCP",
            addr,
            source,
        })?;
        self.tcp.insert(addr, listener);
        Ok(())
    }

    /// Bind a UDP socket unless one for this address was inherited or
    /// bound already.
    pub fn ensure_udp(&mut self, addr: SocketAddr) -> Result<(), BindError> {
        if self.inherited.has_udp(&addr) || self.udp.contains_key(&addr) {
            return Ok(());
        }
        let socket = std::net::UdpSocket::bind(addr).map_err(|source| BindError {
            proto: "UDP",
            addr,
            source,
        })?;
        self.udp.insert(addr, socket);
        Ok(())
    }

    /// Hand out the TCP listener for `addr`, inherited or own.
    ///
    /// Each address can be claimed once.  The socket is switched to
    /// non-blocking before it is wrapped for tokio; a socket that refuses
    /// is discarded.
    pub fn claim_tcp(&mut self, addr: &SocketAddr) -> Option<tokio::net::TcpListener> {
        let listener = self
            .inherited
            .take_tcp(addr)
            .or_else(|| self.tcp.remove(addr))?;
        if let Err(err) = listener.set_nonblocking(true) {
            debug!("discarding TCP listener {addr}: {err}");
            return None;
        }
        match tokio::net::TcpListener::from_std(listener) {
            Ok(listener) => Some(listener),
            Err(err) => {
                debug!("discarding TCP listener {addr}: {err}");
                None
            }
        }
    }

    /// Hand out the UDP socket for `addr`, inherited or own.
    pub fn claim_udp(&mut self, addr: &SocketAddr) -> Option<tokio::net::UdpSocket> {
        let socket = self
            .inherited
            .take_udp(addr)
            .or_else(|| self.udp.remove(addr))?;
        if let Err(err) = socket.set_nonblocking(true) {
            debug!("discarding UDP socket {addr}: {err}");
            return None;
        }
        match tokio::net::UdpSocket::from_std(socket) {
            Ok(socket) => Some(socket),
            Err(err) => {
                debug!("discarding UDP socket {addr}: {err}");
                None
            }
        }
    }
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[tokio::test]
    async fn own_binds_are_claimed_once() {
        let mut sockets = ListenSockets::default();
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        sockets.ensure_tcp(addr).unwrap();

        assert!(sockets.claim_tcp(&addr).is_some());
        assert!(sockets.claim_tcp(&addr).is_none());
    }

    #[test]
    fn ensure_is_idempotent() {
        let mut sockets = ListenSockets::default();
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        sockets.ensure_udp(addr).unwrap();
        sockets.ensure_udp(addr).unwrap();
        assert_eq!(sockets.udp.len(), 1);
    }
}
