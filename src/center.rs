//! The shared service handle.
//!
//! The center owns every process-wide service: the settings, the
//! atomically swapped policy database, the caches, the meters and the
//! session registry.  Sessions and units hold it by `Arc` and go through
//! it for all cross-session state.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::comms::ApplicationCommand;
use crate::config::{Config, ConfigError};
use crate::dns::cache::{DnsCache, DomainTree};
use crate::policy::PolicyDb;
use crate::replace::Replacements;
use crate::session::SessionState;
use crate::tls::cache::{CertCache, TtlCache};
use crate::tls::{TlsContext, WhitelistKey};

//----------- OcspVerdict / CrlVerdict -----------------------------------------

/// A cached OCSP status for a certificate fingerprint.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OcspVerdict {
    Good,
    Revoked,
    Unknown,
}

/// A cached CRL status for a certificate fingerprint.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CrlVerdict {
    Ok,
    Revoked,
}

//----------- Meters -----------------------------------------------------------

/// Global traffic counters.
#[derive(Debug, Default)]
pub struct Meters {
    /// Sessions accepted since startup.
    pub sessions_total: AtomicU64,

    /// Bytes moved client-to-origin.
    pub bytes_up: AtomicU64,

    /// Bytes moved origin-to-client.
    pub bytes_down: AtomicU64,
}

//----------- SessionInfo ------------------------------------------------------

/// A registry snapshot of one live session.
#[derive(Clone, Debug)]
pub struct SessionInfo {
    pub id: u64,
    pub proto: u8,
    pub client: SocketAddr,
    pub destination: SocketAddr,
    pub state: SessionState,
    pub started_at: Instant,
}

//----------- Center -----------------------------------------------------------

/// The central service handle.
#[derive(Debug)]
pub struct Center {
    /// Runtime settings; replaced wholesale on reload.
    pub config: Mutex<Config>,

    /// The loaded policy database.  Reloads swap it atomically; running
    /// sessions keep the object handles they matched with.
    pub policy: ArcSwap<PolicyDb>,

    pub dns_cache: DnsCache,
    pub domain_tree: DomainTree,
    pub cert_cache: CertCache,
    pub ocsp_cache: TtlCache<String, OcspVerdict>,
    pub crl_cache: TtlCache<String, CrlVerdict>,
    pub whitelist: TtlCache<WhitelistKey, ()>,
    pub ticket_cache: TtlCache<String, Vec<u8>>,

    /// TLS interception state; absent when no signing CA is configured,
    /// in which case no flow can be inspected.
    pub tls: Option<TlsContext>,

    pub replacements: Replacements,
    pub meters: Meters,

    session_counter: AtomicU64,
    sessions: Mutex<foldhash::HashMap<u64, SessionInfo>>,

    /// A channel to send units commands.
    pub app_cmd_tx: mpsc::UnboundedSender<(String, ApplicationCommand)>,

    /// Set once shutdown begins; observed by all units.
    pub terminating: AtomicBool,
}

impl Center {
    pub fn new(
        config: Config,
        policy: PolicyDb,
        tls: Option<TlsContext>,
        app_cmd_tx: mpsc::UnboundedSender<(String, ApplicationCommand)>,
    ) -> Self {
        let caches = config.caches;
        let replacements = Replacements::load(&config.messages_dir);
        Self {
            config: Mutex::new(config),
            policy: ArcSwap::from_pointee(policy),
            dns_cache: DnsCache::new(caches.dns),
            domain_tree: DomainTree::default(),
            cert_cache: CertCache::new(caches.certs),
            ocsp_cache: TtlCache::new(caches.ocsp),
            crl_cache: TtlCache::new(caches.crl),
            whitelist: TtlCache::new(caches.whitelist),
            ticket_cache: TtlCache::new(caches.tickets),
            tls,
            replacements,
            meters: Meters::default(),
            session_counter: AtomicU64::new(0),
            sessions: Mutex::new(Default::default()),
            app_cmd_tx,
            terminating: AtomicBool::new(false),
        }
    }

    //--- Session registry

    pub fn next_session_id(&self) -> u64 {
        self.session_counter.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register_session(
        &self,
        id: u64,
        proto: u8,
        client: SocketAddr,
        destination: SocketAddr,
    ) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.insert(
            id,
            SessionInfo {
                id,
                proto,
                client,
                destination,
                state: SessionState::FreshAccept,
                started_at: Instant::now(),
            },
        );
    }

    pub fn update_session(&self, id: u64, state: SessionState) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(info) = sessions.get_mut(&id) {
            info.state = state;
        }
    }

    pub fn unregister_session(&self, id: u64) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.remove(&id);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn session_snapshot(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.lock().unwrap();
        let mut list: Vec<_> = sessions.values().cloned().collect();
        list.sort_by_key(|info| info.id);
        list
    }

    /// Mark every live session's grace period: shutdown drains by letting
    /// the registry empty out.
    pub fn begin_termination(&self) {
        self.terminating.store(true, Ordering::SeqCst);
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }
}

//--- Reload

/// Reload the configuration file, replacing the policy database
/// atomically.
///
/// A failed load leaves the running configuration untouched.
pub fn reload(center: &Arc<Center>) -> Result<(), ConfigError> {
    let path = {
        let config = center.config.lock().unwrap();
        config
            .path
            .clone()
            .ok_or_else(|| ConfigError::Io("no configuration file to reload".into()))?
    };

    match Config::load_from_file(&path) {
        Ok((new_config, new_db)) => {
            center.policy.store(Arc::new(new_db));
            *center.config.lock().unwrap() = new_config;
            info!("Reloaded configuration from '{path}'");

            let _ = center
                .app_cmd_tx
                .send(("*".into(), ApplicationCommand::PolicyReloaded));
            Ok(())
        }
        Err(err) => {
            error!("Reload failed, keeping the running configuration: {err}");
            Err(err)
        }
    }
}

/// How long a session has been alive, for diagnostics output.
pub fn session_age(info: &SessionInfo) -> Duration {
    info.started_at.elapsed()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A center around the given policy database and default settings.
    pub(crate) fn center_with(db: crate::policy::PolicyDb) -> Arc<Center> {
        let (app_cmd_tx, _app_cmd_rx) = mpsc::unbounded_channel();
        Arc::new(Center::new(Config::default(), db, None, app_cmd_tx))
    }
}
