//! The control-plane unit.
//!
//! A small HTTP/JSON surface for the external management CLI: atomic
//! snapshot readers for the policy and the session registry, the reload
//! entry point, cache statistics and a Prometheus metrics endpoint.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::api::{
    CacheStatsResult, PolicyListResult, PolicyReloadResult, PolicyRuleEntry, ServerStatusResult,
    SessionEntry, SessionsListResult,
};
use crate::center::{self, Center};
use crate::comms::{ApplicationCommand, Terminated};
use crate::daemon::ListenSockets;
use crate::metrics::MetricsCollection;

const CONTROL_UNIT_NAME: &str = "CP";

//----------- ControlUnit ------------------------------------------------------

pub struct ControlUnit {
    pub center: Arc<Center>,
    pub port: u16,
}

struct ControlState {
    center: Arc<Center>,
    metrics: MetricsCollection,
}

impl ControlUnit {
    pub async fn run(
        self,
        mut cmd_rx: mpsc::UnboundedReceiver<ApplicationCommand>,
        ready_tx: oneshot::Sender<()>,
        listen_sockets: Arc<Mutex<ListenSockets>>,
    ) -> Result<(), Terminated> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.port);

        let listener = {
            let mut sockets = listen_sockets.lock().unwrap();
            sockets.claim_tcp(&addr)
        };
        let listener = match listener {
            Some(listener) => listener,
            None => TcpListener::bind(addr).await.map_err(|e| {
                error!("[{CONTROL_UNIT_NAME}] cannot bind {addr}: {e}");
                Terminated
            })?,
        };
        info!("[{CONTROL_UNIT_NAME}] listening on {addr}");

        tokio::task::spawn(async move {
            loop {
                let cmd = cmd_rx.recv().await;
                let Some(cmd) = cmd else {
                    return Result::<(), Terminated>::Err(Terminated);
                };
                debug!("[{CONTROL_UNIT_NAME}] received command: {cmd}");
                if let ApplicationCommand::Terminate = cmd {
                    return Err(Terminated);
                }
            }
        });

        let state = Arc::new(ControlState {
            center: self.center,
            metrics: MetricsCollection::new(),
        });

        let app = Router::new()
            .route("/status", get(Self::status))
            .route("/sessions/list", get(Self::sessions_list))
            .route("/policy/list", get(Self::policy_list))
            .route("/policy/reload", post(Self::policy_reload))
            .route("/caches", get(Self::caches))
            .route("/metrics", get(Self::metrics))
            .with_state(state);

        let _ = ready_tx.send(());

        axum::serve(listener, app).await.map_err(|e| {
            error!("[{CONTROL_UNIT_NAME}]: {e}");
            Terminated
        })?;
        Err(Terminated)
    }

    async fn status(State(state): State<Arc<ControlState>>) -> Json<ServerStatusResult> {
        let center = &state.center;
        Json(ServerStatusResult {
            version: clap::crate_version!().to_string(),
            sessions_active: center.session_count(),
            sessions_total: center.meters.sessions_total.load(Ordering::Relaxed),
            bytes_up: center.meters.bytes_up.load(Ordering::Relaxed),
            bytes_down: center.meters.bytes_down.load(Ordering::Relaxed),
        })
    }

    async fn sessions_list(State(state): State<Arc<ControlState>>) -> Json<SessionsListResult> {
        let sessions = state
            .center
            .session_snapshot()
            .into_iter()
            .map(|info| SessionEntry {
                id: info.id,
                proto: info.proto,
                client: info.client,
                destination: info.destination,
                state: info.state.to_string(),
                age_secs: center::session_age(&info).as_secs(),
            })
            .collect();
        Json(SessionsListResult { sessions })
    }

    async fn policy_list(State(state): State<Arc<ControlState>>) -> Json<PolicyListResult> {
        let db = state.center.policy.load();
        let rules = db
            .rules
            .iter()
            .enumerate()
            .map(|(index, rule)| PolicyRuleEntry {
                index,
                rule: rule.to_string(),
                matches: rule.cnt_matches.load(Ordering::Relaxed),
            })
            .collect();
        Json(PolicyListResult { rules })
    }

    async fn policy_reload(State(state): State<Arc<ControlState>>) -> Json<PolicyReloadResult> {
        match center::reload(&state.center) {
            Ok(()) => Json(PolicyReloadResult {
                ok: true,
                error: None,
            }),
            Err(err) => Json(PolicyReloadResult {
                ok: false,
                error: Some(err.to_string()),
            }),
        }
    }

    async fn caches(State(state): State<Arc<ControlState>>) -> Json<CacheStatsResult> {
        let center = &state.center;
        Json(CacheStatsResult {
            dns_entries: center.dns_cache.len(),
            domain_tree_entries: center.domain_tree.len(),
            spoofed_certs: center.cert_cache.len(),
            ocsp_entries: center.ocsp_cache.len(),
            crl_entries: center.crl_cache.len(),
            whitelist_entries: center.whitelist.len(),
            ticket_entries: center.ticket_cache.len(),
        })
    }

    async fn metrics(State(state): State<Arc<ControlState>>) -> String {
        state
            .metrics
            .assemble(&state.center)
            .unwrap_or_else(|e| format!("# metrics assembly failed: {e}\n"))
    }
}
