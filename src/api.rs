//! Control-plane request and response types.
//!
//! The management CLI is an external collaborator; these are the types it
//! exchanges with the control unit over HTTP/JSON.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

//----------- Status -----------------------------------------------------------

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ServerStatusResult {
    pub version: String,
    pub sessions_active: usize,
    pub sessions_total: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

//----------- Sessions ---------------------------------------------------------

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SessionEntry {
    pub id: u64,
    pub proto: u8,
    pub client: SocketAddr,
    pub destination: SocketAddr,
    pub state: String,
    pub age_secs: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SessionsListResult {
    pub sessions: Vec<SessionEntry>,
}

//----------- Policy -----------------------------------------------------------

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PolicyRuleEntry {
    /// Position in the ordered rule list.
    pub index: usize,

    /// Human-readable rendering of the rule.
    pub rule: String,

    /// How often the rule has been the first match.
    pub matches: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PolicyListResult {
    pub rules: Vec<PolicyRuleEntry>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PolicyReloadResult {
    pub ok: bool,
    pub error: Option<String>,
}

//----------- Caches -----------------------------------------------------------

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CacheStatsResult {
    pub dns_entries: usize,
    pub domain_tree_entries: usize,
    pub spoofed_certs: usize,
    pub ocsp_entries: usize,
    pub crl_entries: usize,
    pub whitelist_entries: usize,
    pub ticket_entries: usize,
}
