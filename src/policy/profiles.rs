//! Profile parameter bundles referenced by policy rules.
//!
//! Profiles are immutable once loaded; reloads install a whole new policy
//! database and running sessions keep the `Arc` handles they matched with.

use std::collections::BTreeSet;
use std::time::Duration;

use camino::Utf8PathBuf;

//----------- ContentProfile ---------------------------------------------------

/// Payload capture and rewriting settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentProfile {
    /// The name of the profile.
    pub name: Box<str>,

    /// Whether the proxied payload is written to a capture file.
    pub write_payload: bool,

    /// The capture file format.
    pub write_format: CaptureFormat,

    /// Payload rewrite rules, applied in order.
    pub content_rules: Vec<ContentRule>,
}

/// A capture file format.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum CaptureFormat {
    /// Side-tagged text dumps, one file per session.
    #[default]
    Smcap,

    /// One pcap file per session.
    PcapSingle,

    /// A single shared pcap file.
    Pcap,
}

impl CaptureFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Smcap => "smcap",
            Self::PcapSingle => "pcap_single",
            Self::Pcap => "pcap",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "pcap" => Self::Pcap,
            "pcap_single" => Self::PcapSingle,
            _ => Self::Smcap,
        }
    }
}

/// A single payload rewrite rule.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContentRule {
    /// The literal to search for.
    pub matching: String,

    /// The replacement text.
    pub replace: String,

    /// Pad the replacement to the length of the match.
    pub fill_length: bool,

    /// Apply the replacement only to every n-th occurrence (0 = all).
    pub replace_each_nth: u32,
}

//----------- DetectionProfile -------------------------------------------------

/// Signature detection settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DetectionProfile {
    /// The name of the profile.
    pub name: Box<str>,

    /// When payload is fed to the signature engine.
    pub mode: DetectionMode,
}

/// When flow data is handed to the signature engine.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum DetectionMode {
    /// No signature scanning.
    None,

    /// Scan after the transport has consumed the data.  Works everywhere,
    /// but an upgraded transport may already have eaten bytes.
    Post,

    /// Scan on peeked data before the transport consumes it.
    #[default]
    Pre,
}

//----------- TlsProfile -------------------------------------------------------

/// TLS interception settings for one side of the rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsProfile {
    /// The name of the profile.
    pub name: Box<str>,

    /// Whether TLS flows are terminated and re-originated at all.
    pub inspect: bool,

    /// Accept origin chains whose issuer is not in the trust store.
    pub allow_untrusted_issuers: bool,

    /// Accept origin certificates that fail validity checks.
    pub allow_invalid_certs: bool,

    /// Accept self-signed origin certificates.
    pub allow_self_signed: bool,

    /// On a failed certificate check, spoof anyway and serve a
    /// human-readable warning page instead of resetting the connection.
    pub failed_certcheck_replacement: bool,

    /// The warning page offers a temporary per-source-IP override.
    pub failed_certcheck_override: bool,

    /// How long an override entry lives.
    pub failed_certcheck_override_timeout: Duration,

    /// How the override timeout is interpreted.
    pub override_timeout_type: OverrideTimeoutType,

    /// Prefer forward-secret key exchange (general switch; the per-side
    /// switches take precedence).
    pub use_pfs: bool,
    pub left_use_pfs: bool,
    pub right_use_pfs: bool,

    /// Disable TLS session resumption per side.
    pub left_disable_reuse: bool,
    pub right_disable_reuse: bool,

    /// Which certificates of the origin chain get an OCSP status check.
    pub ocsp_mode: OcspMode,

    /// Request stapled OCSP responses from the origin.
    pub ocsp_stapling: bool,

    /// How a missing or bad staple is treated.
    pub ocsp_stapling_mode: OcspStaplingMode,

    /// SNI names excluded from interception; matching flows are spliced
    /// without TLS termination.
    pub sni_filter_bypass: Vec<String>,

    /// Also bypass when the destination IP is a cached resolution of a
    /// bypass entry.
    pub sni_filter_use_dns_cache: bool,

    /// Additionally expand bypass entries through the observed subdomain
    /// tree before the reverse IP match.
    pub sni_filter_use_dns_domain_tree: bool,

    /// Ports on which a replacement warning page may be served.
    pub redirect_warning_ports: BTreeSet<u16>,

    /// Emit per-session TLS secrets in NSS key log format.
    pub sslkeylog: bool,
}

impl Default for TlsProfile {
    fn default() -> Self {
        Self {
            name: Box::from(""),
            inspect: false,
            allow_untrusted_issuers: false,
            allow_invalid_certs: false,
            allow_self_signed: false,
            failed_certcheck_replacement: true,
            failed_certcheck_override: false,
            failed_certcheck_override_timeout: Duration::from_secs(600),
            override_timeout_type: OverrideTimeoutType::Absolute,
            use_pfs: true,
            left_use_pfs: true,
            right_use_pfs: true,
            left_disable_reuse: false,
            right_disable_reuse: false,
            ocsp_mode: OcspMode::Off,
            ocsp_stapling: false,
            ocsp_stapling_mode: OcspStaplingMode::Loose,
            sni_filter_bypass: Vec::new(),
            sni_filter_use_dns_cache: true,
            sni_filter_use_dns_domain_tree: true,
            redirect_warning_ports: BTreeSet::new(),
            sslkeylog: false,
        }
    }
}

/// How a certificate-check override entry expires.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum OverrideTimeoutType {
    /// Expire a fixed time after creation.
    #[default]
    Absolute,

    /// Refresh the timeout on every matching connection.
    Idle,
}

/// Which certificates of the origin chain are OCSP-checked.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum OcspMode {
    #[default]
    Off,
    Leaf,
    FullChain,
}

/// How strictly stapled OCSP responses are required.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum OcspStaplingMode {
    /// A missing staple is ignored.
    #[default]
    Loose,

    /// A present-but-bad staple fails the check.
    Strict,

    /// A staple must be present and good.
    Require,
}

//----------- AuthProfile ------------------------------------------------------

/// Authentication requirements for matched flows.
///
/// The identity tables themselves are populated by an external portal; the
/// core only consults them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuthProfile {
    /// The name of the profile.
    pub name: Box<str>,

    /// Require an authenticated source IP.
    pub authenticate: bool,

    /// Resolve traffic to an identity by source IP.
    pub resolve: bool,
}

//----------- AlgDnsProfile ----------------------------------------------------

/// DNS application-level gateway settings.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AlgDnsProfile {
    /// The name of the profile.
    pub name: Box<str>,

    /// Tear down flows whose response id does not match a pending request.
    pub match_request_id: bool,

    /// Rewrite the transaction id toward the server and restore it on the
    /// way back.
    pub randomize_id: bool,

    /// Serve fresh cached answers directly, closing the origin side.
    pub cached_responses: bool,
}

//----------- ScriptProfile ----------------------------------------------------

/// A script hook attached to matched flows.
///
/// Script execution lives outside the core; the profile is carried through
/// configuration for the executor to pick up.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScriptProfile {
    /// The name of the profile.
    pub name: Box<str>,

    /// Path of the script module.
    pub module_path: Utf8PathBuf,

    /// The script runtime.
    pub script_type: ScriptType,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ScriptType {
    #[default]
    Python,
    Golang,
}

//----------- RoutingProfile ---------------------------------------------------

/// Destination NAT settings for matched flows.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoutingProfile {
    /// The name of the profile.
    pub name: Box<str>,

    /// Replacement destination addresses (CIDR or FQDN strings).
    pub dnat_addresses: Vec<String>,

    /// Replacement destination ports.
    pub dnat_ports: Vec<String>,

    /// How a destination is picked from the candidates.
    pub dnat_lb_method: LbMethod,
}

/// Load balancing method over DNAT candidates.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum LbMethod {
    /// Rotate through candidates.
    #[default]
    RoundRobin,

    /// Hash the source address.
    L3,

    /// Hash the source address and port.
    L4,
}
