//! TLS interception.
//!
//! An inspected TLS session runs two engines: a server role toward the
//! client presenting a dynamically synthesized leaf, and a client role
//! toward the origin.  The origin chain is captured during the upstream
//! handshake; verification failures are recorded rather than fatal so the
//! per-profile resolution (accept, warning page, reset) can be applied
//! afterwards.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{Resumption, WebPkiServerVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::NoServerSessionStorage;
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, KeyLog, RootCertStore, ServerConfig};
use tracing::{debug, warn};

use crate::dns::cache::{DnsCache, DomainTree};
use crate::policy::profiles::{OverrideTimeoutType, TlsProfile};
use crate::tls::cache::{CertCache, SpoofedCert, TtlCache};

pub mod cache;
pub mod sni;

/// Destination ports that get a TLS-capable transport by default.
pub const TLS_PORTS: [u16; 5] = [443, 465, 636, 993, 995];

pub fn is_tls_port(port: u16) -> bool {
    TLS_PORTS.contains(&port)
}

//----------- TlsError ---------------------------------------------------------

#[derive(Debug)]
pub enum TlsError {
    /// The signing CA could not be loaded.
    Ca(String),

    /// The origin certificate could not be parsed.
    Origin(String),

    /// Leaf synthesis failed.
    Spoof(rcgen::Error),

    /// A rustls configuration could not be built.
    Config(rustls::Error),
}

impl fmt::Display for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ca(reason) => write!(f, "signing CA unavailable: {reason}"),
            Self::Origin(reason) => write!(f, "cannot parse origin certificate: {reason}"),
            Self::Spoof(err) => write!(f, "cannot synthesize certificate: {err}"),
            Self::Config(err) => write!(f, "cannot build TLS configuration: {err}"),
        }
    }
}

impl std::error::Error for TlsError {}

impl From<rcgen::Error> for TlsError {
    fn from(err: rcgen::Error) -> Self {
        Self::Spoof(err)
    }
}

impl From<rustls::Error> for TlsError {
    fn from(err: rustls::Error) -> Self {
        Self::Config(err)
    }
}

//----------- SigningCa --------------------------------------------------------

/// The configured signing CA, loaded once at startup.
///
/// Failure to load is fatal: without the CA no flow can be inspected.
pub struct SigningCa {
    ca_cert_pem: String,
    ca_key_pem: String,
}

impl fmt::Debug for SigningCa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningCa").finish_non_exhaustive()
    }
}

impl SigningCa {
    pub fn load(certs_path: &Utf8Path, _key_password: Option<&str>) -> Result<Self, TlsError> {
        let cert_path = certs_path.join("ca-cert.pem");
        let key_path = certs_path.join("ca-key.pem");

        let ca_cert_pem = std::fs::read_to_string(&cert_path)
            .map_err(|e| TlsError::Ca(format!("{cert_path}: {e}")))?;
        let ca_key_pem = std::fs::read_to_string(&key_path)
            .map_err(|e| TlsError::Ca(format!("{key_path}: {e}")))?;

        // Fail early if the material does not parse.
        KeyPair::from_pem(&ca_key_pem).map_err(|e| TlsError::Ca(e.to_string()))?;
        CertificateParams::from_ca_cert_pem(&ca_cert_pem)
            .map_err(|e| TlsError::Ca(e.to_string()))?;

        Ok(Self {
            ca_cert_pem,
            ca_key_pem,
        })
    }

    /// Build from in-memory PEM material.
    pub fn from_pem(ca_cert_pem: String, ca_key_pem: String) -> Result<Self, TlsError> {
        KeyPair::from_pem(&ca_key_pem).map_err(|e| TlsError::Ca(e.to_string()))?;
        CertificateParams::from_ca_cert_pem(&ca_cert_pem)
            .map_err(|e| TlsError::Ca(e.to_string()))?;
        Ok(Self {
            ca_cert_pem,
            ca_key_pem,
        })
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Synthesize a leaf mirroring the origin certificate's subject and
    /// subject alternative names.
    pub fn spoof(&self, origin_der: &[u8]) -> Result<Arc<SpoofedCert>, TlsError> {
        let (_, origin) = x509_parser::parse_x509_certificate(origin_der)
            .map_err(|e| TlsError::Origin(e.to_string()))?;

        let subject_cn = origin
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or_default()
            .to_string();

        let mut dns_names = Vec::new();
        let mut ip_names = Vec::new();
        if let Ok(Some(san)) = origin.subject_alternative_name() {
            for name in &san.value.general_names {
                match name {
                    x509_parser::extensions::GeneralName::DNSName(dns) => {
                        dns_names.push(dns.to_string());
                    }
                    x509_parser::extensions::GeneralName::IPAddress(bytes) => {
                        match bytes.len() {
                            4 => {
                                let octets: [u8; 4] = (*bytes).try_into().unwrap();
                                ip_names.push(IpAddr::from(octets));
                            }
                            16 => {
                                let octets: [u8; 16] = (*bytes).try_into().unwrap();
                                ip_names.push(IpAddr::from(octets));
                            }
                            _ => {}
                        }
                    }
                    _ => {}
                }
            }
        }
        if dns_names.is_empty() && !subject_cn.is_empty() {
            dns_names.push(subject_cn.clone());
        }

        let mut params = CertificateParams::new(dns_names)?;
        let mut dn = DistinguishedName::new();
        if !subject_cn.is_empty() {
            dn.push(DnType::CommonName, subject_cn.clone());
        }
        params.distinguished_name = dn;
        for ip in ip_names {
            params.subject_alt_names.push(SanType::IpAddress(ip));
        }

        let ca_key = KeyPair::from_pem(&self.ca_key_pem).map_err(TlsError::Spoof)?;
        let ca_cert = CertificateParams::from_ca_cert_pem(&self.ca_cert_pem)?
            .self_signed(&ca_key)?;

        let leaf_key = KeyPair::generate()?;
        let leaf = params.signed_by(&leaf_key, &ca_cert, &ca_key)?;

        debug!("tls: synthesized leaf for '{subject_cn}'");
        Ok(Arc::new(SpoofedCert {
            cert_pem: leaf.pem(),
            key_pem: leaf_key.serialize_pem(),
            subject: subject_cn,
        }))
    }
}

/// Hex SHA-256 over the origin certificate, keying the spoof cache.
pub fn fingerprint(der: &[u8]) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, der);
    let mut out = String::with_capacity(64);
    for byte in digest.as_ref() {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Fetch or synthesize the spoofed pair for an origin certificate.
///
/// Generation is singleflighted per fingerprint by the cache.
pub async fn spoof_for(
    ca: &SigningCa,
    cert_cache: &CertCache,
    origin_der: &[u8],
) -> Result<Arc<SpoofedCert>, TlsError> {
    let fp = fingerprint(origin_der);
    cert_cache
        .get_or_generate(&fp, || {
            let result = ca.spoof(origin_der);
            async move { result }
        })
        .await
}

//----------- Bypass decisions -------------------------------------------------

/// Whether the flow is to be spliced without TLS termination.
///
/// A bypass fires on SNI membership in the profile's filter, or, when
/// enabled, on the destination IP being a cached resolution of a filter
/// entry, optionally expanded through the observed subdomain tree.
pub fn bypass_decision(
    profile: &TlsProfile,
    sni: Option<&str>,
    dst_ip: IpAddr,
    dns_cache: &DnsCache,
    domain_tree: &DomainTree,
) -> bool {
    if profile.sni_filter_bypass.is_empty() {
        return false;
    }

    if let Some(sni) = sni {
        for entry in &profile.sni_filter_bypass {
            if sni == entry || sni.ends_with(&format!(".{entry}")) {
                debug!("tls: sni '{sni}' matches bypass entry '{entry}'");
                return true;
            }
        }
    }

    if profile.sni_filter_use_dns_cache {
        let want_v6 = dst_ip.is_ipv6();
        for entry in &profile.sni_filter_bypass {
            if dns_cache.resolved(entry, want_v6).contains(&dst_ip) {
                debug!("tls: destination {dst_ip} resolves bypass entry '{entry}'");
                return true;
            }

            if profile.sni_filter_use_dns_domain_tree {
                for sub in domain_tree.subdomains(entry) {
                    let fqdn = format!("{sub}.{entry}");
                    if dns_cache.resolved(&fqdn, want_v6).contains(&dst_ip) {
                        debug!(
                            "tls: destination {dst_ip} resolves observed subdomain '{fqdn}'"
                        );
                        return true;
                    }
                }
            }
        }
    }

    false
}

//----------- Certificate check outcome ----------------------------------------

/// What went wrong verifying the origin chain.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CertCheckFailure {
    pub untrusted_issuer: bool,
    pub self_signed: bool,
    pub invalid: bool,

    /// A staple was required or expected but missing.
    pub staple_missing: bool,
}

impl CertCheckFailure {
    pub fn any(&self) -> bool {
        self.untrusted_issuer || self.self_signed || self.invalid || self.staple_missing
    }
}

/// How a failed check is surfaced to the user.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FailureResolution {
    Accept,
    ReplaceWithWarning,
    Reset,
}

/// The per-source override whitelist key.
pub type WhitelistKey = (IpAddr, String);

/// Resolve a failed certificate check per the profile and the override
/// whitelist.
pub fn resolve_check_failure(
    profile: &TlsProfile,
    failure: &CertCheckFailure,
    whitelist: &TtlCache<WhitelistKey, ()>,
    src_ip: IpAddr,
    dst_name: &str,
) -> FailureResolution {
    let mut remaining = *failure;
    if profile.allow_untrusted_issuers {
        remaining.untrusted_issuer = false;
    }
    if profile.allow_self_signed {
        remaining.self_signed = false;
    }
    if profile.allow_invalid_certs {
        remaining.invalid = false;
    }
    if !remaining.any() {
        return FailureResolution::Accept;
    }

    if profile.failed_certcheck_override {
        let key = (src_ip, dst_name.to_string());
        let hit = match profile.override_timeout_type {
            OverrideTimeoutType::Absolute => whitelist.get(&key),
            OverrideTimeoutType::Idle => {
                whitelist.get_refresh(&key, profile.failed_certcheck_override_timeout)
            }
        };
        if hit.is_some() {
            debug!("tls: certificate check overridden for {src_ip} -> {dst_name}");
            return FailureResolution::Accept;
        }
    }

    if profile.failed_certcheck_replacement {
        FailureResolution::ReplaceWithWarning
    } else {
        FailureResolution::Reset
    }
}

/// Record a user-confirmed override for the source.
pub fn record_override(
    profile: &TlsProfile,
    whitelist: &TtlCache<WhitelistKey, ()>,
    src_ip: IpAddr,
    dst_name: &str,
) {
    whitelist.put(
        (src_ip, dst_name.to_string()),
        (),
        profile.failed_certcheck_override_timeout,
    );
}

//----------- CapturingVerifier ------------------------------------------------

/// The origin chain as observed during the upstream handshake.
#[derive(Clone, Debug, Default)]
pub struct CapturedOrigin {
    pub end_entity: Option<CertificateDer<'static>>,
    pub intermediates: Vec<CertificateDer<'static>>,
    pub ocsp_stapled: bool,
    pub failure: CertCheckFailure,
}

/// A server certificate verifier that records the chain and the check
/// outcome instead of failing the handshake.
///
/// The handshake must complete even on a bad chain so the session can act
/// on the profile's resolution (a warning page needs a finished client-side
/// handshake with the spoofed leaf).
#[derive(Debug)]
pub struct CapturingVerifier {
    inner: Option<Arc<WebPkiServerVerifier>>,
    algorithms: WebPkiSupportedAlgorithms,
    require_staple: bool,
    captured: Mutex<CapturedOrigin>,
}

impl CapturingVerifier {
    pub fn new(roots: Arc<RootCertStore>, require_staple: bool) -> Arc<Self> {
        let inner = if roots.is_empty() {
            None
        } else {
            WebPkiServerVerifier::builder(roots).build().ok()
        };
        Arc::new(Self {
            inner,
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
            require_staple,
            captured: Mutex::new(CapturedOrigin::default()),
        })
    }

    /// The captured origin state after the handshake.
    pub fn take_captured(&self) -> CapturedOrigin {
        self.captured.lock().unwrap().clone()
    }

    fn classify(err: &rustls::Error, end_entity: &CertificateDer<'_>) -> CertCheckFailure {
        let mut failure = CertCheckFailure::default();
        match err {
            rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer) => {
                if is_self_signed(end_entity) {
                    failure.self_signed = true;
                } else {
                    failure.untrusted_issuer = true;
                }
            }
            rustls::Error::InvalidCertificate(_) => failure.invalid = true,
            _ => failure.invalid = true,
        }
        failure
    }
}

fn is_self_signed(der: &CertificateDer<'_>) -> bool {
    x509_parser::parse_x509_certificate(der)
        .map(|(_, cert)| cert.subject() == cert.issuer())
        .unwrap_or(false)
}

impl ServerCertVerifier for CapturingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let mut captured = CapturedOrigin {
            end_entity: Some(end_entity.clone().into_owned()),
            intermediates: intermediates
                .iter()
                .map(|c| c.clone().into_owned())
                .collect(),
            ocsp_stapled: !ocsp_response.is_empty(),
            failure: CertCheckFailure::default(),
        };

        match &self.inner {
            Some(inner) => {
                if let Err(err) = inner.verify_server_cert(
                    end_entity,
                    intermediates,
                    server_name,
                    ocsp_response,
                    now,
                ) {
                    warn!("tls: origin verification failed for {server_name:?}: {err}");
                    captured.failure = Self::classify(&err, end_entity);
                }
            }
            None => {
                // No trust anchors configured at all.
                captured.failure.untrusted_issuer = true;
            }
        }

        if self.require_staple && ocsp_response.is_empty() {
            captured.failure.staple_missing = true;
        }

        *self.captured.lock().unwrap() = captured;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

//----------- Key log ----------------------------------------------------------

/// An NSS-format key log appending to a configured path.
pub struct NssKeyLog {
    file: Mutex<std::fs::File>,
}

impl fmt::Debug for NssKeyLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NssKeyLog").finish_non_exhaustive()
    }
}

impl NssKeyLog {
    pub fn open(path: &Utf8Path) -> std::io::Result<Arc<Self>> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Arc::new(Self {
            file: Mutex::new(file),
        }))
    }
}

impl KeyLog for NssKeyLog {
    fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
        let mut line = String::with_capacity(label.len() + 2 * (client_random.len() + secret.len()) + 3);
        line.push_str(label);
        line.push(' ');
        for byte in client_random {
            line.push_str(&format!("{byte:02x}"));
        }
        line.push(' ');
        for byte in secret {
            line.push_str(&format!("{byte:02x}"));
        }
        line.push('\n');

        let mut file = self.file.lock().unwrap();
        let _ = file.write_all(line.as_bytes());
    }

    fn will_log(&self, _label: &str) -> bool {
        true
    }
}

//----------- Engine configurations --------------------------------------------

/// Shared TLS state built at startup.
#[derive(Debug)]
pub struct TlsContext {
    pub ca: SigningCa,
    pub roots: Arc<RootCertStore>,
    pub keylog: Option<Arc<NssKeyLog>>,
}

impl TlsContext {
    pub fn load(
        certs_path: &Utf8Path,
        ca_key_password: Option<&str>,
        keylog_path: Option<&Utf8PathBuf>,
    ) -> Result<Self, TlsError> {
        let ca = SigningCa::load(certs_path, ca_key_password)?;
        let roots = Arc::new(load_trust_roots(&certs_path.join("trusted"))?);
        let keylog = match keylog_path {
            Some(path) => Some(
                NssKeyLog::open(path).map_err(|e| TlsError::Ca(format!("keylog {path}: {e}")))?,
            ),
            None => None,
        };
        Ok(Self { ca, roots, keylog })
    }
}

/// Load PEM trust anchors from a directory; absent directories yield an
/// empty store.
fn load_trust_roots(dir: &Utf8Path) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(roots),
    };
    for entry in entries.flatten() {
        let Ok(pem) = std::fs::read(entry.path()) else {
            continue;
        };
        for cert in rustls_pemfile::certs(&mut &pem[..]).flatten() {
            let _ = roots.add(cert);
        }
    }
    Ok(roots)
}

/// The client-facing engine configuration around a spoofed leaf.
///
/// The PFS switches are carried from the original configuration surface but
/// gate nothing here: rustls only offers forward-secret key exchanges.
pub fn server_config(
    ctx: &TlsContext,
    spoofed: &SpoofedCert,
    profile: &TlsProfile,
) -> Result<Arc<ServerConfig>, TlsError> {
    let mut chain: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut spoofed.cert_pem.as_bytes())
            .collect::<Result<_, _>>()
            .map_err(|e| TlsError::Ca(format!("spoofed chain: {e}")))?;
    for cert in rustls_pemfile::certs(&mut ctx.ca.ca_cert_pem().as_bytes()).flatten() {
        chain.push(cert);
    }

    let key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut spoofed.key_pem.as_bytes())
            .map_err(|e| TlsError::Ca(format!("spoofed key: {e}")))?
            .ok_or_else(|| TlsError::Ca("spoofed key: no key in PEM".into()))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)?;

    if profile.left_disable_reuse {
        config.session_storage = Arc::new(NoServerSessionStorage {});
        config.send_tls13_tickets = 0;
    }
    if profile.sslkeylog {
        if let Some(keylog) = &ctx.keylog {
            config.key_log = keylog.clone();
        }
    }

    Ok(Arc::new(config))
}

/// The origin-facing engine configuration.
pub fn client_config(
    ctx: &TlsContext,
    profile: &TlsProfile,
    verifier: Arc<CapturingVerifier>,
) -> Arc<ClientConfig> {
    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();

    if profile.right_disable_reuse {
        config.resumption = Resumption::disabled();
    }
    if profile.sslkeylog {
        if let Some(keylog) = &ctx.keylog {
            config.key_log = keylog.clone();
        }
    }

    Arc::new(config)
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::tests::a_response;
    use crate::dns::DnsResponse;
    use std::time::Duration;

    fn test_ca() -> SigningCa {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::new()).unwrap();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "interpose test ca");
        params.distinguished_name = dn;
        let cert = params.self_signed(&key).unwrap();
        SigningCa::from_pem(cert.pem(), key.serialize_pem()).unwrap()
    }

    fn origin_cert(cn: &str, sans: &[&str]) -> Vec<u8> {
        let key = KeyPair::generate().unwrap();
        let mut params =
            CertificateParams::new(sans.iter().map(|s| s.to_string()).collect::<Vec<_>>())
                .unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        params.distinguished_name = dn;
        params.self_signed(&key).unwrap().der().to_vec()
    }

    #[test]
    fn spoofed_leaf_mirrors_subject_and_sans() {
        let ca = test_ca();
        let origin = origin_cert("example.com", &["example.com", "www.example.com"]);

        let spoofed = ca.spoof(&origin).unwrap();
        assert_eq!(spoofed.subject, "example.com");

        let der = rustls_pemfile::certs(&mut spoofed.cert_pem.as_bytes())
            .next()
            .unwrap()
            .unwrap();
        let (_, parsed) = x509_parser::parse_x509_certificate(&der).unwrap();
        let san = parsed.subject_alternative_name().unwrap().unwrap();
        let names: Vec<String> = san
            .value
            .general_names
            .iter()
            .filter_map(|n| match n {
                x509_parser::extensions::GeneralName::DNSName(d) => Some(d.to_string()),
                _ => None,
            })
            .collect();
        assert!(names.contains(&"example.com".to_string()));
        assert!(names.contains(&"www.example.com".to_string()));
    }

    #[test]
    fn fingerprints_differ_per_certificate() {
        let a = origin_cert("a.test", &["a.test"]);
        let b = origin_cert("b.test", &["b.test"]);
        assert_ne!(fingerprint(&a), fingerprint(&b));
        assert_eq!(fingerprint(&a).len(), 64);
    }

    fn bypass_profile(entries: &[&str]) -> TlsProfile {
        TlsProfile {
            inspect: true,
            sni_filter_bypass: entries.iter().map(|e| e.to_string()).collect(),
            ..TlsProfile::default()
        }
    }

    #[test]
    fn sni_bypass_matches_exact_and_subdomains() {
        let dns = DnsCache::new(16);
        let tree = DomainTree::default();
        let profile = bypass_profile(&["bank.example"]);
        let ip: IpAddr = "192.0.2.1".parse().unwrap();

        assert!(bypass_decision(&profile, Some("bank.example"), ip, &dns, &tree));
        assert!(bypass_decision(&profile, Some("www.bank.example"), ip, &dns, &tree));
        assert!(!bypass_decision(&profile, Some("example.com"), ip, &dns, &tree));
        assert!(!bypass_decision(&profile, None, ip, &dns, &tree));
    }

    #[test]
    fn ip_bypass_uses_cache_and_domain_tree() {
        let dns = DnsCache::new(16);
        let tree = DomainTree::default();
        let profile = bypass_profile(&["mybank.com"]);

        // The bypass entry itself resolves to 1.1.1.1.
        dns.store(DnsResponse::parse(&a_response(1, "mybank.com.", &[("1.1.1.1", 300)])).unwrap());
        assert!(bypass_decision(
            &profile,
            None,
            "1.1.1.1".parse().unwrap(),
            &dns,
            &tree
        ));

        // An observed subdomain resolves to 2.2.2.2.
        dns.store(
            DnsResponse::parse(&a_response(2, "ecom.mybank.com.", &[("2.2.2.2", 300)])).unwrap(),
        );
        tree.record("ecom.mybank.com");
        assert!(bypass_decision(
            &profile,
            None,
            "2.2.2.2".parse().unwrap(),
            &dns,
            &tree
        ));

        assert!(!bypass_decision(
            &profile,
            None,
            "3.3.3.3".parse().unwrap(),
            &dns,
            &tree
        ));
    }

    #[test]
    fn check_failure_resolution_honors_allowances_and_whitelist() {
        let whitelist = TtlCache::new(16);
        let src: IpAddr = "10.0.0.1".parse().unwrap();
        let failure = CertCheckFailure {
            self_signed: true,
            ..Default::default()
        };

        let mut profile = TlsProfile::default();
        assert_eq!(
            resolve_check_failure(&profile, &failure, &whitelist, src, "x.test"),
            FailureResolution::ReplaceWithWarning
        );

        profile.allow_self_signed = true;
        assert_eq!(
            resolve_check_failure(&profile, &failure, &whitelist, src, "x.test"),
            FailureResolution::Accept
        );

        profile.allow_self_signed = false;
        profile.failed_certcheck_replacement = false;
        assert_eq!(
            resolve_check_failure(&profile, &failure, &whitelist, src, "x.test"),
            FailureResolution::Reset
        );

        // A recorded override short-circuits to accept.
        profile.failed_certcheck_override = true;
        record_override(&profile, &whitelist, src, "x.test");
        assert_eq!(
            resolve_check_failure(&profile, &failure, &whitelist, src, "x.test"),
            FailureResolution::Accept
        );
        // ... but only for that destination.
        assert_eq!(
            resolve_check_failure(&profile, &failure, &whitelist, src, "y.test"),
            FailureResolution::Reset
        );
    }

    #[tokio::test]
    async fn spoof_cache_returns_the_same_pair() {
        let ca = test_ca();
        let cache = CertCache::new(8);
        let origin = origin_cert("same.test", &["same.test"]);

        let first = spoof_for(&ca, &cache, &origin).await.unwrap();
        let second = spoof_for(&ca, &cache, &origin).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn whitelist_idle_mode_refreshes() {
        let whitelist: TtlCache<WhitelistKey, ()> = TtlCache::new(4);
        let src: IpAddr = "10.0.0.2".parse().unwrap();
        whitelist.put((src, "a.test".into()), (), Duration::from_secs(60));
        assert!(whitelist
            .get_refresh(&(src, "a.test".into()), Duration::from_secs(120))
            .is_some());
    }
}
