//! The per-flow session state machine.
//!
//! A session owns its client-facing (left) and origin-facing (right)
//! endpoints and everything attached to them: the matched policy index, the
//! inspectors, the exchange log and an optional capture writer.  All reads
//! and writes of one session are serialized within its task, so none of the
//! per-session state is locked.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use rustls::pki_types::ServerName;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tracing::{debug, info, warn};

use crate::capture::CaptureWriter;
use crate::center::Center;
use crate::inspect::dns::{DnsInspector, DNS_PORT};
use crate::inspect::{InspectServices, Inspector, SignatureInspector, Verdict};
use crate::policy::profiles::{ContentProfile, DetectionMode, OcspStaplingMode, TlsProfile};
use crate::policy::{EndpointInfo, PolicyAction, ProfileSet};
use crate::session::cx::{AppData, Com, Cx, HttpRequestData};
use crate::session::flow::{Flow, Side};
use crate::tls::sni::{peek_client_hello, SniPeek};
use crate::tls::{
    bypass_decision, client_config, is_tls_port, resolve_check_failure, server_config,
    spoof_for, CapturingVerifier, FailureResolution, TlsError,
};

pub mod cx;
pub mod flow;

/// Upper bound on bytes read per pump iteration and side.
const READ_CHUNK: usize = 16 * 1024;

/// The exchange log stops growing past this; inspectors have long decided.
const MAX_INSPECT_BYTES: usize = 128 * 1024;

/// Time budget for connecting and for each TLS handshake.
const OPENING_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace given to the surviving side after a half-close.
const HALF_CLOSE_GRACE: Duration = Duration::from_secs(5);

//----------- SessionState -----------------------------------------------------

/// Lifecycle states of a session.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    FreshAccept,
    PolicyPending,
    Denied,
    Accepted,
    TlsHandshake,
    Streaming,
    HalfClose,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FreshAccept => "fresh-accept",
            Self::PolicyPending => "policy-pending",
            Self::Denied => "denied",
            Self::Accepted => "accepted",
            Self::TlsHandshake => "tls-handshake",
            Self::Streaming => "streaming",
            Self::HalfClose => "half-close",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//----------- Session ----------------------------------------------------------

enum PumpOutcome {
    Done,
    StartTls,
}

enum ChunkOutcome {
    Forwarded,
    Cached,
    Errored,
    StartTls,
}

pub struct Session {
    pub id: u64,
    center: Arc<Center>,

    pub state: SessionState,

    pub left: Cx,
    pub right: Option<Cx>,

    /// The apparent destination of the flow.
    pub dst: SocketAddr,

    /// IP protocol number of the flow.
    pub proto: u8,

    pub matched_policy: Option<usize>,
    profiles: ProfileSet,

    inspectors: Vec<Inspector>,
    flow: Flow,
    capture: Option<CaptureWriter>,

    /// TLS records are forwarded byte-for-byte, no termination.
    pub tls_bypassed: bool,

    content_counters: Vec<u32>,
}

impl Session {
    /// Build a session around a freshly accepted TCP connection.
    pub fn new_tcp(center: Arc<Center>, stream: TcpStream, client: SocketAddr, dst: SocketAddr) -> Self {
        let id = center.next_session_id();
        Self {
            id,
            center,
            state: SessionState::FreshAccept,
            left: Cx::new(Com::Tcp(stream), client.ip(), client.port()),
            right: None,
            dst,
            proto: 6,
            matched_policy: None,
            profiles: ProfileSet::default(),
            inspectors: Vec::new(),
            flow: Flow::new(),
            capture: None,
            tls_bypassed: false,
            content_counters: Vec::new(),
        }
    }

    /// Build a session from a SOCKS hand-off: the left endpoint exists, the
    /// policy verdict has been delivered to the client, and the right side
    /// is prepared (or left for the session to connect).
    pub fn from_handoff(
        center: Arc<Center>,
        left: Cx,
        right: Option<Cx>,
        dst: SocketAddr,
        matched_policy: Option<usize>,
    ) -> Self {
        let id = center.next_session_id();
        Self {
            id,
            center,
            state: SessionState::Accepted,
            left,
            right,
            dst,
            proto: 6,
            matched_policy,
            profiles: ProfileSet::default(),
            inspectors: Vec::new(),
            flow: Flow::new(),
            capture: None,
            tls_bypassed: false,
            content_counters: Vec::new(),
        }
    }

    fn set_state(&mut self, state: SessionState) {
        debug!("session {}: {} -> {}", self.id, self.state, state);
        self.state = state;
        self.center.update_session(self.id, state);
    }

    fn client(&self) -> SocketAddr {
        SocketAddr::new(self.left.host, self.left.port)
    }

    /// Run the session to completion.
    pub async fn run(mut self) {
        self.center
            .register_session(self.id, self.proto, self.client(), self.dst);
        self.center.meters.sessions_total.fetch_add(1, Ordering::Relaxed);

        let result = self.lifecycle().await;
        if let Err(err) = result {
            debug!("session {}: ended: {err}", self.id);
        }

        self.teardown().await;
    }

    async fn lifecycle(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::FreshAccept {
            self.set_state(SessionState::PolicyPending);
            let db = self.center.policy.load_full();
            let left = [EndpointInfo {
                proto: self.proto,
                ip: self.left.host,
                port: self.left.port,
            }];
            let right = [EndpointInfo {
                proto: self.proto,
                ip: self.dst.ip(),
                port: self.dst.port(),
            }];
            self.matched_policy = db.matched(&left, &right, &self.center.dns_cache);

            if self.center.policy.load().action(self.matched_policy) == PolicyAction::Deny {
                return self.deny().await;
            }
            self.set_state(SessionState::Accepted);
        }

        self.apply_matched_rule();

        match self.profiles.tls.clone() {
            Some(profile)
                if profile.inspect && self.proto == 6 && is_tls_port(self.dst.port()) =>
            {
                self.run_mitm(profile).await
            }
            _ => {
                self.connect_right().await?;
                self.run_pump_loop().await
            }
        }
    }

    /// Bind the matched rule's profiles and attach inspectors.
    fn apply_matched_rule(&mut self) {
        let db = self.center.policy.load_full();
        if let Some(index) = self.matched_policy {
            if let Some(profiles) = db.profiles(index) {
                self.profiles = profiles.clone();
            }
        }

        if self.dst.port() == DNS_PORT {
            let opts = self
                .profiles
                .alg_dns
                .clone()
                .unwrap_or_default()
                .into();
            self.inspectors
                .push(Inspector::Dns(DnsInspector::new(opts, self.proto == 6)));
        }

        let detect = self
            .profiles
            .detection
            .as_ref()
            .map(|p| p.mode != DetectionMode::None)
            .unwrap_or(false);
        if detect {
            self.inspectors.push(Inspector::Signatures(SignatureInspector::new(
                db.starttls_sensor.clone(),
                db.detection_sensor.clone(),
            )));
        }

        if let Some(content) = &self.profiles.content {
            self.content_counters = vec![0; content.content_rules.len()];
            if content.write_payload {
                let config = self.center.config.lock().unwrap();
                match CaptureWriter::open(
                    &config.capture,
                    content.write_format,
                    &format!("{}-{}", self.id, self.client().ip()),
                ) {
                    Ok(writer) => self.capture = Some(writer),
                    Err(err) => warn!("session {}: cannot open capture: {err}", self.id),
                }
            }
        }
    }

    /// Reject the client the way its protocol expects.
    async fn deny(&mut self) -> Result<(), SessionError> {
        self.set_state(SessionState::Denied);
        info!(
            "session {}: denied {} -> {}",
            self.id,
            self.client(),
            self.dst
        );
        // A reset tells the client more honestly than a silent close.
        if let Com::Tcp(stream) = &self.left.com {
            let _ = stream.set_linger(Some(Duration::ZERO));
        }
        Ok(())
    }

    /// Establish the origin-facing endpoint, honoring DNAT routing.
    async fn connect_right(&mut self) -> Result<(), SessionError> {
        if self.right.is_some() {
            return Ok(());
        }

        let target = self.routed_target();
        let stream = timeout(OPENING_TIMEOUT, TcpStream::connect(target))
            .await
            .map_err(|_| SessionError::Opening("connect timeout".into()))?
            .map_err(|e| SessionError::Opening(e.to_string()))?;

        let mut right = Cx::new(Com::Tcp(stream), target.ip(), target.port());
        right.opening = false;
        self.right = Some(right);
        Ok(())
    }

    /// The connect target after applying the routing profile, if any.
    fn routed_target(&self) -> SocketAddr {
        let Some(routing) = &self.profiles.routing else {
            return self.dst;
        };
        if routing.dnat_addresses.is_empty() {
            return self.dst;
        }

        let candidates: Vec<IpAddr> = routing
            .dnat_addresses
            .iter()
            .filter_map(|a| a.parse().ok())
            .collect();
        if candidates.is_empty() {
            return self.dst;
        }
        let index = match routing.dnat_lb_method {
            crate::policy::profiles::LbMethod::RoundRobin => {
                rand::random::<usize>() % candidates.len()
            }
            crate::policy::profiles::LbMethod::L3 | crate::policy::profiles::LbMethod::L4 => {
                let mut seed = match self.left.host {
                    IpAddr::V4(v4) => u32::from(v4) as usize,
                    IpAddr::V6(v6) => u128::from(v6) as usize,
                };
                if routing.dnat_lb_method == crate::policy::profiles::LbMethod::L4 {
                    seed = seed.wrapping_add(self.left.port as usize);
                }
                seed % candidates.len()
            }
        };

        let port = routing
            .dnat_ports
            .first()
            .and_then(|p| p.parse().ok())
            .unwrap_or(self.dst.port());
        SocketAddr::new(candidates[index], port)
    }

    //--- TLS interception

    async fn run_mitm(&mut self, profile: Arc<TlsProfile>) -> Result<(), SessionError> {
        self.set_state(SessionState::TlsHandshake);

        let sni = self.peek_sni().await?;
        match &sni {
            Some(name) => debug!("session {}: client hello for '{name}'", self.id),
            None => debug!("session {}: client hello without SNI", self.id),
        }

        if bypass_decision(
            &profile,
            sni.as_deref(),
            self.dst.ip(),
            &self.center.dns_cache,
            &self.center.domain_tree,
        ) {
            info!("session {}: TLS bypass, splicing", self.id);
            self.tls_bypassed = true;
            self.connect_right().await?;
            return self.run_pump_loop().await;
        }

        self.connect_right().await?;
        match self.mitm_handshakes(&profile, sni).await? {
            FailureResolution::Reset => {
                warn!("session {}: certificate check failed, resetting", self.id);
                Ok(())
            }
            FailureResolution::ReplaceWithWarning => self.serve_warning(&profile).await,
            FailureResolution::Accept => self.run_pump_loop().await,
        }
    }

    /// Peek the client's first bytes for an SNI without consuming them.
    async fn peek_sni(&mut self) -> Result<Option<String>, SessionError> {
        let Com::Tcp(stream) = &self.left.com else {
            return Ok(None);
        };

        let mut buf = vec![0u8; READ_CHUNK];
        let deadline = tokio::time::Instant::now() + OPENING_TIMEOUT;
        loop {
            let n = timeout(Duration::from_millis(250), stream.peek(&mut buf))
                .await
                .ok()
                .transpose()
                .map_err(|e| SessionError::Opening(e.to_string()))?
                .unwrap_or(0);

            match peek_client_hello(&buf[..n]) {
                SniPeek::Found(name) => return Ok(Some(name)),
                SniPeek::NoSni => return Ok(None),
                SniPeek::NotTls if n > 0 => return Ok(None),
                SniPeek::NotTls | SniPeek::Incomplete => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(SessionError::Opening("client hello timeout".into()));
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            }
        }
    }

    /// Run the upstream and client-side handshakes, spoofing the leaf.
    ///
    /// Both handshakes progress independently of the peer pump; the client
    /// side waits for the origin chain because the spoofing decision needs
    /// it.
    async fn mitm_handshakes(
        &mut self,
        profile: &TlsProfile,
        sni: Option<String>,
    ) -> Result<FailureResolution, SessionError> {
        let tls = self
            .center
            .tls
            .as_ref()
            .ok_or_else(|| SessionError::Tls("no signing CA configured".into()))?;

        // Origin-facing handshake, capturing the chain.
        let verifier = CapturingVerifier::new(
            tls.roots.clone(),
            profile.ocsp_stapling && profile.ocsp_stapling_mode == OcspStaplingMode::Require,
        );
        let config = client_config(tls, profile, verifier.clone());

        let server_name = match &sni {
            Some(name) => ServerName::try_from(name.clone())
                .map_err(|_| SessionError::Tls(format!("bad SNI '{name}'")))?,
            None => ServerName::IpAddress(self.dst.ip().into()),
        };

        let right = self.right.take().ok_or(SessionError::Gone)?;
        let right_host = right.host;
        let right_port = right.port;
        let right_tcp = right
            .com
            .into_tcp()
            .map_err(|_| SessionError::Tls("origin side is not plain TCP".into()))?;

        let connector = TlsConnector::from(config);
        let right_tls = timeout(OPENING_TIMEOUT, connector.connect(server_name, right_tcp))
            .await
            .map_err(|_| SessionError::Opening("origin handshake timeout".into()))?
            .map_err(|e| SessionError::Tls(e.to_string()))?;

        let mut right = Cx::new(
            Com::Tls(Box::new(TlsStream::Client(right_tls))),
            right_host,
            right_port,
        );
        right.waiting_for_peercom = false;
        self.right = Some(right);

        let mut captured = verifier.take_captured();
        let origin_der = captured
            .end_entity
            .clone()
            .ok_or_else(|| SessionError::Tls("origin presented no certificate".into()))?;

        // The OCSP result cache is consulted per profile mode; a cached
        // revocation counts as an invalid chain.
        if profile.ocsp_mode != crate::policy::profiles::OcspMode::Off {
            let fp = crate::tls::fingerprint(&origin_der);
            if let Some(crate::center::OcspVerdict::Revoked) = self.center.ocsp_cache.get(&fp) {
                captured.failure.invalid = true;
            }
        }

        // Synthesize (or reuse) the leaf mirroring the origin.
        let spoofed = spoof_for(&tls.ca, &self.center.cert_cache, &origin_der)
            .await
            .map_err(|e| SessionError::Tls(e.to_string()))?;

        let resolution = if captured.failure.any() {
            let dst_name = sni.clone().unwrap_or_else(|| self.dst.ip().to_string());
            resolve_check_failure(
                profile,
                &captured.failure,
                &self.center.whitelist,
                self.left.host,
                &dst_name,
            )
        } else {
            FailureResolution::Accept
        };

        if resolution == FailureResolution::Reset {
            return Ok(resolution);
        }

        // Client-facing handshake with the spoofed leaf.
        let config =
            server_config(tls, &spoofed, profile).map_err(|e| SessionError::Tls(e.to_string()))?;
        let left_host = self.left.host;
        let left_port = self.left.port;
        let left_cx = std::mem::replace(
            &mut self.left,
            Cx::new(Com::Udp(dummy_udp()), left_host, left_port),
        );
        let left_tcp = left_cx
            .com
            .into_tcp()
            .map_err(|_| SessionError::Tls("client side is not plain TCP".into()))?;

        let acceptor = TlsAcceptor::from(config);
        let left_tls = timeout(OPENING_TIMEOUT, acceptor.accept(left_tcp))
            .await
            .map_err(|_| SessionError::Opening("client handshake timeout".into()))?
            .map_err(|e| SessionError::Tls(e.to_string()))?;

        self.left = Cx::new(
            Com::Tls(Box::new(TlsStream::Server(left_tls))),
            left_host,
            left_port,
        );

        debug!(
            "session {}: intercepting TLS for '{}'",
            self.id, spoofed.subject
        );
        Ok(resolution)
    }

    /// Serve the certificate-warning replacement page over the spoofed
    /// session, handling the override confirmation path.
    async fn serve_warning(&mut self, profile: &TlsProfile) -> Result<(), SessionError> {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        let _ = timeout(Duration::from_secs(10), self.left.com.read_buf(&mut buf)).await;

        let request = HttpRequestData::sniff(&buf, true);
        let dst_name = request
            .as_ref()
            .map(|r| r.host.clone())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| self.dst.ip().to_string());

        let confirmed = request
            .as_ref()
            .map(|r| r.uri.starts_with("/override"))
            .unwrap_or(false);

        let body = if confirmed && profile.failed_certcheck_override {
            crate::tls::record_override(
                profile,
                &self.center.whitelist,
                self.left.host,
                &dst_name,
            );
            info!(
                "session {}: certificate override recorded for {} -> {dst_name}",
                self.id, self.left.host
            );
            self.center
                .replacements
                .render("ssl_override_done", &[("target", dst_name.as_str())])
        } else {
            self.center.replacements.render(
                "ssl_warning",
                &[
                    ("target", dst_name.as_str()),
                    (
                        "override",
                        if profile.failed_certcheck_override {
                            "/override"
                        } else {
                            ""
                        },
                    ),
                ],
            )
        };

        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        self.left
            .com
            .write_all(response.as_bytes())
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        Ok(())
    }

    //--- Streaming

    async fn run_pump_loop(&mut self) -> Result<(), SessionError> {
        loop {
            match self.pump().await? {
                PumpOutcome::Done => return Ok(()),
                PumpOutcome::StartTls => {
                    let Some(profile) = self.profiles.tls.clone() else {
                        continue;
                    };
                    info!("session {}: STARTTLS, upgrading to TLS inspection", self.id);
                    match self.mitm_handshakes(&profile, None).await? {
                        FailureResolution::Reset => return Ok(()),
                        FailureResolution::ReplaceWithWarning => {
                            return self.serve_warning(&profile).await;
                        }
                        FailureResolution::Accept => continue,
                    }
                }
            }
        }
    }

    /// The read pump: move bytes between the endpoints, feeding inspectors
    /// in receive order.
    async fn pump(&mut self) -> Result<PumpOutcome, SessionError> {
        self.set_state(SessionState::Streaming);

        let mut right = self.right.take().ok_or(SessionError::Gone)?;
        let mut left_open = true;
        let mut right_open = true;
        let mut lbuf = BytesMut::with_capacity(READ_CHUNK);
        let mut rbuf = BytesMut::with_capacity(READ_CHUNK);
        let mut outcome = PumpOutcome::Done;
        let mut grace: Option<tokio::time::Instant> = None;

        loop {
            if self.left.error || right.error {
                break;
            }
            if !left_open && !right_open {
                break;
            }

            let idle = self.idle_timeout();
            let deadline = grace
                .unwrap_or_else(|| tokio::time::Instant::now() + idle);

            let event = tokio::select! {
                biased;

                _ = tokio::time::sleep_until(deadline) => None,

                res = self.left.com.read_buf(&mut lbuf), if left_open => {
                    Some((Side::Left, res))
                }

                res = right.com.read_buf(&mut rbuf), if right_open => {
                    Some((Side::Right, res))
                }
            };

            let Some((side, result)) = event else {
                if grace.is_some() {
                    debug!("session {}: half-close grace elapsed", self.id);
                } else {
                    debug!("session {}: idle timeout", self.id);
                    self.set_state(SessionState::HalfClose);
                }
                break;
            };

            match result {
                Ok(0) => {
                    debug!("session {}: {side:?} EOF", self.id);
                    match side {
                        Side::Left => {
                            left_open = false;
                            right.com.shutdown().await;
                        }
                        Side::Right => {
                            right_open = false;
                            self.left.com.shutdown().await;
                        }
                    }
                    if self.state != SessionState::HalfClose {
                        self.set_state(SessionState::HalfClose);
                    }
                    grace = Some(tokio::time::Instant::now() + HALF_CLOSE_GRACE);
                }
                Ok(_) => {
                    let mut chunk = match side {
                        Side::Left => lbuf.split(),
                        Side::Right => rbuf.split(),
                    };
                    match self.handle_chunk(&mut right, side, &mut chunk).await {
                        ChunkOutcome::Forwarded => {}
                        ChunkOutcome::Cached => {
                            // The reply went out directly; the origin side
                            // is done for.
                            right.error = true;
                        }
                        ChunkOutcome::Errored => match side {
                            Side::Left => self.left.error = true,
                            Side::Right => right.error = true,
                        },
                        ChunkOutcome::StartTls => {
                            outcome = PumpOutcome::StartTls;
                            break;
                        }
                    }
                }
                Err(err) => {
                    debug!("session {}: {side:?} transport error: {err}", self.id);
                    match side {
                        Side::Left => self.left.error = true,
                        Side::Right => right.error = true,
                    }
                    if self.state != SessionState::HalfClose {
                        self.set_state(SessionState::HalfClose);
                    }
                }
            }
        }

        self.right = Some(right);
        Ok(outcome)
    }

    /// Inspect one received chunk and forward it to the peer.
    async fn handle_chunk(
        &mut self,
        right: &mut Cx,
        side: Side,
        chunk: &mut BytesMut,
    ) -> ChunkOutcome {
        match side {
            Side::Left => {
                self.left.bytes_in += chunk.len() as u64;
                self.center
                    .meters
                    .bytes_up
                    .fetch_add(chunk.len() as u64, Ordering::Relaxed);
            }
            Side::Right => {
                right.bytes_in += chunk.len() as u64;
                self.center
                    .meters
                    .bytes_down
                    .fetch_add(chunk.len() as u64, Ordering::Relaxed);
            }
        }

        if let Some(capture) = &mut self.capture {
            capture.write(side, chunk);
        }

        if let Some(content) = self.profiles.content.clone() {
            apply_content_rules(&content, chunk, &mut self.content_counters);
        }

        let under_cap = self.flow.side_bytes(side) < MAX_INSPECT_BYTES;
        if under_cap {
            self.flow.append(side, chunk);
        }

        let services = InspectServices {
            dns_cache: &self.center.dns_cache,
            domain_tree: &self.center.domain_tree,
        };

        let mut verdict = Verdict::Continue;
        let mut starttls = false;
        for inspector in &mut self.inspectors {
            if !inspector.interested(self.dst.port()) || inspector.completed() {
                continue;
            }
            verdict = inspector.update(side, chunk, &self.flow, &services);
            match verdict {
                Verdict::Continue => {}
                Verdict::Cached | Verdict::Block => break,
            }
        }

        // Act on signature engine results.
        let client = SocketAddr::new(self.left.host, self.left.port);
        for inspector in &mut self.inspectors {
            if let Inspector::Signatures(sigs) = inspector {
                for hit in sigs.take_hits() {
                    warn!(
                        "session {}: connection from {client} matches signature: cat='{}', name='{}'",
                        self.id,
                        hit.signature.category,
                        hit.signature.name
                    );
                    if &*hit.signature.category == "www" {
                        if let Some(request) =
                            HttpRequestData::sniff(chunk, self.left.com.is_tls())
                        {
                            info!(
                                "session {}: www request: {}",
                                self.id,
                                request.request()
                            );
                            self.left.app_data = Some(AppData::Http(request));
                        }
                    }
                }
                if sigs.take_starttls() && !self.left.com.is_tls() {
                    starttls = true;
                }
            }
        }

        match verdict {
            Verdict::Block => return ChunkOutcome::Errored,
            Verdict::Cached => {
                // Synthesize the reply toward the originating side.
                for inspector in &self.inspectors {
                    if let Inspector::Dns(dns) = inspector {
                        if let Some(reply) = dns.apply_verdict() {
                            let target = match side {
                                Side::Left => &mut self.left,
                                Side::Right => right,
                            };
                            if let Err(err) = target.com.write_all(&reply).await {
                                debug!("session {}: cached reply write failed: {err}", self.id);
                                return ChunkOutcome::Errored;
                            }
                            target.bytes_out += reply.len() as u64;
                        }
                    }
                }
                return ChunkOutcome::Cached;
            }
            Verdict::Continue => {}
        }

        let peer = match side {
            Side::Left => right,
            Side::Right => &mut self.left,
        };
        if let Err(err) = peer.com.write_all(chunk).await {
            debug!("session {}: forward to {side:?} peer failed: {err}", self.id);
            return ChunkOutcome::Errored;
        }
        peer.bytes_out += chunk.len() as u64;

        if starttls {
            return ChunkOutcome::StartTls;
        }
        ChunkOutcome::Forwarded
    }

    fn idle_timeout(&self) -> Duration {
        let mut idle = self.left.idle_delay;
        if let Some(right) = &self.right {
            idle = idle.min(right.idle_delay);
        }
        for inspector in &self.inspectors {
            if let Inspector::Dns(dns) = inspector {
                if let Some(hint) = dns.idle_hint {
                    idle = idle.min(Duration::from_secs(hint));
                }
            }
        }
        idle
    }

    async fn teardown(&mut self) {
        self.left.com.shutdown().await;
        if let Some(right) = &mut self.right {
            right.com.shutdown().await;
        }
        self.set_state(SessionState::Closed);
        self.center.unregister_session(self.id);
        info!(
            "session {}: closed, client {} ({} up / {} down)",
            self.id,
            self.client(),
            self.left.bytes_in,
            self.right.as_ref().map(|r| r.bytes_in).unwrap_or(0)
        );
    }
}

/// A placeholder transport for the brief window while a TCP stream is being
/// upgraded to TLS.
fn dummy_udp() -> UdpSocket {
    let socket = std::net::UdpSocket::bind(("127.0.0.1", 0)).expect("loopback bind");
    socket.set_nonblocking(true).expect("nonblocking");
    UdpSocket::from_std(socket).expect("tokio wrap")
}

//----------- Content rewriting ------------------------------------------------

/// Apply the content profile's literal rewrite rules to a chunk.
fn apply_content_rules(profile: &ContentProfile, chunk: &mut BytesMut, counters: &mut Vec<u32>) {
    if counters.len() != profile.content_rules.len() {
        counters.resize(profile.content_rules.len(), 0);
    }

    for (rule, counter) in profile.content_rules.iter().zip(counters.iter_mut()) {
        let needle = rule.matching.as_bytes();
        if needle.is_empty() || needle.len() > chunk.len() {
            continue;
        }

        let mut result = Vec::with_capacity(chunk.len());
        let mut pos = 0;
        while pos + needle.len() <= chunk.len() {
            if &chunk[pos..pos + needle.len()] == needle {
                *counter += 1;
                let due = rule.replace_each_nth == 0 || *counter % rule.replace_each_nth == 0;
                if due {
                    let mut replacement = rule.replace.as_bytes().to_vec();
                    if rule.fill_length {
                        replacement.resize(needle.len(), b' ');
                    }
                    result.extend_from_slice(&replacement);
                } else {
                    result.extend_from_slice(needle);
                }
                pos += needle.len();
            } else {
                result.push(chunk[pos]);
                pos += 1;
            }
        }
        result.extend_from_slice(&chunk[pos..]);
        *chunk = BytesMut::from(&result[..]);
    }
}

//----------- DatagramSession --------------------------------------------------

/// A UDP flow proxied between a shared listener socket and a connected
/// origin socket.
///
/// Client datagrams arrive through the owning unit's dispatch channel since
/// one listener serves many clients.
pub struct DatagramSession {
    pub id: u64,
    center: Arc<Center>,
    pub client: SocketAddr,
    pub dst: SocketAddr,
    reply: Arc<UdpSocket>,
    datagrams: mpsc::Receiver<BytesMut>,
    pub matched_policy: Option<usize>,
    inspectors: Vec<Inspector>,
}

impl DatagramSession {
    pub fn new(
        center: Arc<Center>,
        client: SocketAddr,
        dst: SocketAddr,
        reply: Arc<UdpSocket>,
        datagrams: mpsc::Receiver<BytesMut>,
    ) -> Self {
        let id = center.next_session_id();
        Self {
            id,
            center,
            client,
            dst,
            reply,
            datagrams,
            matched_policy: None,
            inspectors: Vec::new(),
        }
    }

    pub async fn run(mut self) {
        self.center
            .register_session(self.id, 17, self.client, self.dst);
        self.center.meters.sessions_total.fetch_add(1, Ordering::Relaxed);

        if let Err(err) = self.lifecycle().await {
            debug!("session {}: ended: {err}", self.id);
        }

        self.center.unregister_session(self.id);
    }

    async fn lifecycle(&mut self) -> Result<(), SessionError> {
        let db = self.center.policy.load_full();
        let left = [EndpointInfo {
            proto: 17,
            ip: self.client.ip(),
            port: self.client.port(),
        }];
        let right = [EndpointInfo {
            proto: 17,
            ip: self.dst.ip(),
            port: self.dst.port(),
        }];
        self.matched_policy = db.matched(&left, &right, &self.center.dns_cache);
        if db.action(self.matched_policy) == PolicyAction::Deny {
            info!("session {}: denied {} -> {}", self.id, self.client, self.dst);
            return Ok(());
        }

        if self.dst.port() == DNS_PORT {
            let opts = self
                .matched_policy
                .and_then(|i| db.prof_alg_dns(i))
                .unwrap_or_default();
            self.inspectors
                .push(Inspector::Dns(DnsInspector::new(opts, false)));
        }

        let origin = UdpSocket::bind(("0.0.0.0", 0))
            .await
            .map_err(|e| SessionError::Opening(e.to_string()))?;
        origin
            .connect(self.dst)
            .await
            .map_err(|e| SessionError::Opening(e.to_string()))?;

        let center = self.center.clone();
        let services = InspectServices {
            dns_cache: &center.dns_cache,
            domain_tree: &center.domain_tree,
        };
        let flow = Flow::new();
        let mut rbuf = BytesMut::with_capacity(READ_CHUNK);

        loop {
            let idle = self.idle_timeout();
            tokio::select! {
                biased;

                _ = tokio::time::sleep(idle) => {
                    debug!("session {}: idle timeout", self.id);
                    return Ok(());
                }

                datagram = self.datagrams.recv() => {
                    let Some(mut datagram) = datagram else {
                        return Ok(());
                    };
                    self.center.meters.bytes_up.fetch_add(datagram.len() as u64, Ordering::Relaxed);

                    match self.inspect(Side::Left, &mut datagram, &flow, &services) {
                        Verdict::Block => return Ok(()),
                        Verdict::Cached => {
                            self.serve_cached().await?;
                            return Ok(());
                        }
                        Verdict::Continue => {
                            origin.send(&datagram)
                                .await
                                .map_err(|e| SessionError::Transport(e.to_string()))?;
                        }
                    }
                }

                res = origin.recv_buf(&mut rbuf) => {
                    res.map_err(|e| SessionError::Transport(e.to_string()))?;
                    let mut datagram = rbuf.split();
                    self.center.meters.bytes_down.fetch_add(datagram.len() as u64, Ordering::Relaxed);

                    match self.inspect(Side::Right, &mut datagram, &flow, &services) {
                        Verdict::Block => return Ok(()),
                        Verdict::Cached => unreachable!("responses are never served from cache"),
                        Verdict::Continue => {
                            self.reply
                                .send_to(&datagram, self.client)
                                .await
                                .map_err(|e| SessionError::Transport(e.to_string()))?;
                        }
                    }
                }
            }
        }
    }

    fn inspect(
        &mut self,
        side: Side,
        datagram: &mut BytesMut,
        flow: &Flow,
        services: &InspectServices<'_>,
    ) -> Verdict {
        for inspector in &mut self.inspectors {
            if !inspector.interested(self.dst.port()) || inspector.completed() {
                continue;
            }
            let verdict = inspector.update(side, datagram, flow, services);
            if verdict != Verdict::Continue {
                return verdict;
            }
        }
        Verdict::Continue
    }

    async fn serve_cached(&mut self) -> Result<(), SessionError> {
        for inspector in &self.inspectors {
            if let Inspector::Dns(dns) = inspector {
                if let Some(reply) = dns.apply_verdict() {
                    self.reply
                        .send_to(&reply, self.client)
                        .await
                        .map_err(|e| SessionError::Transport(e.to_string()))?;
                    debug!(
                        "session {}: served {} cached bytes to {}",
                        self.id,
                        reply.len(),
                        self.client
                    );
                }
            }
        }
        Ok(())
    }

    fn idle_timeout(&self) -> Duration {
        let mut idle = Duration::from_secs(30);
        for inspector in &self.inspectors {
            if let Inspector::Dns(dns) = inspector {
                if let Some(hint) = dns.idle_hint {
                    idle = idle.min(Duration::from_secs(hint));
                }
            }
        }
        idle
    }
}

//----------- SessionError -----------------------------------------------------

/// A session-local failure.  Never propagated beyond the session boundary.
#[derive(Debug)]
pub enum SessionError {
    /// The origin side could not be established in time.
    Opening(String),

    /// A socket read or write failed.
    Transport(String),

    /// The interception pipeline failed.
    Tls(String),

    /// An endpoint disappeared mid-lifecycle.
    Gone,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opening(reason) => write!(f, "opening failed: {reason}"),
            Self::Transport(reason) => write!(f, "transport error: {reason}"),
            Self::Tls(reason) => write!(f, "TLS interception error: {reason}"),
            Self::Gone => f.write_str("endpoint is gone"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<TlsError> for SessionError {
    fn from(err: TlsError) -> Self {
        Self::Tls(err.to_string())
    }
}

//============ Tests ===========================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::center::testing::center_with;
    use crate::policy::profiles::ContentRule;
    use crate::policy::{NatMode, PolicyDb, PolicyRule};
    use std::sync::atomic::AtomicU64;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    pub(crate) fn accept_all_rule() -> PolicyRule {
        PolicyRule {
            proto: 0,
            src: Vec::new(),
            src_ports: Vec::new(),
            dst: Vec::new(),
            dst_ports: Vec::new(),
            action: PolicyAction::Accept,
            nat: NatMode::None,
            profiles: ProfileSet::default(),
            cnt_matches: AtomicU64::new(0),
        }
    }

    /// An origin that echoes one connection and quits.
    async fn spawn_echo_origin() -> SocketAddr {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = origin.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = origin.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                stream.write_all(&buf[..n]).await.unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn accepted_sessions_stream_end_to_end() {
        let db = PolicyDb {
            rules: vec![accept_all_rule()],
            ..Default::default()
        };
        let center = center_with(db);
        let origin_addr = spawn_echo_origin().await;

        let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
            stream.write_all(b"hello through the proxy").await.unwrap();
            let mut echoed = vec![0u8; 23];
            stream.read_exact(&mut echoed).await.unwrap();
            stream.shutdown().await.unwrap();
            echoed
        });

        let (stream, peer) = proxy.accept().await.unwrap();
        let session = Session::new_tcp(center.clone(), stream, peer, origin_addr);
        assert_eq!(session.state, SessionState::FreshAccept);
        tokio::spawn(session.run());

        let echoed = client.await.unwrap();
        assert_eq!(&echoed, b"hello through the proxy");
    }

    #[tokio::test]
    async fn empty_policy_denies_the_connection() {
        let center = center_with(PolicyDb::default());

        let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy.local_addr().unwrap();
        let origin_addr = spawn_echo_origin().await;

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
            let mut buf = [0u8; 16];
            // The proxy closes or resets without forwarding anything.
            matches!(stream.read(&mut buf).await, Ok(0) | Err(_))
        });

        let (stream, peer) = proxy.accept().await.unwrap();
        let session = Session::new_tcp(center, stream, peer, origin_addr);
        session.run().await;

        assert!(client.await.unwrap());
    }

    fn content_profile(rules: Vec<ContentRule>) -> ContentProfile {
        ContentProfile {
            name: "c".into(),
            write_payload: false,
            write_format: Default::default(),
            content_rules: rules,
        }
    }

    #[test]
    fn content_rules_replace_literals() {
        let profile = content_profile(vec![ContentRule {
            matching: "secret".into(),
            replace: "******".into(),
            fill_length: false,
            replace_each_nth: 0,
        }]);
        let mut counters = Vec::new();
        let mut chunk = BytesMut::from(&b"the secret is secret"[..]);
        apply_content_rules(&profile, &mut chunk, &mut counters);
        assert_eq!(&chunk[..], b"the ****** is ******");
    }

    #[test]
    fn fill_length_pads_short_replacements() {
        let profile = content_profile(vec![ContentRule {
            matching: "password".into(),
            replace: "x".into(),
            fill_length: true,
            replace_each_nth: 0,
        }]);
        let mut counters = Vec::new();
        let mut chunk = BytesMut::from(&b"password=abc"[..]);
        apply_content_rules(&profile, &mut chunk, &mut counters);
        assert_eq!(&chunk[..], b"x       =abc");
    }

    #[test]
    fn nth_counter_skips_occurrences() {
        let profile = content_profile(vec![ContentRule {
            matching: "a".into(),
            replace: "b".into(),
            fill_length: false,
            replace_each_nth: 2,
        }]);
        let mut counters = Vec::new();
        let mut chunk = BytesMut::from(&b"aaaa"[..]);
        apply_content_rules(&profile, &mut chunk, &mut counters);
        // Every second occurrence is rewritten; the counter carries over.
        assert_eq!(&chunk[..], b"abab");
    }
}
