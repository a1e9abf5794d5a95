//! The SOCKS acceptor.
//!
//! Implements the server side of SOCKS v4 and v5: greeting, request
//! decoding, optional asynchronous FQDN resolution over a fresh UDP socket,
//! the policy round-trip, the reply, and finally the hand-off of the
//! prepared endpoint pair into a regular session.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use bytes::BytesMut;
use hickory_proto::rr::RecordType;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::center::Center;
use crate::dns::{build_query, DnsResponse};
use crate::policy::{EndpointInfo, PolicyAction};
use crate::session::cx::{Com, Cx};
use crate::session::Session;
use std::sync::Arc;

/// How long a single DNS exchange may take.
const DNS_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the client has to complete greeting and request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

//----------- SocksState -------------------------------------------------------

/// Protocol states of the acceptor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SocksState {
    Init,
    HelloSent,
    WaitRequest,
    ReqReceived,
    DnsQuerySent,
    WaitPolicy,
    PolicyReceived,
    ReqresSent,
    Handoff,
}

//----------- SocksError -------------------------------------------------------

#[derive(Debug)]
pub enum SocksError {
    /// The client spoke something that is not SOCKS 4/5.
    Protocol(String),

    /// The requested name could not be resolved.
    Resolve(String),

    /// Socket trouble.
    Io(String),
}

impl fmt::Display for SocksError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(reason) => write!(f, "SOCKS protocol error: {reason}"),
            Self::Resolve(reason) => write!(f, "SOCKS resolution failed: {reason}"),
            Self::Io(reason) => write!(f, "SOCKS I/O error: {reason}"),
        }
    }
}

impl std::error::Error for SocksError {}

impl From<std::io::Error> for SocksError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

//----------- Request codec ----------------------------------------------------

/// The decoded target of a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocksTarget {
    Ip(IpAddr),
    Fqdn(String),
}

/// A decoded CONNECT request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SocksRequest {
    pub version: u8,
    pub target: SocksTarget,
    pub port: u16,
}

/// Decode a v5 method-selection hello.
///
/// Returns the number of consumed bytes, or `None` while incomplete.
pub fn decode_hello(buf: &[u8]) -> Result<Option<usize>, SocksError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let nmethods = buf[1] as usize;
    if buf.len() < 2 + nmethods {
        return Ok(None);
    }
    Ok(Some(2 + nmethods))
}

/// Decode a v4 or v5 CONNECT request.
///
/// Returns `None` while the request is still incomplete.
pub fn decode_request(buf: &[u8]) -> Result<Option<SocksRequest>, SocksError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let version = buf[0];

    match version {
        5 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let atype = buf[3];
            match atype {
                // IPv4.
                1 => {
                    let ip: [u8; 4] = buf[4..8].try_into().unwrap();
                    let port = u16::from_be_bytes([buf[8], buf[9]]);
                    Ok(Some(SocksRequest {
                        version,
                        target: SocksTarget::Ip(IpAddr::from(ip)),
                        port,
                    }))
                }
                // FQDN.
                3 => {
                    let len = buf[4] as usize;
                    if buf.len() < 5 + len + 2 {
                        return Ok(None);
                    }
                    let name = std::str::from_utf8(&buf[5..5 + len])
                        .map_err(|_| SocksError::Protocol("non-UTF-8 domain name".into()))?;
                    let port = u16::from_be_bytes([buf[5 + len], buf[5 + len + 1]]);
                    Ok(Some(SocksRequest {
                        version,
                        target: SocksTarget::Fqdn(name.to_ascii_lowercase()),
                        port,
                    }))
                }
                other => Err(SocksError::Protocol(format!(
                    "unsupported address type {other}"
                ))),
            }
        }
        4 => {
            if buf.len() < 8 {
                return Ok(None);
            }
            let port = u16::from_be_bytes([buf[2], buf[3]]);
            let ip: [u8; 4] = buf[4..8].try_into().unwrap();
            Ok(Some(SocksRequest {
                version,
                target: SocksTarget::Ip(IpAddr::from(ip)),
                port,
            }))
        }
        other => Err(SocksError::Protocol(format!(
            "unsupported version {other}"
        ))),
    }
}

/// Assemble the reply for a decoded request.
pub fn encode_reply(request: &SocksRequest, accept: bool) -> Vec<u8> {
    match request.version {
        5 => {
            let mut reply = vec![5, if accept { 0x00 } else { 0x02 }, 0];
            match &request.target {
                SocksTarget::Ip(IpAddr::V4(ip)) => {
                    reply.push(1);
                    reply.extend_from_slice(&ip.octets());
                }
                SocksTarget::Ip(IpAddr::V6(ip)) => {
                    reply.push(4);
                    reply.extend_from_slice(&ip.octets());
                }
                SocksTarget::Fqdn(name) => {
                    reply.push(3);
                    reply.push(name.len() as u8);
                    reply.extend_from_slice(name.as_bytes());
                }
            }
            reply.extend_from_slice(&request.port.to_be_bytes());
            reply
        }
        _ => {
            let mut reply = vec![0, if accept { 90 } else { 91 }];
            reply.extend_from_slice(&request.port.to_be_bytes());
            match &request.target {
                SocksTarget::Ip(IpAddr::V4(ip)) => reply.extend_from_slice(&ip.octets()),
                _ => reply.extend_from_slice(&[0, 0, 0, 0]),
            }
            reply
        }
    }
}

/// Pick one of the returned addresses for simple load spreading.
pub fn choose_server_ip(candidates: &[IpAddr]) -> Option<IpAddr> {
    match candidates.len() {
        0 => None,
        1 => Some(candidates[0]),
        n => Some(candidates[rand::thread_rng().gen_range(0..n)]),
    }
}

//----------- SocksAcceptor ----------------------------------------------------

pub struct SocksAcceptor {
    center: Arc<Center>,
    pub state: SocksState,
    pub matched_policy: Option<usize>,

    async_dns: bool,
    prefer_ipv6: bool,
    mixed_ip_versions: bool,
}

impl SocksAcceptor {
    pub fn new(center: Arc<Center>) -> Self {
        let (async_dns, prefer_ipv6, mixed_ip_versions) = {
            let config = center.config.lock().unwrap();
            (
                config.socks.async_dns,
                config.socks.prefer_ipv6,
                config.socks.mixed_ip_versions,
            )
        };
        Self {
            center,
            state: SocksState::Init,
            matched_policy: None,
            async_dns,
            prefer_ipv6,
            mixed_ip_versions,
        }
    }

    /// Serve one accepted SOCKS client to the point of hand-off.
    pub async fn run(mut self, mut stream: TcpStream, client: SocketAddr) {
        match timeout(REQUEST_TIMEOUT, self.negotiate(&mut stream, client)).await {
            Ok(Ok(Some((request, target)))) => {
                self.state = SocksState::Handoff;
                let left = Cx::new(Com::Tcp(stream), client.ip(), client.port());
                let session = Session::from_handoff(
                    self.center.clone(),
                    left,
                    None,
                    target,
                    self.matched_policy,
                );
                debug!(
                    "socks: {client} handed off toward {target} (request {:?})",
                    request.target
                );
                session.run().await;
            }
            Ok(Ok(None)) => {
                debug!("socks: {client} denied or unresolved");
            }
            Ok(Err(err)) => {
                warn!("socks: {client}: {err}");
            }
            Err(_) => {
                debug!("socks: {client} timed out negotiating");
            }
        }
    }

    async fn negotiate(
        &mut self,
        stream: &mut TcpStream,
        client: SocketAddr,
    ) -> Result<Option<(SocksRequest, SocketAddr)>, SocksError> {
        let mut buf = BytesMut::with_capacity(512);

        // Greeting.  v4 clients send their request directly.
        loop {
            if stream.read_buf(&mut buf).await? == 0 {
                return Err(SocksError::Protocol("client closed during greeting".into()));
            }
            match buf.first() {
                Some(5) => {
                    if let Some(consumed) = decode_hello(&buf)? {
                        // Always select "no authentication".
                        stream.write_all(&[5, 0]).await?;
                        let _ = buf.split_to(consumed);
                        self.state = SocksState::WaitRequest;
                        break;
                    }
                }
                Some(4) => {
                    self.state = SocksState::WaitRequest;
                    break;
                }
                Some(other) => {
                    return Err(SocksError::Protocol(format!(
                        "unsupported version {other}"
                    )));
                }
                None => {}
            }
        }

        // Request.
        let request = loop {
            if let Some(request) = decode_request(&buf)? {
                self.state = SocksState::ReqReceived;
                break request;
            }
            if stream.read_buf(&mut buf).await? == 0 {
                return Err(SocksError::Protocol("client closed during request".into()));
            }
        };

        // Target resolution.
        let target_ip = match &request.target {
            SocksTarget::Ip(ip) => *ip,
            SocksTarget::Fqdn(name) => {
                // Some implementations use the FQDN type for literal
                // addresses.
                if let Ok(ip) = name.parse::<IpAddr>() {
                    ip
                } else {
                    match self.resolve(name).await {
                        Some(ip) => ip,
                        None => {
                            warn!("socks: no address found for '{name}'");
                            let reply = encode_reply(&request, false);
                            let _ = stream.write_all(&reply).await;
                            return Ok(None);
                        }
                    }
                }
            }
        };
        let target = SocketAddr::new(target_ip, request.port);

        // Policy.
        self.state = SocksState::WaitPolicy;
        let db = self.center.policy.load_full();
        let left = [EndpointInfo {
            proto: 6,
            ip: client.ip(),
            port: client.port(),
        }];
        let right = [EndpointInfo {
            proto: 6,
            ip: target.ip(),
            port: target.port(),
        }];
        self.matched_policy = db.matched(&left, &right, &self.center.dns_cache);
        let accept = db.action(self.matched_policy) == PolicyAction::Accept;
        self.state = SocksState::PolicyReceived;

        // Reply, flush completely before handing off.
        let reply = encode_reply(&request, accept);
        stream.write_all(&reply).await?;
        stream.flush().await?;
        self.state = SocksState::ReqresSent;

        if !accept {
            info!("socks: {client} -> {target} denied by policy");
            return Ok(None);
        }

        Ok(Some((request, target)))
    }

    /// Resolve an FQDN: consult the cache, otherwise query the configured
    /// nameserver, with mixed-family fallback if enabled.
    async fn resolve(&mut self, fqdn: &str) -> Option<IpAddr> {
        let first_v6 = self.prefer_ipv6;

        let cached = self.center.dns_cache.resolved(fqdn, first_v6);
        if !cached.is_empty() {
            debug!("socks: '{fqdn}' answered from cache");
            return choose_server_ip(&cached);
        }

        let candidates = self.query_dns(fqdn, first_v6).await;
        if !candidates.is_empty() {
            return choose_server_ip(&candidates);
        }

        if self.mixed_ip_versions {
            debug!("socks: '{fqdn}' retrying with other address family");
            let candidates = self.query_dns(fqdn, !first_v6).await;
            if !candidates.is_empty() {
                return choose_server_ip(&candidates);
            }
        }

        None
    }

    fn nameserver(&self) -> SocketAddr {
        let config = self.center.config.lock().unwrap();
        let ip = config
            .nameservers
            .first()
            .copied()
            .unwrap_or_else(|| "1.1.1.1".parse().expect("literal address"));
        SocketAddr::new(ip, 53)
    }

    /// One DNS exchange over a fresh UDP socket.
    ///
    /// Successful responses feed the DNS cache and the domain tree.
    async fn query_dns(&mut self, fqdn: &str, want_v6: bool) -> Vec<IpAddr> {
        let rtype = if want_v6 {
            RecordType::AAAA
        } else {
            RecordType::A
        };
        let nameserver = self.nameserver();

        let id: u16 = rand::random();
        let query = match build_query(id, fqdn, rtype) {
            Ok(query) => query,
            Err(err) => {
                warn!("socks: cannot build query for '{fqdn}': {err}");
                return Vec::new();
            }
        };
        self.state = SocksState::DnsQuerySent;

        let result = if self.async_dns {
            let exchange = async {
                let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
                socket.connect(nameserver).await?;
                socket.send(&query).await?;

                let mut buf = vec![0u8; 4096];
                let n = socket.recv(&mut buf).await?;
                Ok::<_, std::io::Error>(buf[..n].to_vec())
            };
            match timeout(DNS_TIMEOUT, exchange).await {
                Ok(result) => result,
                Err(_) => Err(std::io::Error::from(std::io::ErrorKind::TimedOut)),
            }
        } else {
            // Synchronous resolution holds a blocking thread for the
            // whole exchange.
            tokio::task::spawn_blocking(move || {
                let socket = std::net::UdpSocket::bind(("0.0.0.0", 0))?;
                socket.set_read_timeout(Some(DNS_TIMEOUT))?;
                socket.connect(nameserver)?;
                socket.send(&query)?;

                let mut buf = vec![0u8; 4096];
                let n = socket.recv(&mut buf)?;
                Ok::<_, std::io::Error>(buf[..n].to_vec())
            })
            .await
            .unwrap_or_else(|e| Err(std::io::Error::other(e.to_string())))
        };

        let raw = match result {
            Ok(raw) => raw,
            Err(err) => {
                warn!("socks: DNS exchange for '{fqdn}' failed: {err}");
                return Vec::new();
            }
        };

        let response = match DnsResponse::parse(&raw) {
            Ok(response) if response.id == id => response,
            Ok(response) => {
                warn!(
                    "socks: DNS response id 0x{:x} does not match query 0x{id:x}",
                    response.id
                );
                return Vec::new();
            }
            Err(err) => {
                warn!("socks: malformed DNS response for '{fqdn}': {err}");
                return Vec::new();
            }
        };

        let candidates = response.addresses(want_v6);
        if response.has_address() {
            if let Some(question) = &response.question {
                self.center.domain_tree.record(&question.name);
            }
            self.center.dns_cache.store(response);
        }
        candidates
    }
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v5_hello_waits_for_all_methods() {
        assert_eq!(decode_hello(&[5]).unwrap(), None);
        assert_eq!(decode_hello(&[5, 2, 0]).unwrap(), None);
        assert_eq!(decode_hello(&[5, 2, 0, 2]).unwrap(), Some(4));
    }

    #[test]
    fn v5_ipv4_request_decodes() {
        let buf = [5, 1, 0, 1, 93, 184, 216, 34, 0x01, 0xBB];
        let request = decode_request(&buf).unwrap().unwrap();
        assert_eq!(request.version, 5);
        assert_eq!(
            request.target,
            SocksTarget::Ip("93.184.216.34".parse().unwrap())
        );
        assert_eq!(request.port, 443);
    }

    #[test]
    fn v5_fqdn_request_decodes_and_waits() {
        let mut buf = vec![5, 1, 0, 3, 8];
        buf.extend_from_slice(b"foo.test");
        // Port still missing.
        assert_eq!(decode_request(&buf).unwrap(), None);

        buf.extend_from_slice(&443u16.to_be_bytes());
        let request = decode_request(&buf).unwrap().unwrap();
        assert_eq!(request.target, SocksTarget::Fqdn("foo.test".into()));
        assert_eq!(request.port, 443);
    }

    #[test]
    fn v4_request_decodes() {
        let buf = [4, 1, 0, 80, 10, 0, 0, 1];
        let request = decode_request(&buf).unwrap().unwrap();
        assert_eq!(request.version, 4);
        assert_eq!(request.target, SocksTarget::Ip("10.0.0.1".parse().unwrap()));
        assert_eq!(request.port, 80);
    }

    #[test]
    fn unsupported_versions_and_atypes_error() {
        assert!(decode_request(&[6, 1]).is_err());
        assert!(decode_request(&[5, 1, 0, 4, 0, 0, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn v5_replies_carry_status_and_target() {
        let request = SocksRequest {
            version: 5,
            target: SocksTarget::Fqdn("foo.test".into()),
            port: 443,
        };
        let accept = encode_reply(&request, true);
        assert_eq!(accept[0], 5);
        assert_eq!(accept[1], 0x00);
        assert_eq!(accept[3], 3);
        assert_eq!(accept[4] as usize, "foo.test".len());
        assert_eq!(&accept[5..13], b"foo.test");
        assert_eq!(&accept[13..15], &443u16.to_be_bytes());

        let deny = encode_reply(&request, false);
        assert_eq!(deny[1], 0x02);
    }

    #[test]
    fn v4_replies_use_90_and_91() {
        let request = SocksRequest {
            version: 4,
            target: SocksTarget::Ip("10.0.0.1".parse().unwrap()),
            port: 80,
        };
        assert_eq!(encode_reply(&request, true)[1], 90);
        assert_eq!(encode_reply(&request, false)[1], 91);
    }

    #[test]
    fn server_ip_choice_covers_all_candidates() {
        assert_eq!(choose_server_ip(&[]), None);

        let candidates: Vec<IpAddr> =
            vec!["1.1.1.1".parse().unwrap(), "2.2.2.2".parse().unwrap()];
        for _ in 0..32 {
            let chosen = choose_server_ip(&candidates).unwrap();
            assert!(candidates.contains(&chosen));
        }
    }

    #[tokio::test]
    async fn v5_fqdn_connect_round_trip_from_cache() {
        use crate::center::testing::center_with;
        use crate::dns::tests::a_response;
        use crate::policy::PolicyDb;
        use crate::session::tests::accept_all_rule;
        use tokio::net::TcpListener;

        let db = PolicyDb {
            rules: vec![accept_all_rule()],
            ..Default::default()
        };
        let center = center_with(db);

        // The target name resolves through the DNS cache, so no query goes
        // out.
        center
            .dns_cache
            .store(DnsResponse::parse(&a_response(1, "foo.test.", &[("127.0.0.1", 300)])).unwrap());

        // An origin that echoes one connection.
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_port = origin.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = origin.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).await.unwrap();
            stream.write_all(&buf[..n]).await.unwrap();
        });

        let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(proxy_addr).await.unwrap();

            // Greeting: v5, one method, no authentication.
            stream.write_all(&[5, 1, 0]).await.unwrap();
            let mut hello = [0u8; 2];
            stream.read_exact(&mut hello).await.unwrap();
            assert_eq!(hello, [5, 0]);

            // CONNECT foo.test:<origin_port>.
            let mut request = vec![5, 1, 0, 3, 8];
            request.extend_from_slice(b"foo.test");
            request.extend_from_slice(&origin_port.to_be_bytes());
            stream.write_all(&request).await.unwrap();

            let mut reply = [0u8; 15];
            stream.read_exact(&mut reply).await.unwrap();
            assert_eq!(reply[0], 5);
            assert_eq!(reply[1], 0x00);
            assert_eq!(reply[3], 3);

            // Proxied payload.
            stream.write_all(b"ping").await.unwrap();
            let mut echoed = [0u8; 4];
            stream.read_exact(&mut echoed).await.unwrap();
            echoed
        });

        let (stream, peer) = proxy.accept().await.unwrap();
        let acceptor = SocksAcceptor::new(center);
        tokio::spawn(acceptor.run(stream, peer));

        let echoed = client.await.unwrap();
        assert_eq!(&echoed, b"ping");
    }
}
