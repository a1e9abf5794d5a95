//! Connection endpoints and their transport adapter.
//!
//! A `Com` hides whether bytes travel over plain TCP, an intercepted TLS
//! stream or a connected UDP socket; a `Cx` is one endpoint of a session
//! owning its transport, queued writes and per-endpoint flags.  Endpoints
//! reference their peer through the owning session, never directly.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use bytes::BytesMut;
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::TlsStream;

/// Default idle timeout of an endpoint.
pub const DEFAULT_IDLE: Duration = Duration::from_secs(600);

//----------- Com --------------------------------------------------------------

/// The transport below an endpoint.
pub enum Com {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    Udp(UdpSocket),
}

impl std::fmt::Debug for Com {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp(_) => f.write_str("Com::Tcp"),
            Self::Tls(_) => f.write_str("Com::Tls"),
            Self::Udp(_) => f.write_str("Com::Udp"),
        }
    }
}

impl Com {
    /// Read available bytes, growing `buf`.  Returns 0 at EOF.
    pub async fn read_buf(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.read_buf(buf).await,
            Self::Tls(stream) => stream.read_buf(buf).await,
            Self::Udp(socket) => socket.recv_buf(buf).await,
        }
    }

    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.write_all(data).await,
            Self::Tls(stream) => stream.write_all(data).await,
            Self::Udp(socket) => {
                socket.send(data).await?;
                Ok(())
            }
        }
    }

    /// Flush and close the write direction where the transport has one.
    pub async fn shutdown(&mut self) {
        match self {
            Self::Tcp(stream) => {
                let _ = stream.shutdown().await;
            }
            Self::Tls(stream) => {
                let _ = stream.shutdown().await;
            }
            Self::Udp(_) => {}
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(stream) => stream.peer_addr().ok(),
            Self::Tls(stream) => stream.get_ref().0.peer_addr().ok(),
            Self::Udp(socket) => socket.peer_addr().ok(),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(stream) => stream.local_addr().ok(),
            Self::Tls(stream) => stream.get_ref().0.local_addr().ok(),
            Self::Udp(socket) => socket.local_addr().ok(),
        }
    }

    /// Take the plain TCP stream back out for a TLS upgrade.
    pub fn into_tcp(self) -> Result<TcpStream, Self> {
        match self {
            Self::Tcp(stream) => Ok(stream),
            other => Err(other),
        }
    }
}

//----------- AppData ----------------------------------------------------------

/// Application-level data sniffed off a flow.
#[derive(Clone, Debug)]
pub enum AppData {
    Http(HttpRequestData),
    Dns { question: String },
}

impl AppData {
    /// The most useful link for the visited site.
    pub fn request(&self) -> String {
        match self {
            Self::Http(http) => http.request(),
            Self::Dns { question } => question.clone(),
        }
    }
}

/// The interesting parts of an HTTP request.
#[derive(Clone, Debug, Default)]
pub struct HttpRequestData {
    pub host: String,
    pub uri: String,
    pub params: String,
    pub referer: String,
    pub is_tls: bool,
}

impl HttpRequestData {
    /// Sniff request line, Host and Referer headers out of raw client data.
    pub fn sniff(data: &[u8], is_tls: bool) -> Option<Self> {
        let text = String::from_utf8_lossy(data);

        let re_get = Regex::new(r"(GET|POST) *([^ \r\n?]+)([^ \r\n]*)").unwrap();
        let re_host = Regex::new(r"Host: *([^ \r\n]+)").unwrap();
        let re_ref = Regex::new(r"Referer: *([^ \r\n]+)").unwrap();

        let caps = re_get.captures(&text)?;
        let mut request = Self {
            uri: caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
            params: caps.get(3).map(|m| m.as_str().to_string()).unwrap_or_default(),
            is_tls,
            ..Default::default()
        };
        if let Some(host) = re_host.captures(&text) {
            request.host = host[1].to_string();
        }
        if let Some(referer) = re_ref.captures(&text) {
            request.referer = referer[1].to_string();
        }
        Some(request)
    }

    pub fn proto(&self) -> &'static str {
        if self.is_tls {
            "https://"
        } else {
            "http://"
        }
    }

    pub fn request(&self) -> String {
        // The favicon is never what the user visited.
        if self.uri == "/favicon.ico" {
            return self.host.clone();
        }
        format!("{}{}{}{}", self.proto(), self.host, self.uri, self.params)
    }

    pub fn original_request(&self) -> String {
        if !self.referer.is_empty() {
            return self.referer.clone();
        }
        self.request()
    }
}

//----------- Cx ---------------------------------------------------------------

/// One endpoint of a session.
#[derive(Debug)]
pub struct Cx {
    pub com: Com,

    /// The remote endpoint as known at accept/connect time.
    pub host: IpAddr,
    pub port: u16,

    /// Bytes queued for this endpoint but not yet flushed.
    pub writebuf: BytesMut,

    pub app_data: Option<AppData>,

    pub error: bool,
    pub opening: bool,
    pub waiting_for_peercom: bool,

    pub idle_delay: Duration,

    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl Cx {
    pub fn new(com: Com, host: IpAddr, port: u16) -> Self {
        Self {
            com,
            host,
            port,
            writebuf: BytesMut::new(),
            app_data: None,
            error: false,
            opening: false,
            waiting_for_peercom: false,
            idle_delay: DEFAULT_IDLE,
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    /// Queue bytes for this endpoint.
    pub fn to_write(&mut self, data: &[u8]) {
        self.writebuf.extend_from_slice(data);
    }

    /// Flush everything queued.
    pub async fn flush(&mut self) -> io::Result<()> {
        if self.writebuf.is_empty() {
            return Ok(());
        }
        let data = self.writebuf.split();
        self.com.write_all(&data).await?;
        self.bytes_out += data.len() as u64;
        Ok(())
    }

    pub fn name(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_http_request_pieces() {
        let data = b"GET /index.html?q=1 HTTP/1.1\r\nHost: example.com\r\nReferer: http://other.test/\r\n\r\n";
        let request = HttpRequestData::sniff(data, false).unwrap();

        assert_eq!(request.host, "example.com");
        assert_eq!(request.uri, "/index.html");
        assert_eq!(request.params, "?q=1");
        assert_eq!(request.referer, "http://other.test/");
        assert_eq!(request.request(), "http://example.com/index.html?q=1");
        assert_eq!(request.original_request(), "http://other.test/");
    }

    #[test]
    fn favicon_is_reported_as_the_host() {
        let data = b"GET /favicon.ico HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let request = HttpRequestData::sniff(data, true).unwrap();
        assert_eq!(request.request(), "example.com");
        assert_eq!(request.proto(), "https://");
    }

    #[test]
    fn non_http_data_is_not_sniffed() {
        assert!(HttpRequestData::sniff(b"\x16\x03\x01\x02\x00", false).is_none());
    }
}
