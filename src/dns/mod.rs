//! DNS wire model.
//!
//! Parsing and building of DNS messages is delegated to `hickory-proto`;
//! this module adds the pieces the inspector and the caches need on top:
//! normalized question keys, the answer set with addresses and TTLs, the
//! packed wire bytes and the byte offsets of every answer TTL field (the
//! cached-response path patches TTLs in place).

use std::fmt;
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use hickory_proto::serialize::binary::BinDecodable;
use hickory_proto::ProtoError;

pub mod cache;

//----------- DnsWireError -----------------------------------------------------

/// A malformed DNS message.
#[derive(Debug)]
pub enum DnsWireError {
    /// The message could not be decoded.
    Proto(ProtoError),

    /// The message ended before a section did.
    Truncated,

    /// A response was expected but a query was found, or vice versa.
    UnexpectedKind,
}

impl fmt::Display for DnsWireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Proto(err) => write!(f, "malformed DNS message: {err}"),
            Self::Truncated => f.write_str("truncated DNS message"),
            Self::UnexpectedKind => f.write_str("unexpected DNS message kind"),
        }
    }
}

impl std::error::Error for DnsWireError {}

impl From<ProtoError> for DnsWireError {
    fn from(err: ProtoError) -> Self {
        Self::Proto(err)
    }
}

//----------- DnsQuestion ------------------------------------------------------

/// A normalized question.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DnsQuestion {
    /// Lowercase name without the trailing dot.
    pub name: String,

    pub qtype: RecordType,
}

impl DnsQuestion {
    /// The composite cache key, `"<RTYPE>:<QNAME>"`.
    pub fn cache_key(&self) -> String {
        format!("{}:{}", self.qtype, self.name)
    }
}

impl fmt::Display for DnsQuestion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.qtype, self.name)
    }
}

//----------- DnsRequest -------------------------------------------------------

/// A parsed query, as tracked per session by the DNS inspector.
#[derive(Clone, Debug)]
pub struct DnsRequest {
    pub id: u16,
    pub question: Option<DnsQuestion>,
}

impl DnsRequest {
    pub fn parse(raw: &[u8]) -> Result<Self, DnsWireError> {
        let msg = Message::from_bytes(raw)?;
        if msg.message_type() != MessageType::Query {
            return Err(DnsWireError::UnexpectedKind);
        }
        Ok(Self {
            id: msg.id(),
            question: msg.queries().first().map(question_of),
        })
    }
}

//----------- DnsAnswer --------------------------------------------------------

/// One address answer of a response.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DnsAnswer {
    pub rtype: RecordType,
    pub ip: IpAddr,
    pub ttl: u32,
}

//----------- DnsResponse ------------------------------------------------------

/// A parsed response together with its packed wire form.
///
/// `answers` holds only A/AAAA records; other record types are carried in
/// `raw` but not indexed.  `ttl_offsets` are byte offsets of the TTL field
/// of every answer-section record.
#[derive(Clone, Debug)]
pub struct DnsResponse {
    pub id: u16,
    pub question: Option<DnsQuestion>,
    pub answers: Vec<DnsAnswer>,
    pub raw: Vec<u8>,
    pub ttl_offsets: Vec<usize>,

    /// Unix timestamp of when this response was loaded into the cache.
    pub loaded_at: u64,
}

impl DnsResponse {
    pub fn parse(raw: &[u8]) -> Result<Self, DnsWireError> {
        let msg = Message::from_bytes(raw)?;
        if msg.message_type() != MessageType::Response {
            return Err(DnsWireError::UnexpectedKind);
        }

        let mut answers = Vec::new();
        for record in msg.answers() {
            match record.data() {
                RData::A(a) => answers.push(DnsAnswer {
                    rtype: RecordType::A,
                    ip: IpAddr::V4(a.0),
                    ttl: record.ttl(),
                }),
                RData::AAAA(aaaa) => answers.push(DnsAnswer {
                    rtype: RecordType::AAAA,
                    ip: IpAddr::V6(aaaa.0),
                    ttl: record.ttl(),
                }),
                _ => {}
            }
        }

        Ok(Self {
            id: msg.id(),
            question: msg.queries().first().map(question_of),
            answers,
            ttl_offsets: answer_ttl_offsets(raw)?,
            raw: raw.to_vec(),
            loaded_at: unix_now(),
        })
    }

    /// The composite cache key of the question.
    pub fn cache_key(&self) -> Option<String> {
        self.question.as_ref().map(|q| q.cache_key())
    }

    /// Whether any answer carries an address.
    pub fn has_address(&self) -> bool {
        !self.answers.is_empty()
    }

    /// The smallest answer TTL.
    pub fn min_ttl(&self) -> Option<u32> {
        self.answers.iter().map(|a| a.ttl).min()
    }

    /// Whether the entry is still fresh at `now`.
    ///
    /// An entry with no address answers is never fresh.
    pub fn is_fresh(&self, now: u64) -> bool {
        match self.min_ttl() {
            Some(ttl) => now.saturating_sub(self.loaded_at) <= u64::from(ttl),
            None => false,
        }
    }

    /// Addresses of the given family.
    pub fn addresses(&self, want_v6: bool) -> Vec<IpAddr> {
        self.answers
            .iter()
            .filter(|a| a.ip.is_ipv6() == want_v6)
            .map(|a| a.ip)
            .collect()
    }
}

fn question_of(query: &Query) -> DnsQuestion {
    DnsQuestion {
        name: normalize_name(&query.name().to_utf8()),
        qtype: query.query_type(),
    }
}

//----------- Wire helpers -----------------------------------------------------

/// Lowercase and strip the trailing dot.
pub fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// Split an FQDN into its two-label parent domain and the subdomain rest.
///
/// `a.b.example.com` becomes `("example.com", "a.b")`.  Names of two or
/// fewer labels have no subdomain part and yield `None`.
pub fn split_fqdn_subdomain(fqdn: &str) -> Option<(String, String)> {
    let labels: Vec<&str> = fqdn.split('.').filter(|l| !l.is_empty()).collect();
    if labels.len() <= 2 {
        return None;
    }
    let (sub, parent) = labels.split_at(labels.len() - 2);
    Some((parent.join("."), sub.join(".")))
}

/// Walk past a possibly compressed name, returning the following offset.
fn skip_name(raw: &[u8], mut pos: usize) -> Result<usize, DnsWireError> {
    loop {
        let len = *raw.get(pos).ok_or(DnsWireError::Truncated)? as usize;
        if len == 0 {
            return Ok(pos + 1);
        }
        if len & 0xC0 == 0xC0 {
            // A compression pointer terminates the name.
            if pos + 2 > raw.len() {
                return Err(DnsWireError::Truncated);
            }
            return Ok(pos + 2);
        }
        pos += 1 + len;
    }
}

/// Byte offsets of the TTL field of every answer-section record.
pub fn answer_ttl_offsets(raw: &[u8]) -> Result<Vec<usize>, DnsWireError> {
    if raw.len() < 12 {
        return Err(DnsWireError::Truncated);
    }
    let qdcount = u16::from_be_bytes([raw[4], raw[5]]) as usize;
    let ancount = u16::from_be_bytes([raw[6], raw[7]]) as usize;

    let mut pos = 12;
    for _ in 0..qdcount {
        pos = skip_name(raw, pos)?;
        pos += 4; // qtype + qclass
        if pos > raw.len() {
            return Err(DnsWireError::Truncated);
        }
    }

    let mut offsets = Vec::with_capacity(ancount);
    for _ in 0..ancount {
        pos = skip_name(raw, pos)?;
        // type (2) + class (2) precede the TTL.
        if pos + 10 > raw.len() {
            return Err(DnsWireError::Truncated);
        }
        offsets.push(pos + 4);
        let rdlength = u16::from_be_bytes([raw[pos + 8], raw[pos + 9]]) as usize;
        pos += 10 + rdlength;
        if pos > raw.len() {
            return Err(DnsWireError::Truncated);
        }
    }
    Ok(offsets)
}

/// Build the wire form of a simple recursive query.
pub fn build_query(id: u16, fqdn: &str, rtype: RecordType) -> Result<Vec<u8>, DnsWireError> {
    let name = Name::from_utf8(fqdn)?;
    let mut msg = Message::new();
    msg.set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, rtype));
    Ok(msg.to_vec()?)
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

//============ Tests ===========================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{DNSClass, Record};

    pub(crate) fn a_response(id: u16, name: &str, ips: &[(&str, u32)]) -> Vec<u8> {
        let qname = Name::from_utf8(name).unwrap();
        let mut msg = Message::new();
        msg.set_id(id)
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .set_recursion_available(true)
            .add_query(Query::query(qname.clone(), RecordType::A));
        for (ip, ttl) in ips {
            let mut record = Record::from_rdata(
                qname.clone(),
                *ttl,
                RData::A(A(ip.parse().unwrap())),
            );
            record.set_dns_class(DNSClass::IN);
            msg.add_answer(record);
        }
        msg.to_vec().unwrap()
    }

    #[test]
    fn parses_answers_and_question() {
        let raw = a_response(0x1234, "foo.test.", &[("1.2.3.4", 300)]);
        let resp = DnsResponse::parse(&raw).unwrap();

        assert_eq!(resp.id, 0x1234);
        let q = resp.question.as_ref().unwrap();
        assert_eq!(q.name, "foo.test");
        assert_eq!(q.qtype, RecordType::A);
        assert_eq!(resp.cache_key().unwrap(), "A:foo.test");
        assert_eq!(resp.answers.len(), 1);
        assert_eq!(resp.answers[0].ip, "1.2.3.4".parse::<IpAddr>().unwrap());
        assert_eq!(resp.answers[0].ttl, 300);
    }

    #[test]
    fn ttl_offsets_point_at_ttl_fields() {
        let raw = a_response(7, "foo.test.", &[("1.2.3.4", 300), ("5.6.7.8", 60)]);
        let resp = DnsResponse::parse(&raw).unwrap();

        assert_eq!(resp.ttl_offsets.len(), 2);
        for (offset, expected) in resp.ttl_offsets.iter().zip([300u32, 60]) {
            let ttl = u32::from_be_bytes(raw[*offset..*offset + 4].try_into().unwrap());
            assert_eq!(ttl, expected);
        }
    }

    #[test]
    fn freshness_follows_min_ttl() {
        let raw = a_response(7, "foo.test.", &[("1.2.3.4", 300), ("5.6.7.8", 60)]);
        let mut resp = DnsResponse::parse(&raw).unwrap();
        resp.loaded_at = 1_000;

        assert_eq!(resp.min_ttl(), Some(60));
        assert!(resp.is_fresh(1_000 + 60));
        assert!(!resp.is_fresh(1_000 + 61));
    }

    #[test]
    fn request_round_trip() {
        let raw = build_query(0xBEEF, "foo.test", RecordType::A).unwrap();
        let req = DnsRequest::parse(&raw).unwrap();
        assert_eq!(req.id, 0xBEEF);
        assert_eq!(req.question.unwrap().cache_key(), "A:foo.test");
    }

    #[test]
    fn response_is_not_a_request() {
        let raw = a_response(1, "foo.test.", &[("1.2.3.4", 30)]);
        assert!(DnsRequest::parse(&raw).is_err());
    }

    #[test]
    fn splits_subdomains_off_two_label_parents() {
        assert_eq!(
            split_fqdn_subdomain("a.b.example.com"),
            Some(("example.com".into(), "a.b".into()))
        );
        assert_eq!(
            split_fqdn_subdomain("www.example.com"),
            Some(("example.com".into(), "www".into()))
        );
        assert_eq!(split_fqdn_subdomain("example.com"), None);
        assert_eq!(split_fqdn_subdomain("com"), None);
    }
}
