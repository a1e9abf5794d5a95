//! The DNS application-level gateway.
//!
//! Attached when the session's destination port is a DNS port.  Client-side
//! queries are tracked per session; if a fresh cached answer exists and the
//! profile allows it, the inspector synthesizes the response itself and the
//! origin side is closed.  Server-side responses must match a pending query
//! or the session is torn down.

use bytes::BytesMut;
use tracing::{debug, warn};

use crate::dns::{unix_now, DnsRequest, DnsResponse};
use crate::inspect::{InspectServices, Verdict};
use crate::policy::profiles::AlgDnsProfile;
use crate::session::flow::Side;
use hickory_proto::rr::RecordType;
use std::sync::Arc;

/// The well-known DNS port.
pub const DNS_PORT: u16 = 53;

/// Idle delay granted to a flow that still has DNS exchanges pending.
pub const DNS_IDLE_TCP: u64 = 30;

/// Idle delay for a resolved UDP exchange.
pub const DNS_IDLE_UDP: u64 = 1;

//----------- CachedReply ------------------------------------------------------

/// A synthesized response prepared for the originating side.
#[derive(Clone, Debug)]
struct CachedReply {
    bytes: Vec<u8>,
    id: u16,
    ttl_offsets: Vec<usize>,
    decrement: u32,
}

//----------- DnsInspector -----------------------------------------------------

#[derive(Debug)]
pub struct DnsInspector {
    opts: Arc<AlgDnsProfile>,

    is_tcp: bool,
    in_progress: bool,

    /// Pending queries by transaction id, replaced on re-sent requests.
    requests: foldhash::HashMap<u16, DnsRequest>,

    /// Rewritten id on the wire -> original client id (randomize_id).
    id_map: foldhash::HashMap<u16, u16>,

    responses_seen: usize,
    stored: bool,

    cached_reply: Option<CachedReply>,

    /// A suggested idle delay for the session, refreshed per exchange.
    pub idle_hint: Option<u64>,
}

impl DnsInspector {
    pub fn new(opts: Arc<AlgDnsProfile>, is_tcp: bool) -> Self {
        Self {
            opts,
            is_tcp,
            in_progress: false,
            requests: Default::default(),
            id_map: Default::default(),
            responses_seen: 0,
            stored: false,
            cached_reply: None,
            idle_hint: None,
        }
    }

    pub fn interested(dst_port: u16) -> bool {
        dst_port == DNS_PORT
    }

    /// Once a cached verdict is prepared there is nothing further to do.
    pub fn completed(&self) -> bool {
        self.cached_reply.is_some()
    }

    /// Strip the TCP two-byte length prefix, if applicable.
    ///
    /// Returns `None` while the message is still incomplete.
    fn payload_range(&self, chunk: &[u8]) -> Option<(usize, usize)> {
        if !self.is_tcp {
            return Some((0, chunk.len()));
        }
        if chunk.len() < 2 {
            return None;
        }
        let want = u16::from_be_bytes([chunk[0], chunk[1]]) as usize;
        if chunk.len() < 2 + want {
            debug!(
                "dns: tcp stream has {} of {} expected bytes, waiting",
                chunk.len().saturating_sub(2),
                want
            );
            return None;
        }
        Some((2, 2 + want))
    }

    pub fn update(
        &mut self,
        side: Side,
        chunk: &mut BytesMut,
        services: &InspectServices<'_>,
    ) -> Verdict {
        self.in_progress = true;

        let Some((start, end)) = self.payload_range(chunk) else {
            return Verdict::Continue;
        };

        match side {
            Side::Left => self.on_request(start, end, chunk, services),
            Side::Right => self.on_response(start, end, chunk, services),
        }
    }

    fn on_request(
        &mut self,
        start: usize,
        end: usize,
        chunk: &mut BytesMut,
        services: &InspectServices<'_>,
    ) -> Verdict {
        let request = match DnsRequest::parse(&chunk[start..end]) {
            Ok(request) => request,
            Err(err) => {
                warn!("dns: dropping flow with malformed query: {err}");
                return Verdict::Block;
            }
        };

        if self.requests.contains_key(&request.id) {
            debug!("dns: detected re-sent request 0x{:x}", request.id);
        }
        let client_id = request.id;
        let question = request.question.clone();
        self.requests.insert(client_id, request);
        self.idle_hint = Some(DNS_IDLE_TCP);

        if self.opts.randomize_id {
            let wire_id: u16 = rand::random();
            self.id_map.insert(wire_id, client_id);
            chunk[start..start + 2].copy_from_slice(&wire_id.to_be_bytes());
        }

        if self.opts.cached_responses {
            if let Some(question) = question {
                if matches!(question.qtype, RecordType::A | RecordType::AAAA) {
                    // Lookup already enforces freshness; the TTL decrement
                    // below is therefore never larger than any answer TTL.
                    if let Some(entry) = services.dns_cache.lookup(&question.cache_key()) {
                        let now = unix_now();
                        debug!("dns: answer for {question} served from cache");
                        self.cached_reply = Some(CachedReply {
                            bytes: entry.raw.clone(),
                            id: client_id,
                            ttl_offsets: entry.ttl_offsets.clone(),
                            decrement: now.saturating_sub(entry.loaded_at) as u32,
                        });
                        return Verdict::Cached;
                    }
                    debug!("dns: answer for {question} is not in cache");
                }
            }
        }

        Verdict::Continue
    }

    fn on_response(
        &mut self,
        start: usize,
        end: usize,
        chunk: &mut BytesMut,
        services: &InspectServices<'_>,
    ) -> Verdict {
        let mut response = match DnsResponse::parse(&chunk[start..end]) {
            Ok(response) => response,
            Err(err) => {
                warn!("dns: dropping flow with malformed response: {err}");
                return Verdict::Block;
            }
        };

        // Undo id randomization before validating against pending queries.
        if self.opts.randomize_id {
            if let Some(client_id) = self.id_map.remove(&response.id) {
                chunk[start..start + 2].copy_from_slice(&client_id.to_be_bytes());
                response.id = client_id;
            }
        }

        if !self.validate_response(&response) {
            warn!(
                "dns: cannot find corresponding request id 0x{:x}, dropping connection",
                response.id
            );
            return Verdict::Block;
        }

        self.responses_seen += 1;
        self.requests.remove(&response.id);
        self.idle_hint = Some(if self.is_tcp { DNS_IDLE_TCP } else { DNS_IDLE_UDP });

        if self.store(response, services) {
            self.stored = true;
        }

        Verdict::Continue
    }

    fn validate_response(&self, response: &DnsResponse) -> bool {
        if self.requests.contains_key(&response.id) {
            debug!("dns: request 0x{:x} found", response.id);
            true
        } else {
            debug!("dns: request 0x{:x} not found", response.id);
            false
        }
    }

    /// Store an interesting response in the cache and the domain tree.
    ///
    /// Only responses carrying address answers are interesting.
    fn store(&self, response: DnsResponse, services: &InspectServices<'_>) -> bool {
        if !response.has_address() {
            if let Some(q) = &response.question {
                debug!("dns: non-address response for {q}");
            }
            return false;
        }

        if let Some(question) = response.question.clone() {
            services.domain_tree.record(&question.name);
            services.dns_cache.store(response);
            debug!(
                "dns: {} added to cache ({} entries)",
                question,
                services.dns_cache.len()
            );
        }
        true
    }

    /// Produce the synthesized response for the originating side.
    ///
    /// The transaction id is rewritten to the client's and every TTL field
    /// is decremented by the cache age.  TCP flows get the length prefix
    /// re-applied.
    pub fn apply_verdict(&self) -> Option<Vec<u8>> {
        let reply = self.cached_reply.as_ref()?;

        let mut bytes = reply.bytes.clone();
        if bytes.len() < 2 {
            return None;
        }
        bytes[0..2].copy_from_slice(&reply.id.to_be_bytes());

        for &offset in &reply.ttl_offsets {
            if offset + 4 > bytes.len() {
                return None;
            }
            let original = u32::from_be_bytes(bytes[offset..offset + 4].try_into().ok()?);
            let decremented = original.saturating_sub(reply.decrement);
            bytes[offset..offset + 4].copy_from_slice(&decremented.to_be_bytes());
        }

        if self.is_tcp {
            let mut framed = Vec::with_capacity(bytes.len() + 2);
            framed.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
            framed.extend_from_slice(&bytes);
            Some(framed)
        } else {
            Some(bytes)
        }
    }

    /// Counters for diagnostics output.
    pub fn stats(&self) -> (usize, usize, bool) {
        (self.requests.len(), self.responses_seen, self.stored)
    }
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::cache::{DnsCache, DomainTree};
    use crate::dns::{build_query, tests::a_response};

    fn services<'a>(cache: &'a DnsCache, tree: &'a DomainTree) -> InspectServices<'a> {
        InspectServices {
            dns_cache: cache,
            domain_tree: tree,
        }
    }

    fn profile(cached_responses: bool) -> Arc<AlgDnsProfile> {
        Arc::new(AlgDnsProfile {
            name: "dns".into(),
            match_request_id: true,
            randomize_id: false,
            cached_responses,
        })
    }

    #[test]
    fn inspected_responses_populate_cache_and_tree() {
        let cache = DnsCache::new(64);
        let tree = DomainTree::default();
        let mut inspector = DnsInspector::new(profile(false), false);

        let mut query = BytesMut::from(&build_query(7, "www.foo.test", RecordType::A).unwrap()[..]);
        assert_eq!(
            inspector.update(Side::Left, &mut query, &services(&cache, &tree)),
            Verdict::Continue
        );

        let mut response = BytesMut::from(&a_response(7, "www.foo.test.", &[("1.2.3.4", 300)])[..]);
        assert_eq!(
            inspector.update(Side::Right, &mut response, &services(&cache, &tree)),
            Verdict::Continue
        );

        assert!(cache.lookup("A:www.foo.test").is_some());
        assert_eq!(tree.subdomains("foo.test"), ["www"]);
    }

    #[test]
    fn unmatched_response_id_tears_the_flow_down() {
        let cache = DnsCache::new(64);
        let tree = DomainTree::default();
        let mut inspector = DnsInspector::new(profile(false), false);

        let mut response = BytesMut::from(&a_response(99, "foo.test.", &[("1.2.3.4", 60)])[..]);
        assert_eq!(
            inspector.update(Side::Right, &mut response, &services(&cache, &tree)),
            Verdict::Block
        );
    }

    #[test]
    fn cached_answer_is_synthesized_with_decremented_ttls() {
        let cache = DnsCache::new(64);
        let tree = DomainTree::default();

        // A prior inspected response, loaded 100 seconds ago.
        let mut prior = DnsResponse::parse(&a_response(1, "foo.test.", &[("1.2.3.4", 300)])).unwrap();
        prior.loaded_at = unix_now() - 100;
        cache.store(prior);

        let mut inspector = DnsInspector::new(profile(true), false);
        let mut query =
            BytesMut::from(&build_query(0xBEEF, "foo.test", RecordType::A).unwrap()[..]);
        assert_eq!(
            inspector.update(Side::Left, &mut query, &services(&cache, &tree)),
            Verdict::Cached
        );
        assert!(inspector.completed());

        let reply = inspector.apply_verdict().unwrap();
        let parsed = DnsResponse::parse(&reply).unwrap();
        assert_eq!(parsed.id, 0xBEEF);
        assert_eq!(parsed.answers.len(), 1);
        assert_eq!(parsed.answers[0].ttl, 200);
    }

    #[test]
    fn expired_cache_entries_are_not_served() {
        let cache = DnsCache::new(64);
        let tree = DomainTree::default();

        let mut prior = DnsResponse::parse(&a_response(1, "foo.test.", &[("1.2.3.4", 60)])).unwrap();
        prior.loaded_at = unix_now() - 120;
        cache.store(prior);

        let mut inspector = DnsInspector::new(profile(true), false);
        let mut query = BytesMut::from(&build_query(2, "foo.test", RecordType::A).unwrap()[..]);
        assert_eq!(
            inspector.update(Side::Left, &mut query, &services(&cache, &tree)),
            Verdict::Continue
        );
    }

    #[test]
    fn tcp_framing_waits_for_complete_messages() {
        let cache = DnsCache::new(64);
        let tree = DomainTree::default();
        let mut inspector = DnsInspector::new(profile(false), true);

        let query = build_query(3, "foo.test", RecordType::A).unwrap();
        let mut framed = Vec::new();
        framed.extend_from_slice(&(query.len() as u16).to_be_bytes());
        framed.extend_from_slice(&query);

        // Half the frame: the inspector must wait.
        let mut partial = BytesMut::from(&framed[..framed.len() / 2]);
        assert_eq!(
            inspector.update(Side::Left, &mut partial, &services(&cache, &tree)),
            Verdict::Continue
        );
        let (pending, _, _) = inspector.stats();
        assert_eq!(pending, 0);

        let mut whole = BytesMut::from(&framed[..]);
        assert_eq!(
            inspector.update(Side::Left, &mut whole, &services(&cache, &tree)),
            Verdict::Continue
        );
        let (pending, _, _) = inspector.stats();
        assert_eq!(pending, 1);
    }

    #[test]
    fn randomized_ids_are_restored_on_return() {
        let cache = DnsCache::new(64);
        let tree = DomainTree::default();
        let opts = Arc::new(AlgDnsProfile {
            name: "dns".into(),
            match_request_id: true,
            randomize_id: true,
            cached_responses: false,
        });
        let mut inspector = DnsInspector::new(opts, false);

        let mut query = BytesMut::from(&build_query(0x1111, "foo.test", RecordType::A).unwrap()[..]);
        inspector.update(Side::Left, &mut query, &services(&cache, &tree));
        let wire_id = u16::from_be_bytes([query[0], query[1]]);

        let mut response =
            BytesMut::from(&a_response(wire_id, "foo.test.", &[("1.2.3.4", 60)])[..]);
        assert_eq!(
            inspector.update(Side::Right, &mut response, &services(&cache, &tree)),
            Verdict::Continue
        );
        assert_eq!(u16::from_be_bytes([response[0], response[1]]), 0x1111);
    }
}
