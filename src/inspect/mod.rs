//! Flow inspectors.
//!
//! Inspectors are attached to a session per its matched profiles and are
//! consulted on every read, in attachment order.  They are plain tagged
//! variants dispatched on the tag; each returns a verdict the session acts
//! on.

use bytes::BytesMut;

use crate::dns::cache::{DnsCache, DomainTree};
use crate::session::flow::{Flow, Side};

pub mod dns;
pub mod signature;

//----------- Verdict ----------------------------------------------------------

/// What the session should do with the inspected data.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Verdict {
    /// Forward as usual.
    #[default]
    Continue,

    /// The inspector can serve the originating side from cache; the peer
    /// side is to be terminated early.
    Cached,

    /// The flow is invalid; the originating side is to be marked errored.
    Block,
}

//----------- InspectServices --------------------------------------------------

/// Service handles an inspector may consult.
pub struct InspectServices<'a> {
    pub dns_cache: &'a DnsCache,
    pub domain_tree: &'a DomainTree,
}

//----------- Inspector --------------------------------------------------------

/// An attached inspector.
#[derive(Debug)]
pub enum Inspector {
    Dns(dns::DnsInspector),
    Signatures(SignatureInspector),
}

impl Inspector {
    /// Whether the inspector wants to see this session's data at all.
    pub fn interested(&self, dst_port: u16) -> bool {
        match self {
            Self::Dns(_) => dns::DnsInspector::interested(dst_port),
            Self::Signatures(_) => true,
        }
    }

    /// Whether the inspector is done and need not be consulted again.
    pub fn completed(&self) -> bool {
        match self {
            Self::Dns(i) => i.completed(),
            Self::Signatures(_) => false,
        }
    }

    /// Feed the chunk that was just appended to the flow on `side`.
    ///
    /// The chunk is the data about to be forwarded and may be rewritten in
    /// place (the DNS inspector does this for id randomization).
    pub fn update(
        &mut self,
        side: Side,
        chunk: &mut BytesMut,
        flow: &Flow,
        services: &InspectServices<'_>,
    ) -> Verdict {
        match self {
            Self::Dns(i) => i.update(side, chunk, services),
            Self::Signatures(i) => i.update(flow),
        }
    }
}

//----------- SignatureInspector -----------------------------------------------

/// Drives the STARTTLS and detection sensors over the session flow.
#[derive(Debug)]
pub struct SignatureInspector {
    starttls: signature::SensorScan,
    detection: signature::SensorScan,

    /// Hits collected since the last drain.
    pending: Vec<signature::SignatureHit>,

    /// A STARTTLS signature fired; the session should upgrade to TLS.
    starttls_fired: bool,
}

impl SignatureInspector {
    pub fn new(
        starttls: std::sync::Arc<signature::Sensor>,
        detection: std::sync::Arc<signature::Sensor>,
    ) -> Self {
        Self {
            starttls: signature::SensorScan::new(starttls),
            detection: signature::SensorScan::new(detection),
            pending: Vec::new(),
            starttls_fired: false,
        }
    }

    fn update(&mut self, flow: &Flow) -> Verdict {
        for hit in self.starttls.scan(flow) {
            self.starttls_fired = true;
            self.pending.push(hit);
        }
        self.pending.extend(self.detection.scan(flow));
        Verdict::Continue
    }

    /// Whether a STARTTLS signature has fired, clearing the flag.
    pub fn take_starttls(&mut self) -> bool {
        std::mem::take(&mut self.starttls_fired)
    }

    /// Drain the hits collected so far.
    pub fn take_hits(&mut self) -> Vec<signature::SignatureHit> {
        std::mem::take(&mut self.pending)
    }
}
