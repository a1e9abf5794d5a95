//! The policy engine.
//!
//! A policy is an ordered list of rules over typed predicates on the
//! connection 5-tuple.  Rules are evaluated in order and the first match
//! wins; when nothing matches the verdict is an implicit deny.

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ipnet::IpNet;
use tracing::debug;

use crate::dns::cache::DnsCache;
use crate::inspect::signature::Sensor;
use crate::policy::profiles::{
    AlgDnsProfile, AuthProfile, ContentProfile, DetectionProfile, RoutingProfile, ScriptProfile,
    TlsProfile,
};

pub mod profiles;

//----------- AddressObject ----------------------------------------------------

/// A matchable address predicate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddressObject {
    /// A CIDR prefix.  Matching is a pure containment test; an IPv4 host
    /// never matches an IPv6 prefix and vice versa.
    Cidr {
        /// The configured name of the object.
        name: Box<str>,

        /// The prefix.
        net: IpNet,
    },

    /// A fully qualified domain name.  Matching requires a fresh DNS cache
    /// answer for the name that equals the probed address.
    Fqdn {
        /// The configured name of the object.
        name: Box<str>,

        /// The domain name, normalized to lowercase without a trailing dot.
        fqdn: Box<str>,
    },
}

impl AddressObject {
    pub fn name(&self) -> &str {
        match self {
            Self::Cidr { name, .. } => name,
            Self::Fqdn { name, .. } => name,
        }
    }

    /// Whether this object matches the given address.
    ///
    /// An FQDN object matches if *any* non-expired cached answer of the
    /// probed address family equals the address; multiple A records need
    /// not all match.
    pub fn matches(&self, ip: IpAddr, dns: &DnsCache) -> bool {
        match self {
            Self::Cidr { net, .. } => match (net, ip) {
                (IpNet::V4(net), IpAddr::V4(ip)) => net.contains(&ip),
                (IpNet::V6(net), IpAddr::V6(ip)) => net.contains(&ip),
                _ => false,
            },
            Self::Fqdn { fqdn, .. } => dns.fqdn_matches(fqdn, ip),
        }
    }
}

impl fmt::Display for AddressObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cidr { name, net } => write!(f, "{name} (cidr {net})"),
            Self::Fqdn { name, fqdn } => write!(f, "{name} (fqdn {fqdn})"),
        }
    }
}

//----------- PortRange --------------------------------------------------------

/// A closed port interval.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PortRange {
    lo: u16,
    hi: u16,
}

impl PortRange {
    /// Build a normalized range; reversed bounds are swapped.
    pub fn new(a: u16, b: u16) -> Self {
        if a <= b {
            Self { lo: a, hi: b }
        } else {
            Self { lo: b, hi: a }
        }
    }

    pub fn lo(&self) -> u16 {
        self.lo
    }

    pub fn hi(&self) -> u16 {
        self.hi
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.lo && port <= self.hi
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.lo, self.hi)
    }
}

//----------- PolicyAction / NatMode -------------------------------------------

/// The verdict of a matched rule.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PolicyAction {
    Deny,
    #[default]
    Accept,
}

/// Source NAT behavior of a matched rule.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum NatMode {
    #[default]
    None,
    Auto,
    Pool,
}

//----------- ProfileSet -------------------------------------------------------

/// The optional profile references of one rule.
#[derive(Clone, Debug, Default)]
pub struct ProfileSet {
    pub content: Option<Arc<ContentProfile>>,
    pub detection: Option<Arc<DetectionProfile>>,
    pub tls: Option<Arc<TlsProfile>>,
    pub auth: Option<Arc<AuthProfile>>,
    pub alg_dns: Option<Arc<AlgDnsProfile>>,
    pub script: Option<Arc<ScriptProfile>>,
    pub routing: Option<Arc<RoutingProfile>>,
}

//----------- EndpointInfo -----------------------------------------------------

/// One endpoint tuple offered to the matcher.
///
/// A session offers its initiator endpoint plus the destination-NAT source
/// on the left, and the apparent plus post-NAT destination on the right.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EndpointInfo {
    /// IP protocol number of the flow.
    pub proto: u8,

    pub ip: IpAddr,
    pub port: u16,
}

impl fmt::Display for EndpointInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} [{}]", self.ip, self.port, self.proto)
    }
}

//----------- PolicyRule -------------------------------------------------------

/// One ordered rule of the policy.
///
/// An empty address or port set is interpreted as "any".
#[derive(Debug)]
pub struct PolicyRule {
    /// IP protocol number; 0 matches any protocol.
    pub proto: u8,

    pub src: Vec<Arc<AddressObject>>,
    pub src_ports: Vec<PortRange>,
    pub dst: Vec<Arc<AddressObject>>,
    pub dst_ports: Vec<PortRange>,

    pub action: PolicyAction,
    pub nat: NatMode,

    pub profiles: ProfileSet,

    /// How often this rule has been the first match.
    pub cnt_matches: AtomicU64,
}

impl PolicyRule {
    fn match_proto(&self, endpoints: &[EndpointInfo]) -> bool {
        self.proto == 0 || endpoints.iter().any(|e| e.proto == self.proto)
    }

    fn match_addrgrp(
        group: &[Arc<AddressObject>],
        endpoints: &[EndpointInfo],
        dns: &DnsCache,
    ) -> bool {
        if group.is_empty() {
            return true;
        }
        endpoints
            .iter()
            .any(|e| group.iter().any(|a| a.matches(e.ip, dns)))
    }

    fn match_rangegrp(group: &[PortRange], endpoints: &[EndpointInfo]) -> bool {
        if group.is_empty() {
            return true;
        }
        endpoints
            .iter()
            .any(|e| group.iter().any(|r| r.contains(e.port)))
    }

    /// Whether this rule matches the offered left and right endpoint sets.
    pub fn matches(&self, left: &[EndpointInfo], right: &[EndpointInfo], dns: &DnsCache) -> bool {
        if !self.match_proto(left) {
            return false;
        }
        if !Self::match_addrgrp(&self.src, left, dns) {
            return false;
        }
        if !Self::match_rangegrp(&self.src_ports, left) {
            return false;
        }
        if !Self::match_addrgrp(&self.dst, right, dns) {
            return false;
        }
        if !Self::match_rangegrp(&self.dst_ports, right) {
            return false;
        }
        true
    }
}

impl fmt::Display for PolicyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.proto {
            6 => f.write_str("[tcp] ")?,
            17 => f.write_str("[udp] ")?,
            p => write!(f, "[{p:3}] ")?,
        }

        if self.src.is_empty() {
            f.write_str("*")?;
        }
        for a in &self.src {
            write!(f, " {a}")?;
        }
        f.write_str(":")?;
        if self.src_ports.is_empty() {
            f.write_str("*")?;
        }
        for p in &self.src_ports {
            write!(f, "{p} ")?;
        }

        f.write_str(" -> ")?;
        if self.dst.is_empty() {
            f.write_str("*")?;
        }
        for a in &self.dst {
            write!(f, " {a}")?;
        }
        f.write_str(":")?;
        if self.dst_ports.is_empty() {
            f.write_str("*")?;
        }
        for p in &self.dst_ports {
            write!(f, "{p} ")?;
        }

        let action = match self.action {
            PolicyAction::Accept => "ACCEPT",
            PolicyAction::Deny => "REJECT",
        };
        let nat = match self.nat {
            NatMode::None => "nonat",
            NatMode::Auto => "iface",
            NatMode::Pool => " pool",
        };
        write!(
            f,
            "= {action}({nat}) [{}]",
            self.cnt_matches.load(Ordering::Relaxed)
        )
    }
}

//----------- PolicyDb ---------------------------------------------------------

/// The loaded policy database.
///
/// Holds every configuration-derived object.  Reloads build a new database
/// and install it wholesale; sessions keep the `Arc` handles of the objects
/// they matched with until they terminate.
#[derive(Debug, Default)]
pub struct PolicyDb {
    pub addresses: foldhash::HashMap<Box<str>, Arc<AddressObject>>,
    pub ports: foldhash::HashMap<Box<str>, PortRange>,
    pub protos: foldhash::HashMap<Box<str>, u8>,

    pub content_profiles: foldhash::HashMap<Box<str>, Arc<ContentProfile>>,
    pub detection_profiles: foldhash::HashMap<Box<str>, Arc<DetectionProfile>>,
    pub tls_profiles: foldhash::HashMap<Box<str>, Arc<TlsProfile>>,
    pub auth_profiles: foldhash::HashMap<Box<str>, Arc<AuthProfile>>,
    pub alg_dns_profiles: foldhash::HashMap<Box<str>, Arc<AlgDnsProfile>>,
    pub script_profiles: foldhash::HashMap<Box<str>, Arc<ScriptProfile>>,
    pub routing_profiles: foldhash::HashMap<Box<str>, Arc<RoutingProfile>>,

    /// The ordered rule list.  Order is significant and persisted.
    pub rules: Vec<PolicyRule>,

    /// The STARTTLS sensor (signature group 0).
    pub starttls_sensor: Arc<Sensor>,

    /// The base detection sensor (signature group 1).
    pub detection_sensor: Arc<Sensor>,
}

impl PolicyDb {
    /// Find the first rule matching the offered endpoint sets.
    ///
    /// Returns the rule index, or `None` for the implicit deny.  The match
    /// counter of the winning rule is incremented.
    pub fn matched(
        &self,
        left: &[EndpointInfo],
        right: &[EndpointInfo],
        dns: &DnsCache,
    ) -> Option<usize> {
        for (index, rule) in self.rules.iter().enumerate() {
            if rule.matches(left, right, dns) {
                rule.cnt_matches.fetch_add(1, Ordering::Relaxed);
                debug!("policy: rule {index} matched: {rule}");
                return Some(index);
            }
        }
        debug!("policy: no rule matched, implicit deny");
        None
    }

    /// The action of the given rule; out-of-range indices deny.
    pub fn action(&self, index: Option<usize>) -> PolicyAction {
        index
            .and_then(|i| self.rules.get(i))
            .map(|r| r.action)
            .unwrap_or(PolicyAction::Deny)
    }

    /// The profile set of the given rule, if it exists.
    pub fn profiles(&self, index: usize) -> Option<&ProfileSet> {
        self.rules.get(index).map(|r| &r.profiles)
    }

    pub fn prof_tls(&self, index: usize) -> Option<Arc<TlsProfile>> {
        self.profiles(index).and_then(|p| p.tls.clone())
    }

    pub fn prof_content(&self, index: usize) -> Option<Arc<ContentProfile>> {
        self.profiles(index).and_then(|p| p.content.clone())
    }

    pub fn prof_detection(&self, index: usize) -> Option<Arc<DetectionProfile>> {
        self.profiles(index).and_then(|p| p.detection.clone())
    }

    pub fn prof_alg_dns(&self, index: usize) -> Option<Arc<AlgDnsProfile>> {
        self.profiles(index).and_then(|p| p.alg_dns.clone())
    }

    pub fn prof_auth(&self, index: usize) -> Option<Arc<AuthProfile>> {
        self.profiles(index).and_then(|p| p.auth.clone())
    }

    pub fn prof_routing(&self, index: usize) -> Option<Arc<RoutingProfile>> {
        self.profiles(index).and_then(|p| p.routing.clone())
    }
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::cache::DnsCache;

    fn tcp(ip: &str, port: u16) -> EndpointInfo {
        EndpointInfo {
            proto: 6,
            ip: ip.parse().unwrap(),
            port,
        }
    }

    fn any_to_port_80_rule() -> PolicyRule {
        PolicyRule {
            proto: 6,
            src: vec![Arc::new(AddressObject::Cidr {
                name: "any".into(),
                net: "0.0.0.0/0".parse().unwrap(),
            })],
            src_ports: Vec::new(),
            dst: vec![Arc::new(AddressObject::Cidr {
                name: "any".into(),
                net: "0.0.0.0/0".parse().unwrap(),
            })],
            dst_ports: vec![PortRange::new(80, 80)],
            action: PolicyAction::Accept,
            nat: NatMode::None,
            profiles: ProfileSet::default(),
            cnt_matches: AtomicU64::new(0),
        }
    }

    #[test]
    fn port_range_normalizes() {
        let r = PortRange::new(443, 80);
        assert_eq!(r.lo(), 80);
        assert_eq!(r.hi(), 443);
        assert!(r.contains(80));
        assert!(r.contains(443));
        assert!(!r.contains(444));
    }

    #[test]
    fn cidr_family_mismatch_never_matches() {
        let dns = DnsCache::new(128);
        let v4_any = AddressObject::Cidr {
            name: "any".into(),
            net: "0.0.0.0/0".parse().unwrap(),
        };
        assert!(v4_any.matches("10.0.0.1".parse().unwrap(), &dns));
        assert!(!v4_any.matches("2001:db8::1".parse().unwrap(), &dns));
    }

    #[test]
    fn first_match_wins_and_is_deterministic() {
        let dns = DnsCache::new(128);
        let db = PolicyDb {
            rules: vec![any_to_port_80_rule()],
            ..Default::default()
        };

        let left = [tcp("10.0.0.1", 40000)];
        let right = [tcp("93.184.216.34", 80)];

        for _ in 0..3 {
            assert_eq!(db.matched(&left, &right, &dns), Some(0));
        }
        assert_eq!(db.rules[0].cnt_matches.load(Ordering::Relaxed), 3);
        assert_eq!(db.action(Some(0)), PolicyAction::Accept);
    }

    #[test]
    fn implicit_deny_on_empty_policy() {
        let dns = DnsCache::new(128);
        let db = PolicyDb::default();

        let left = [tcp("10.0.0.1", 40000)];
        let right = [tcp("93.184.216.34", 80)];

        let m = db.matched(&left, &right, &dns);
        assert_eq!(m, None);
        assert_eq!(db.action(m), PolicyAction::Deny);
    }

    #[test]
    fn unmatched_port_falls_through() {
        let dns = DnsCache::new(128);
        let db = PolicyDb {
            rules: vec![any_to_port_80_rule()],
            ..Default::default()
        };

        let left = [tcp("10.0.0.1", 40000)];
        let right = [tcp("93.184.216.34", 443)];
        assert_eq!(db.matched(&left, &right, &dns), None);
    }

    #[test]
    fn empty_sets_match_anything() {
        let dns = DnsCache::new(128);
        let rule = PolicyRule {
            proto: 0,
            src: Vec::new(),
            src_ports: Vec::new(),
            dst: Vec::new(),
            dst_ports: Vec::new(),
            action: PolicyAction::Accept,
            nat: NatMode::None,
            profiles: ProfileSet::default(),
            cnt_matches: AtomicU64::new(0),
        };
        let left = [tcp("192.0.2.7", 1)];
        let right = [tcp("2001:db8::1", 65535)];
        assert!(rule.matches(&left, &right, &dns));
    }
}
