//! Entity types for the data model (spec §3.1).

use ipnet::IpNet;
use std::{collections::BTreeMap, net::IpAddr};

/// A label map. Keys within one map are ANDed; `BTreeMap` gives a stable
/// iteration order so callers that need canonical ordering (naming) don't
/// have to sort separately except where we hash a *subset* of keys.
pub type Labels = BTreeMap<String, String>;

/// A single `(namespace, name)` key shared by all three watched kinds.
pub type ObjKey = (String, String);

/// `(protocol, port-or-name)` as carried in a policy rule.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct PortMatch {
    pub protocol: Protocol,
    pub port: PortRef,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
}

impl Protocol {
    pub fn as_iptables_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PortRef {
    Number(u16),
    Name(String),
}

/// One `except`-qualified CIDR block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpBlock {
    pub cidr: IpNet,
    pub except: Vec<IpNet>,
}

/// A single peer in a rule's `podSelectors`/`namespaceSelectors`/`ipBlocks`
/// triad, normalized into a tagged sum (spec §9: "dynamic dispatch → tagged
/// variants"). `OnlyPorts` represents a rule that restricts by port alone
/// (no `from`/`to` peers at all), matching every source/destination.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Peer {
    OnlyPorts,
    PodSelector(Labels),
    NamespaceSelector(Labels),
    IpBlock(IpBlock),
}

impl Peer {
    pub fn kind_tag(&self) -> &'static str {
        match self {
            Peer::OnlyPorts => "onlyports",
            Peer::PodSelector(_) => "podselector",
            Peer::NamespaceSelector(_) => "namespaceselector",
            Peer::IpBlock(_) => "ipblock",
        }
    }
}

/// A single ingress or egress rule: an ORed set of peers, each combined with
/// the same port restriction.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct RuleInfo {
    pub ports: Vec<PortMatch>,
    pub peers: Vec<Peer>,
}

impl RuleInfo {
    /// A rule with no peers at all selects every source/destination; the
    /// compiler treats it as a single `OnlyPorts` dispatch.
    pub fn effective_peers(&self) -> Vec<Peer> {
        if self.peers.is_empty() {
            vec![Peer::OnlyPorts]
        } else {
            self.peers.clone()
        }
    }
}

bitflags::bitflags! {
    /// Which directions a policy governs. A policy that names only
    /// `Ingress` leaves egress traffic from its selected pods unrestricted
    /// by this controller (no egress chain is emitted for it).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PolicyKinds: u8 {
        const INGRESS = 0b01;
        const EGRESS  = 0b10;
    }
}

/// Canonical, immutable snapshot of a `NetworkPolicy` (spec §3.1).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyInfo {
    pub pod_selector: Labels,
    pub ingress: Vec<RuleInfo>,
    pub egress: Vec<RuleInfo>,
    pub kinds: PolicyKinds,
}

/// Pod lifecycle phases relevant to validity (spec §3.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

/// Canonical, immutable snapshot of a `Pod` (spec §3.1).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodInfo {
    pub ip: Option<IpAddr>,
    pub labels: Labels,
    pub host_network: bool,
    pub phase: PodPhase,
}

impl PodInfo {
    /// A pod is valid iff it has an IP, is not host-networked, and hasn't
    /// terminated. Invalid pods are treated as absent from every index
    /// (spec §3.1, invariant 4).
    pub fn is_valid(&self) -> bool {
        self.ip.is_some()
            && !self.host_network
            && !matches!(self.phase, PodPhase::Succeeded | PodPhase::Failed)
    }
}

/// Canonical, immutable snapshot of a `Namespace` (spec §3.1).
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct NamespaceInfo {
    pub labels: Labels,
}

/// Sorts and dedupes a label map's key/value pairs for use in a naming key.
/// Keys are already sorted by virtue of `Labels` being a `BTreeMap`, but this
/// makes the "lexicographically sorted before hashing" rule from spec §4.3
/// explicit at call sites.
pub fn sorted_pairs(labels: &Labels) -> Vec<(&str, &str)> {
    labels
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect()
}
