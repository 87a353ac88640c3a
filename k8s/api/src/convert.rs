//! Translates k8s-openapi wire types into the core's canonical entity
//! snapshots (spec §3.1), mirroring `buildNetworkPolicyInfo`/`PodToPodMatchLabelMap`/
//! `buildNamespaceInfo` in the original daemon.

use crate::labels::match_labels;
use ipnet::IpNet;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyIngressRule, NetworkPolicyPeer, NetworkPolicyPort,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use netpold_core::types::{
    IpBlock, NamespaceInfo, Peer, PodInfo, PodPhase, PolicyInfo, PolicyKinds, PortMatch, PortRef,
    Protocol, RuleInfo,
};
use std::net::IpAddr;
use std::str::FromStr;

/// Builds a [`PolicyInfo`] from a `NetworkPolicy`. `PolicyTypes` defaults
/// per the k8s API: `[Ingress]` if the policy has no egress rules, else
/// `[Ingress, Egress]`, when the field itself is omitted.
pub fn policy_info(np: &NetworkPolicy) -> PolicyInfo {
    let spec = &np.spec;
    let pod_selector = match_labels(&spec.pod_selector);

    let has_egress_rules = spec.egress.as_ref().is_some_and(|r| !r.is_empty());
    let kinds = match spec.policy_types.as_ref() {
        Some(types) => {
            let mut k = PolicyKinds::empty();
            for t in types {
                match t.as_str() {
                    "Ingress" => k |= PolicyKinds::INGRESS,
                    "Egress" => k |= PolicyKinds::EGRESS,
                    other => tracing::warn!(policy_type = other, "unrecognized policyType"),
                }
            }
            k
        }
        None if has_egress_rules => PolicyKinds::INGRESS | PolicyKinds::EGRESS,
        None => PolicyKinds::INGRESS,
    };

    let ingress = spec
        .ingress
        .as_ref()
        .map(|rules| rules.iter().map(ingress_rule_info).collect())
        .unwrap_or_default();
    let egress = spec
        .egress
        .as_ref()
        .map(|rules| rules.iter().map(egress_rule_info).collect())
        .unwrap_or_default();

    PolicyInfo {
        pod_selector,
        ingress,
        egress,
        kinds,
    }
}

fn ingress_rule_info(rule: &NetworkPolicyIngressRule) -> RuleInfo {
    RuleInfo {
        ports: ports(rule.ports.as_deref()),
        peers: rule.from.as_deref().map(peers).unwrap_or_default(),
    }
}

// `NetworkPolicyEgressRule` has the same shape as the ingress variant (ports
// + peers, named `to` instead of `from`) but k8s-openapi models it as a
// distinct type, so this mirrors `ingress_rule_info` rather than sharing it.
fn egress_rule_info(rule: &k8s_openapi::api::networking::v1::NetworkPolicyEgressRule) -> RuleInfo {
    RuleInfo {
        ports: ports(rule.ports.as_deref()),
        peers: rule.to.as_deref().map(peers).unwrap_or_default(),
    }
}

fn ports(ports: Option<&[NetworkPolicyPort]>) -> Vec<PortMatch> {
    let Some(ports) = ports else {
        return Vec::new();
    };
    ports
        .iter()
        .filter_map(|p| {
            if p.end_port.is_some() {
                tracing::warn!("port ranges (endPort) are not supported; using the start port only");
            }
            let protocol = match p.protocol.as_deref() {
                Some("UDP") => Protocol::Udp,
                Some("SCTP") => Protocol::Sctp,
                Some("TCP") | None => Protocol::Tcp,
                Some(other) => {
                    tracing::warn!(protocol = other, "unrecognized port protocol; defaulting to TCP");
                    Protocol::Tcp
                }
            };
            let port = match p.port.as_ref() {
                Some(IntOrString::Int(n)) => PortRef::Number(*n as u16),
                Some(IntOrString::String(s)) => PortRef::Name(s.clone()),
                None => {
                    tracing::warn!(
                        "port entry without a port number/name matches every port for its \
                         protocol, which this controller cannot express; skipping the entry"
                    );
                    return None;
                }
            };
            Some(PortMatch { protocol, port })
        })
        .collect()
}

fn peers(peers: &[NetworkPolicyPeer]) -> Vec<Peer> {
    peers
        .iter()
        .filter_map(|peer| {
            if let Some(selector) = peer.pod_selector.as_ref() {
                return Some(Peer::PodSelector(match_labels(selector)));
            }
            if let Some(selector) = peer.namespace_selector.as_ref() {
                return Some(Peer::NamespaceSelector(match_labels(selector)));
            }
            if let Some(block) = peer.ip_block.as_ref() {
                return ip_block(block).map(Peer::IpBlock);
            }
            tracing::warn!("network policy peer has none of podSelector/namespaceSelector/ipBlock set");
            None
        })
        .collect()
}

fn ip_block(block: &k8s_openapi::api::networking::v1::IPBlock) -> Option<IpBlock> {
    let cidr = match IpNet::from_str(&block.cidr) {
        Ok(cidr) => cidr,
        Err(error) => {
            tracing::warn!(cidr = %block.cidr, %error, "unparseable ipBlock CIDR; dropping peer");
            return None;
        }
    };
    let except = block
        .except
        .iter()
        .flatten()
        .filter_map(|s| match IpNet::from_str(s) {
            Ok(net) => Some(net),
            Err(error) => {
                tracing::warn!(cidr = %s, %error, "unparseable ipBlock except CIDR; dropping it");
                None
            }
        })
        .collect();
    Some(IpBlock { cidr, except })
}

/// Builds a [`PodInfo`] from a `Pod`. An absent or unparseable `status.podIP`
/// yields `ip: None`, which makes the pod invalid (spec §3.1 invariant 4).
pub fn pod_info(pod: &Pod) -> PodInfo {
    let labels = pod
        .metadata
        .labels
        .clone()
        .unwrap_or_default()
        .into_iter()
        .collect();
    let ip = pod
        .status
        .as_ref()
        .and_then(|s| s.pod_ip.as_ref())
        .and_then(|ip| IpAddr::from_str(ip).ok());
    let host_network = pod
        .spec
        .as_ref()
        .and_then(|s| s.host_network)
        .unwrap_or(false);
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map(pod_phase)
        .unwrap_or(PodPhase::Unknown);

    PodInfo {
        ip,
        labels,
        host_network,
        phase,
    }
}

fn pod_phase(phase: &str) -> PodPhase {
    match phase {
        "Pending" => PodPhase::Pending,
        "Running" => PodPhase::Running,
        "Succeeded" => PodPhase::Succeeded,
        "Failed" => PodPhase::Failed,
        other => {
            tracing::warn!(phase = other, "unrecognized pod phase");
            PodPhase::Unknown
        }
    }
}

/// Builds a [`NamespaceInfo`] from a `Namespace`.
pub fn namespace_info(ns: &Namespace) -> NamespaceInfo {
    NamespaceInfo {
        labels: ns.metadata.labels.clone().unwrap_or_default().into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::networking::v1::NetworkPolicySpec;
    use kube::api::ObjectMeta;

    #[test]
    fn defaults_policy_types_from_rule_presence() {
        let np = NetworkPolicy {
            metadata: ObjectMeta::default(),
            spec: NetworkPolicySpec {
                pod_selector: Default::default(),
                ingress: Some(vec![]),
                egress: None,
                policy_types: None,
            },
            status: None,
        };
        assert_eq!(policy_info(&np).kinds, PolicyKinds::INGRESS);

        let np_with_egress = NetworkPolicy {
            spec: NetworkPolicySpec {
                egress: Some(vec![Default::default()]),
                ..np.spec.clone()
            },
            ..np
        };
        assert_eq!(
            policy_info(&np_with_egress).kinds,
            PolicyKinds::INGRESS | PolicyKinds::EGRESS
        );
    }

    #[test]
    fn pod_without_ip_is_invalid() {
        let pod = Pod::default();
        assert!(pod_info(&pod).ip.is_none());
        assert!(!pod_info(&pod).is_valid());
    }
}
