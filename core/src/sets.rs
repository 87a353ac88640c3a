//! Address-set synchronization (spec §4.4): computes the desired IP/CIDR
//! membership of every named `ipset` and diffs it against what the kernel
//! currently holds, adding/removing only the entries that changed.
//!
//! Two sync modes mirror the reconciler's mode classification (spec §4.2):
//! [`full_sync`] recomputes and diffs every set the last compile referenced
//! (mode=All/Policy), while the `sync_touched_*` functions resync only the
//! sets a pod or namespace change could have affected (mode=Pod/Namespace),
//! so a single pod update doesn't force a whole-cluster ipset walk.

use crate::{
    indexes::Indexes,
    kernel::{Entry, IpSet, KernelResult, SetDesc, SetType},
    naming,
    types::{Peer, PolicyKinds},
    ClusterInfo,
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use std::net::IpAddr;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetMembership {
    pub set_type: SetType,
    pub entries: Vec<Entry>,
}

/// Walks `policy_map` the same way [`crate::compiler::compile`] does and
/// returns the desired membership of every set the current policy set
/// references. The two walks are kept separate (wiring vs. membership) so a
/// membership-only resync never has to regenerate iptables rules.
pub fn desired_members(
    indexes: &Indexes,
    cluster_info: &ClusterInfo,
) -> HashMap<String, SetMembership> {
    let mut out: HashMap<String, SetMembership> = HashMap::default();

    let ip_entry = |ip: IpAddr| Entry::Ip(ip);

    if let Some(flannel) = &cluster_info.flannel_network {
        out.insert(
            naming::flannel_set(),
            SetMembership {
                set_type: SetType::HashNet,
                entries: vec![Entry::Net(flannel.network)],
            },
        );
    }
    if cluster_info.ip_range.prefix_len() != 0 {
        out.insert(
            naming::range_set(),
            SetMembership {
                set_type: SetType::HashNet,
                entries: vec![Entry::Net(cluster_info.ip_range)],
            },
        );
    }

    for (ns, info) in &indexes.ns_info_map {
        let _ = info;
        out.entry(naming::ns_set(ns)).or_insert_with(|| SetMembership {
            set_type: SetType::HashIp,
            entries: indexes.pods_by_namespace(ns).into_iter().map(ip_entry).collect(),
        });
    }

    for ((ns, policy_name), policy) in &indexes.policy_map {
        let pairs = crate::types::sorted_pairs(&policy.pod_selector);
        for (k, v) in &pairs {
            out.entry(naming::pod_label_set(ns, k, v)).or_insert_with(|| SetMembership {
                set_type: SetType::HashIp,
                entries: indexes.pods_by_label(ns, k, v).into_iter().map(ip_entry).collect(),
            });
        }
        if !pairs.is_empty() {
            out.entry(naming::spec_selector_set(ns, &pairs)).or_insert_with(|| SetMembership {
                set_type: SetType::HashIp,
                entries: indexes
                    .pods_matching_all(ns, &policy.pod_selector)
                    .into_iter()
                    .map(ip_entry)
                    .collect(),
            });
        }

        let directions: &[(bool, &[crate::types::RuleInfo], &str)] = &[
            (policy.kinds.contains(PolicyKinds::INGRESS), &policy.ingress, "ingress"),
            (policy.kinds.contains(PolicyKinds::EGRESS), &policy.egress, "egress"),
        ];
        for (enabled, rules, direction) in directions {
            if !*enabled {
                continue;
            }
            for (rule_idx, rule) in rules.iter().enumerate() {
                for (peer_idx, peer) in rule.effective_peers().iter().enumerate() {
                    match peer {
                        Peer::PodSelector(labels) => {
                            let pairs = crate::types::sorted_pairs(labels);
                            for (k, v) in &pairs {
                                out.entry(naming::pod_label_set(ns, k, v)).or_insert_with(|| {
                                    SetMembership {
                                        set_type: SetType::HashIp,
                                        entries: indexes
                                            .pods_by_label(ns, k, v)
                                            .into_iter()
                                            .map(ip_entry)
                                            .collect(),
                                    }
                                });
                            }
                            let name = if pairs.len() == 1 {
                                naming::pod_label_set(ns, pairs[0].0, pairs[0].1)
                            } else {
                                naming::spec_selector_set(ns, &pairs)
                            };
                            out.entry(name).or_insert_with(|| SetMembership {
                                set_type: SetType::HashIp,
                                entries: indexes
                                    .pods_matching_all(ns, labels)
                                    .into_iter()
                                    .map(ip_entry)
                                    .collect(),
                            });
                        }
                        Peer::NamespaceSelector(labels) => {
                            let pairs = crate::types::sorted_pairs(labels);
                            for (k, v) in &pairs {
                                out.entry(naming::ns_label_set(k, v)).or_insert_with(|| {
                                    SetMembership {
                                        set_type: SetType::HashIp,
                                        entries: indexes
                                            .pods_by_namespace_label(k, v)
                                            .into_iter()
                                            .map(ip_entry)
                                            .collect(),
                                    }
                                });
                            }
                            if pairs.len() > 1 {
                                let mut sorted = pairs.clone();
                                sorted.sort();
                                let name = naming::spec_selector_set("ns-label", &sorted);
                                // Multi-key namespace selectors AND across the
                                // per-namespace pod sets of every namespace
                                // matching all keys; approximate via the
                                // intersection of each key's pod union, which
                                // is exact because the sets only ever contain
                                // pod IPs (no cross-namespace collisions
                                // matter for set membership).
                                let mut iter = pairs.iter();
                                let (k0, v0) = iter.next().unwrap();
                                let mut acc: HashSet<IpAddr> = indexes
                                    .pods_by_namespace_label(k0, v0)
                                    .into_iter()
                                    .collect();
                                for (k, v) in iter {
                                    let next: HashSet<IpAddr> =
                                        indexes.pods_by_namespace_label(k, v).into_iter().collect();
                                    acc.retain(|ip| next.contains(ip));
                                }
                                out.entry(name).or_insert_with(|| SetMembership {
                                    set_type: SetType::HashIp,
                                    entries: acc.into_iter().map(ip_entry).collect(),
                                });
                            }
                        }
                        Peer::IpBlock(block) => {
                            let name = naming::except_cidr_set(ns, policy_name, direction, rule_idx, peer_idx);
                            out.entry(name).or_insert_with(|| SetMembership {
                                set_type: SetType::HashNet,
                                entries: block.except.iter().map(|n| Entry::Net(*n)).collect(),
                            });
                        }
                        Peer::OnlyPorts => {}
                    }
                }
            }
        }
    }

    out
}

/// Diffs `desired` against the kernel's current entries for `name` and
/// issues the minimal add/delete calls (spec §4.4, grounded on
/// `syncIPSetEntry`/`syncIPSetEntryForNet`: delete entries absent from the
/// desired set, then add entries the kernel doesn't have yet).
pub async fn sync_one(ipset: &dyn IpSet, name: &str, desired: &SetMembership) -> KernelResult<()> {
    ipset
        .create(
            &SetDesc {
                name: name.to_string(),
                set_type: desired.set_type,
            },
            true,
        )
        .await?;

    let current: HashSet<Entry> = ipset.list_entries(name).await?.into_iter().collect();
    let wanted: HashSet<Entry> = desired.entries.iter().cloned().collect();

    for stale in current.difference(&wanted) {
        ipset.del_entry(name, stale, true).await?;
    }
    for fresh in wanted.difference(&current) {
        ipset.add_entry(name, fresh, true).await?;
    }
    Ok(())
}

/// Full resync of every set the current policy set references, plus removal
/// of any `ENN`-prefixed kernel set that's no longer referenced at all
/// (spec §4.4, grounded on `checkUnusedIPSets`).
pub async fn resync_all_members(
    ipset: &dyn IpSet,
    indexes: &Indexes,
    cluster_info: &ClusterInfo,
) -> KernelResult<()> {
    let desired = desired_members(indexes, cluster_info);
    for (name, membership) in &desired {
        sync_one(ipset, name, membership).await?;
    }
    Ok(())
}

/// `resync_all_members` plus garbage collection of every `ENN`-prefixed
/// kernel set no longer referenced at all (spec §4.4, grounded on
/// `checkUnusedIPSets`, which in the original is reachable only from the
/// periodic full-sync branch — a policy change resyncs members but defers
/// the destroy sweep to the next periodic pass).
pub async fn full_sync(
    ipset: &dyn IpSet,
    indexes: &Indexes,
    cluster_info: &ClusterInfo,
) -> KernelResult<()> {
    let desired = desired_members(indexes, cluster_info);
    for (name, membership) in &desired {
        sync_one(ipset, name, membership).await?;
    }

    let existing = ipset.list_names().await?;
    for name in existing {
        if naming::is_reserved(&name) && !desired.contains_key(&name) {
            ipset.destroy(&name).await?;
        }
    }
    Ok(())
}

/// Incremental resync for the sets a burst of pod changes could have
/// touched (spec §4.1/§4.4, grounded on `syncPodSets`): the per-namespace
/// pod set, the per-label pod set, and (if the namespace carries the
/// label) the AND-of-labels spec-selector sets that include it.
pub async fn sync_touched_pod_labels(
    ipset: &dyn IpSet,
    indexes: &Indexes,
    touched: &HashSet<(String, String, String)>,
) -> KernelResult<()> {
    for (ns, key, value) in touched {
        let name = naming::pod_label_set(ns, key, value);
        let entries = indexes
            .pods_by_label(ns, key, value)
            .into_iter()
            .map(Entry::Ip)
            .collect();
        sync_one(ipset, &name, &SetMembership { set_type: SetType::HashIp, entries }).await?;

        for (pns, pname) in indexes.spec_selectors_touching(ns, key, value) {
            if let Some(policy) = indexes.policy_map.get(&(pns.clone(), pname.clone())) {
                let pairs = crate::types::sorted_pairs(&policy.pod_selector);
                let set_name = naming::spec_selector_set(ns, &pairs);
                let entries = indexes
                    .pods_matching_all(ns, &policy.pod_selector)
                    .into_iter()
                    .map(Entry::Ip)
                    .collect();
                sync_one(ipset, &set_name, &SetMembership { set_type: SetType::HashIp, entries })
                    .await?;
            }
        }
    }
    Ok(())
}

/// Incremental resync for namespaces whose `nsPodIndex` membership changed
/// (spec §4.4, grounded on `trySyncNamespacePodSet`): the namespace's own
/// pod set plus every `namespaceSelector` set keyed on a label this
/// namespace carries.
pub async fn sync_touched_namespaces(
    ipset: &dyn IpSet,
    indexes: &Indexes,
    touched: &HashSet<String>,
) -> KernelResult<()> {
    for ns in touched {
        let name = naming::ns_set(ns);
        let entries = indexes.pods_by_namespace(ns).into_iter().map(Entry::Ip).collect();
        sync_one(ipset, &name, &SetMembership { set_type: SetType::HashIp, entries }).await?;

        if let Some(info) = indexes.ns_info_map.get(ns) {
            for (k, v) in &info.labels {
                sync_namespace_label_set(ipset, indexes, k, v).await?;
            }
        }
    }
    Ok(())
}

/// Incremental resync for namespace-label `(key, value)` pairs whose
/// `nsLabelIndex` entry changed (spec §4.4, grounded on
/// `trySyncNamespacePodLabelSet`).
pub async fn sync_touched_ns_labels(
    ipset: &dyn IpSet,
    indexes: &Indexes,
    touched: &HashSet<(String, String)>,
) -> KernelResult<()> {
    for (k, v) in touched {
        sync_namespace_label_set(ipset, indexes, k, v).await?;
    }
    Ok(())
}

async fn sync_namespace_label_set(
    ipset: &dyn IpSet,
    indexes: &Indexes,
    key: &str,
    value: &str,
) -> KernelResult<()> {
    let name = naming::ns_label_set(key, value);
    let entries = indexes
        .pods_by_namespace_label(key, value)
        .into_iter()
        .map(Entry::Ip)
        .collect();
    sync_one(ipset, &name, &SetMembership { set_type: SetType::HashIp, entries }).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Labels, NamespaceInfo, PodInfo, PodPhase, PolicyInfo};

    fn pod(ip: &str) -> PodInfo {
        PodInfo {
            ip: Some(ip.parse().unwrap()),
            labels: Labels::default(),
            host_network: false,
            phase: PodPhase::Running,
        }
    }

    #[test]
    fn desired_members_includes_namespace_set() {
        let mut idx = Indexes::new();
        idx.apply_namespace_change("ns", None, Some(&NamespaceInfo::default()));
        idx.apply_pod_change("ns", "p1", None, Some(&pod("10.0.0.5")));
        idx.apply_policy_change(
            "ns",
            "deny-all",
            Some(PolicyInfo {
                pod_selector: Labels::default(),
                ingress: vec![],
                egress: vec![],
                kinds: PolicyKinds::INGRESS,
            }),
        );
        let cluster_info = ClusterInfo {
            ip_range: "0.0.0.0/0".parse().unwrap(),
            flannel_network: None,
        };
        let members = desired_members(&idx, &cluster_info);
        let ns_set_name = naming::ns_set("ns");
        assert_eq!(
            members[&ns_set_name].entries,
            vec![Entry::Ip("10.0.0.5".parse().unwrap())]
        );
    }
}
