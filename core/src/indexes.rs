//! The five denormalized indexes the reconciler owns (spec §3.2), plus the
//! mutation methods that keep the invariants in §3.3 true under arbitrary
//! add/update/delete interleavings.
//!
//! `nsLabelIndex` is never a source of truth: it is fully derivable from
//! `nsInfoMap` and `nsPodIndex`, and is rebuilt incrementally as those two
//! change (spec §9, "cyclic dependency"). Applying namespace-info changes
//! before pod-namespace changes, then recomputing `nsLabelIndex` from both,
//! resolves the cycle without needing two-phase commits.

use crate::types::{Labels, NamespaceInfo, ObjKey, PodInfo, PolicyInfo};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use std::net::IpAddr;

#[derive(Default)]
pub struct Indexes {
    pub policy_map: HashMap<ObjKey, PolicyInfo>,
    pods: HashMap<ObjKey, PodInfo>,
    pod_label_index: HashMap<(String, String, String), HashSet<ObjKey>>,
    ns_label_index: HashMap<(String, String), HashSet<ObjKey>>,
    ns_pod_index: HashMap<String, HashSet<ObjKey>>,
    pub ns_info_map: HashMap<String, NamespaceInfo>,
    /// Copy of each policy's `spec.podSelector`, kept alongside `policy_map`
    /// for fast lookup from pod-change handling without re-borrowing the
    /// whole `PolicyInfo`.
    pub spec_selector_map: HashMap<ObjKey, Labels>,
    /// Names referenced by the rule set emitted on the last compile. Reset
    /// at the start of every mode=All/Policy reconcile (spec §4.2 step 7).
    pub active_sets: HashSet<String>,
}

impl Indexes {
    pub fn new() -> Self {
        Self::default()
    }

    // === policy ===

    pub fn apply_policy_change(&mut self, ns: &str, name: &str, curr: Option<PolicyInfo>) {
        let key = (ns.to_string(), name.to_string());
        match curr {
            Some(info) => {
                self.spec_selector_map
                    .insert(key.clone(), info.pod_selector.clone());
                self.policy_map.insert(key, info);
            }
            None => {
                self.spec_selector_map.remove(&key);
                self.policy_map.remove(&key);
            }
        }
    }

    // === pods ===

    /// Applies a pod transitioning from `prev` to `curr`, maintaining
    /// `podLabelIndex`, `nsPodIndex` and the `nsLabelIndex` entries that
    /// depend on this namespace's pod membership (spec §3.3 invariants 1, 2,
    /// 4). Returns the set of `(key, value)` label pairs whose
    /// `podLabelIndex[(ns,*)]` entry changed, so callers can drive
    /// incremental set-sync.
    pub fn apply_pod_change(
        &mut self,
        ns: &str,
        name: &str,
        prev: Option<&PodInfo>,
        curr: Option<&PodInfo>,
    ) -> HashSet<(String, String)> {
        let key = (ns.to_string(), name.to_string());
        let prev_valid = prev.map(PodInfo::is_valid).unwrap_or(false);
        let curr_valid = curr.map(PodInfo::is_valid).unwrap_or(false);

        let mut touched_label_kvs = HashSet::default();

        if prev_valid {
            let prev = prev.unwrap();
            for (k, v) in &prev.labels {
                touched_label_kvs.insert((k.clone(), v.clone()));
                if let Some(set) = self
                    .pod_label_index
                    .get_mut(&(ns.to_string(), k.clone(), v.clone()))
                {
                    set.remove(&key);
                    if set.is_empty() {
                        self.pod_label_index
                            .remove(&(ns.to_string(), k.clone(), v.clone()));
                    }
                }
            }
            if let Some(set) = self.ns_pod_index.get_mut(ns) {
                set.remove(&key);
            }
        }

        if curr_valid {
            let curr = curr.unwrap();
            for (k, v) in &curr.labels {
                touched_label_kvs.insert((k.clone(), v.clone()));
                self.pod_label_index
                    .entry((ns.to_string(), k.clone(), v.clone()))
                    .or_default()
                    .insert(key.clone());
            }
            self.ns_pod_index
                .entry(ns.to_string())
                .or_default()
                .insert(key.clone());
            self.pods.insert(key, curr.clone());
        } else {
            self.pods.remove(&key);
        }

        // nsLabelIndex depends on this namespace's pod membership; rebuild
        // every label this namespace is currently tagged with (its
        // contribution to those unions may have just changed).
        if let Some(ns_info) = self.ns_info_map.get(ns).cloned() {
            for (k, v) in &ns_info.labels {
                self.rebuild_ns_label_entry(k, v);
            }
        }

        touched_label_kvs
    }

    // === namespaces ===

    /// Applies a namespace transitioning from `prev` to `curr`. Returns the
    /// `(key, value)` pairs whose `nsLabelIndex` entry needs resync.
    pub fn apply_namespace_change(
        &mut self,
        ns: &str,
        prev: Option<&NamespaceInfo>,
        curr: Option<&NamespaceInfo>,
    ) -> HashSet<(String, String)> {
        match curr {
            Some(info) => {
                self.ns_info_map.insert(ns.to_string(), info.clone());
            }
            None => {
                self.ns_info_map.remove(ns);
            }
        }

        let mut touched = HashSet::default();
        for info in [prev, curr].into_iter().flatten() {
            for (k, v) in &info.labels {
                touched.insert((k.clone(), v.clone()));
            }
        }
        for (k, v) in &touched {
            self.rebuild_ns_label_entry(k, v);
        }
        touched
    }

    /// `nsLabelIndex[(k,v)] = ⋃ { nsPodIndex[ns] | nsInfoMap[ns].labels[k] = v }`
    /// (spec §3.3 invariant 2). Rebuilt from scratch for the given pair
    /// rather than patched incrementally, since it's cheap relative to a
    /// kernel round-trip and trivially correct.
    fn rebuild_ns_label_entry(&mut self, key: &str, value: &str) {
        let mut union = HashSet::default();
        for (ns, info) in &self.ns_info_map {
            if info.labels.get(key).map(String::as_str) == Some(value) {
                if let Some(pods) = self.ns_pod_index.get(ns) {
                    union.extend(pods.iter().cloned());
                }
            }
        }
        if union.is_empty() {
            self.ns_label_index.remove(&(key.to_string(), value.to_string()));
        } else {
            self.ns_label_index
                .insert((key.to_string(), value.to_string()), union);
        }
    }

    // === queries used by the compiler / set-synchronizer ===

    pub fn pod_ip(&self, key: &ObjKey) -> Option<IpAddr> {
        self.pods.get(key).and_then(|p| p.ip)
    }

    fn resolve_ips(&self, keys: &HashSet<ObjKey>) -> Vec<IpAddr> {
        keys.iter().filter_map(|k| self.pod_ip(k)).collect()
    }

    pub fn pods_by_label(&self, ns: &str, key: &str, value: &str) -> Vec<IpAddr> {
        self.pod_label_index
            .get(&(ns.to_string(), key.to_string(), value.to_string()))
            .map(|s| self.resolve_ips(s))
            .unwrap_or_default()
    }

    pub fn pods_by_namespace(&self, ns: &str) -> Vec<IpAddr> {
        self.ns_pod_index
            .get(ns)
            .map(|s| self.resolve_ips(s))
            .unwrap_or_default()
    }

    pub fn pods_by_namespace_label(&self, key: &str, value: &str) -> Vec<IpAddr> {
        self.ns_label_index
            .get(&(key.to_string(), value.to_string()))
            .map(|s| self.resolve_ips(s))
            .unwrap_or_default()
    }

    /// AND-of-labels materialization for a `spec.podSelector` (spec §4.4):
    /// intersects the per-label `podLabelIndex` sets, iterating from the
    /// smallest one first to minimize work.
    pub fn pods_matching_all(&self, ns: &str, labels: &Labels) -> Vec<IpAddr> {
        if labels.is_empty() {
            return Vec::new();
        }
        let mut sets: Vec<&HashSet<ObjKey>> = labels
            .iter()
            .filter_map(|(k, v)| {
                self.pod_label_index
                    .get(&(ns.to_string(), k.clone(), v.clone()))
            })
            .collect();
        if sets.len() != labels.len() {
            // At least one label pair has no matching pods at all: the AND
            // is necessarily empty.
            return Vec::new();
        }
        sets.sort_by_key(|s| s.len());
        let (base, rest) = sets.split_first().expect("non-empty: checked above");
        let intersection: HashSet<ObjKey> = base
            .iter()
            .filter(|k| rest.iter().all(|s| s.contains(*k)))
            .cloned()
            .collect();
        self.resolve_ips(&intersection)
    }

    /// Every `(ns, key, value)` whose `specSelectorMap` entry's label set
    /// contains `(key, value)` — used to decide whether a pod-change's
    /// touched label needs the AND-of-labels set resynced too (spec §9,
    /// Open Question).
    pub fn spec_selectors_touching<'a>(
        &'a self,
        ns: &'a str,
        key: &'a str,
        value: &'a str,
    ) -> impl Iterator<Item = &'a ObjKey> + 'a {
        self.spec_selector_map.iter().filter_map(move |(pkey, labels)| {
            if pkey.0 == ns && labels.get(key).map(String::as_str) == Some(value) {
                Some(pkey)
            } else {
                None
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PodPhase;

    fn pod(ip: &str, labels: &[(&str, &str)]) -> PodInfo {
        PodInfo {
            ip: Some(ip.parse().unwrap()),
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            host_network: false,
            phase: PodPhase::Running,
        }
    }

    #[test]
    fn empty_ip_transparency() {
        let mut idx = Indexes::new();
        let empty = PodInfo {
            ip: None,
            labels: Default::default(),
            host_network: false,
            phase: PodPhase::Running,
        };
        idx.apply_pod_change("ns", "p", None, Some(&empty));
        idx.apply_pod_change("ns", "p", Some(&empty), None);
        assert!(idx.pods_by_namespace("ns").is_empty());
        assert!(idx.pod_label_index.is_empty());
    }

    #[test]
    fn pod_label_index_tracks_valid_pods() {
        let mut idx = Indexes::new();
        idx.apply_pod_change("ns", "p1", None, Some(&pod("10.0.0.1", &[("run", "x")])));
        idx.apply_pod_change("ns", "p2", None, Some(&pod("10.0.0.2", &[("run", "x")])));
        let mut ips = idx.pods_by_label("ns", "run", "x");
        ips.sort();
        assert_eq!(ips, vec!["10.0.0.1".parse().unwrap(), "10.0.0.2".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn ns_label_index_unions_across_namespaces() {
        let mut idx = Indexes::new();
        idx.apply_namespace_change("ns1", None, Some(&NamespaceInfo { labels: [("team".into(), "x".into())].into() }));
        idx.apply_namespace_change("ns2", None, Some(&NamespaceInfo { labels: [("team".into(), "x".into())].into() }));
        idx.apply_pod_change("ns1", "p1", None, Some(&pod("10.0.0.1", &[])));
        idx.apply_pod_change("ns2", "p2", None, Some(&pod("10.0.0.2", &[])));
        let mut ips = idx.pods_by_namespace_label("team", "x");
        ips.sort();
        assert_eq!(ips.len(), 2);
    }

    #[test]
    fn and_of_labels_intersection() {
        let mut idx = Indexes::new();
        idx.apply_pod_change("ns", "p1", None, Some(&pod("10.0.0.1", &[("a", "1"), ("b", "2")])));
        idx.apply_pod_change("ns", "p2", None, Some(&pod("10.0.0.2", &[("a", "1")])));
        let labels: Labels = [("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())].into();
        let ips = idx.pods_matching_all("ns", &labels);
        assert_eq!(ips, vec!["10.0.0.1".parse::<IpAddr>().unwrap()]);
    }
}
