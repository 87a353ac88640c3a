//! Change-maps: coalesce previous→current object deltas between reconciles
//! (spec §4.1).

use crate::types::{Labels, NamespaceInfo, ObjKey, PodInfo, PolicyInfo};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use parking_lot::Mutex;

/// One coalesced delta: the value the key had before this burst of updates
/// started, and its value as of the most recent update. `previous == None`
/// with `current == Some` is an Add; the reverse is a Delete; both `Some`
/// with different values is an Update.
#[derive(Clone, Debug, Default)]
struct Delta<V> {
    previous: Option<V>,
    current: Option<V>,
}

/// A `(ns, name) -> {previous, current}` map guarded by its own lock, so
/// handlers can record deltas while a reconcile walks a snapshot of a
/// *different* change-map (spec §5).
pub struct ChangeMap<V> {
    inner: Mutex<HashMap<ObjKey, Delta<V>>>,
}

impl<V> Default for ChangeMap<V> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(HashMap::default()),
        }
    }
}

impl<V: Clone + PartialEq> ChangeMap<V> {
    /// Implements the five-step algorithm from spec §4.1. Returns `true` iff
    /// the map is non-empty after this update (i.e. there is unconsumed
    /// work for the next reconcile).
    pub fn update(&self, key: ObjKey, previous: Option<V>, current: Option<V>) -> bool {
        let mut map = self.inner.lock();
        match map.entry(key) {
            std::collections::hash_map::Entry::Vacant(e) => {
                // First delta of a burst: preserve the original previous
                // value even if later updates coalesce on top of it.
                let net_changed = previous != current;
                if net_changed {
                    e.insert(Delta { previous, current });
                }
            }
            std::collections::hash_map::Entry::Occupied(mut e) => {
                let slot = e.get_mut();
                slot.current = current;
                if slot.previous == slot.current {
                    e.remove();
                }
            }
        }
        !map.is_empty()
    }

    /// Drains the map, returning every coalesced `(key, previous, current)`
    /// triple, and clears it. Used by a reconcile to apply the full burst of
    /// buffered deltas atomically (spec §4.2 step 7).
    pub fn drain(&self) -> Vec<(ObjKey, Option<V>, Option<V>)> {
        let mut map = self.inner.lock();
        map.drain()
            .map(|(k, d)| (k, d.previous, d.current))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Clears every entry without applying them. Used after a forced
    /// mode=All reconcile that rebuilt indexes directly from a full list
    /// rather than from this map.
    pub fn clear_up_item(&self) {
        self.inner.lock().clear();
    }
}

pub type PolicyChanges = ChangeMap<PolicyInfo>;
pub type PodChanges = ChangeMap<PodInfo>;
pub type NamespaceChanges = ChangeMap<NamespaceInfo>;

/// Fan-out buffers derived from pod events, used to drive the *incremental*
/// (mode=Pod) address-set sync without rebuilding every index from scratch
/// (spec §4.1, §4.4). These are populated by the same call that updates the
/// main [`PodChanges`] map and cleared together by [`PodFanout::clear`].
#[derive(Default)]
pub struct PodFanout {
    /// `(namespace, key, value)` tuples whose `podLabelIndex` membership may
    /// have changed.
    pub touched_labels: Mutex<HashSet<(String, String, String)>>,
    /// Namespaces whose `nsPodIndex` membership may have changed.
    pub touched_namespaces: Mutex<HashSet<String>>,
}

impl PodFanout {
    /// Records the namespace and label deltas implied by a pod transitioning
    /// from `previous` to `current`. Both label sets are recorded (not just
    /// the symmetric difference) because an unchanged `(k,v)` pair can still
    /// need a resync if the pod's *membership* in the set changed due to
    /// validity rather than labels.
    pub fn record(&self, ns: &str, previous: Option<&PodInfo>, current: Option<&PodInfo>) {
        self.touched_namespaces.lock().insert(ns.to_string());
        let mut labels = self.touched_labels.lock();
        for info in [previous, current].into_iter().flatten() {
            for (k, v) in &info.labels {
                labels.insert((ns.to_string(), k.clone(), v.clone()));
            }
        }
    }

    pub fn drain_labels(&self) -> HashSet<(String, String, String)> {
        std::mem::take(&mut *self.touched_labels.lock())
    }

    pub fn drain_namespaces(&self) -> HashSet<String> {
        std::mem::take(&mut *self.touched_namespaces.lock())
    }

    pub fn clear(&self) {
        self.touched_labels.lock().clear();
        self.touched_namespaces.lock().clear();
    }
}

/// Fan-out buffer derived from namespace events: which namespace-label
/// `(key, value)` pairs changed, used to drive incremental `nsLabelIndex`
/// resync (spec §4.1, §4.4).
#[derive(Default)]
pub struct NamespaceFanout {
    pub touched_labels: Mutex<HashSet<(String, String)>>,
}

impl NamespaceFanout {
    pub fn record(&self, previous: Option<&Labels>, current: Option<&Labels>) {
        let mut labels = self.touched_labels.lock();
        for set in [previous, current].into_iter().flatten() {
            for (k, v) in set {
                labels.insert((k.clone(), v.clone()));
            }
        }
    }

    pub fn drain(&self) -> HashSet<(String, String)> {
        std::mem::take(&mut *self.touched_labels.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_net_effect_removes_entry() {
        let cm: ChangeMap<i32> = ChangeMap::default();
        assert!(cm.update(("ns".into(), "a".into()), None, Some(1)));
        assert!(cm.update(("ns".into(), "a".into()), Some(1), Some(2)));
        // Net effect is zero: back to the original value.
        assert!(!cm.update(("ns".into(), "a".into()), Some(2), Some(1)));
        assert!(cm.is_empty());
    }

    #[test]
    fn first_previous_of_a_burst_is_preserved() {
        let cm: ChangeMap<i32> = ChangeMap::default();
        cm.update(("ns".into(), "a".into()), Some(1), Some(2));
        cm.update(("ns".into(), "a".into()), Some(2), Some(3));
        let drained = cm.drain();
        assert_eq!(drained, vec![(("ns".into(), "a".into()), Some(1), Some(3))]);
    }
}
