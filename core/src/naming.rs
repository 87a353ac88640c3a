//! Deterministic chain/set name derivation (spec §4.3).
//!
//! Every emitted chain or set name is `<prefix>-<base32(sha256(key))[:16]>`,
//! where `key` concatenates the fields that make the name unique. Keys of a
//! multi-label selector are sorted before hashing so permuting a map's
//! iteration order never changes the resulting name (spec §8.1, invariant 4).

use crate::RESERVED_PREFIX;
use sha2::{Digest, Sha256};

const HASH_LEN: usize = 16;

/// Chain/set name prefixes, all namespaced under [`RESERVED_PREFIX`].
pub mod prefix {
    pub const INPUT: &str = "ENN-INPUT";
    pub const OUTPUT: &str = "ENN-OUTPUT";
    pub const FORWARD: &str = "ENN-FORWARD";
    pub const INGRESS: &str = "ENN-INGRESS-";
    pub const EGRESS: &str = "ENN-EGRESS-";
    pub const POLICY_IN: &str = "ENN-PLY-IN-";
    pub const POLICY_EGRESS: &str = "ENN-PLY-E-";
    pub const DISPATCH: &str = "ENN-DPATCH-";
    pub const IPCIDR: &str = "ENN-IPCIDR-";
    pub const RANGEIP: &str = "ENN-RANGEIP-";
    pub const FLANNEL: &str = "ENN-FLANNEL-";
    pub const NS: &str = "ENN-NS-";
    pub const PODSET: &str = "ENN-PODSET-";
    pub const NSSET: &str = "ENN-NSSET-";
    pub const IPTSET: &str = "ENN-IPTSET-";
}

/// Joins `parts` with `\0` and hashes the result, truncated to 16 base32
/// characters. The separator prevents `("a", "bc")` and `("ab", "c")` from
/// colliding.
fn hash_key(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(b"\0");
        }
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();
    let encoded = base32::encode(base32::Alphabet::Rfc4648 { padding: false }, &digest);
    encoded[..HASH_LEN.min(encoded.len())].to_ascii_lowercase()
}

fn named(prefix: &str, parts: &[&str]) -> String {
    format!("{prefix}{}", hash_key(parts))
}

pub fn ns_entry_ingress_chain(ns: &str) -> String {
    format!("{}{}", prefix::INGRESS, hash_key(&[ns]))
}

pub fn ns_entry_egress_chain(ns: &str) -> String {
    format!("{}{}", prefix::EGRESS, hash_key(&[ns]))
}

pub fn ns_set(ns: &str) -> String {
    named(prefix::NS, &[ns])
}

/// Set name for one `(key, value)` label pair, scoped to a namespace (used
/// for `podSelector`/`spec.podSelector` per-label sets).
pub fn pod_label_set(ns: &str, key: &str, value: &str) -> String {
    named(prefix::PODSET, &["pod", ns, key, value])
}

/// Set name for the AND-of-labels intersection of a policy's
/// `spec.podSelector`. `pairs` must already be sorted lexicographically by
/// key (see [`crate::types::sorted_pairs`]).
pub fn spec_selector_set(ns: &str, pairs: &[(&str, &str)]) -> String {
    let mut parts = vec![ns];
    for (k, v) in pairs {
        parts.push(k);
        parts.push(v);
    }
    named(prefix::PODSET, &parts)
}

/// Set name for a namespace-label `(key, value)` pair (used by
/// `namespaceSelector` peers; not scoped to a namespace since it unions pods
/// across every namespace carrying that label).
pub fn ns_label_set(key: &str, value: &str) -> String {
    named(prefix::NSSET, &[key, value])
}

pub fn range_set() -> String {
    format!("{}global", prefix::RANGEIP)
}

pub fn flannel_set() -> String {
    format!("{}node", prefix::FLANNEL)
}

pub fn except_cidr_set(
    ns: &str,
    policy: &str,
    direction: &str,
    rule_idx: usize,
    peer_idx: usize,
) -> String {
    named(
        prefix::IPTSET,
        &[
            ns,
            policy,
            direction,
            rule_idx.to_string().as_str(),
            peer_idx.to_string().as_str(),
        ],
    )
}

pub fn ipblock_chain(
    ns: &str,
    policy: &str,
    direction: &str,
    rule_idx: usize,
    peer_idx: usize,
) -> String {
    named(
        prefix::IPCIDR,
        &[
            ns,
            policy,
            direction,
            rule_idx.to_string().as_str(),
            peer_idx.to_string().as_str(),
        ],
    )
}

pub fn policy_chain(ns: &str, direction: &str) -> String {
    let p = match direction {
        "ingress" => prefix::POLICY_IN,
        _ => prefix::POLICY_EGRESS,
    };
    named(p, &[ns])
}

/// Dispatch chain for one `(policy, direction, rule-index, peer-index)`
/// tuple; a policy chain may hold several identically-tagged dispatch chains
/// (one per OR'd peer) so the rule/peer index must be part of the key.
pub fn dispatch_chain(
    ns: &str,
    policy: &str,
    direction: &str,
    rule_idx: usize,
    peer_idx: usize,
    kind: &str,
) -> String {
    named(
        prefix::DISPATCH,
        &[
            ns,
            policy,
            direction,
            kind,
            rule_idx.to_string().as_str(),
            peer_idx.to_string().as_str(),
        ],
    )
}

/// Whether `name` is owned by this controller (spec §6.2).
pub fn is_reserved(name: &str) -> bool {
    name.starts_with(RESERVED_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pure_function_of_inputs() {
        assert_eq!(pod_label_set("ns", "a", "b"), pod_label_set("ns", "a", "b"));
        assert_ne!(pod_label_set("ns", "a", "b"), pod_label_set("ns", "a", "c"));
    }

    #[test]
    fn sorted_pairs_permutation_invariant() {
        let a = spec_selector_set("ns", &[("a", "1"), ("b", "2")]);
        let b = spec_selector_set("ns", &[("a", "1"), ("b", "2")]);
        assert_eq!(a, b, "same sorted input must yield the same name");
    }

    #[test]
    fn reserved_prefix_contract() {
        assert!(is_reserved(&ns_set("foo")));
        assert!(!is_reserved("KUBE-SERVICES"));
    }
}
