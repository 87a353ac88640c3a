//! Conversion from `metav1.LabelSelector` wire objects into the core's
//! `Labels` map.
//!
//! The data model (spec §3) only carries exact-match label maps: a policy's
//! `podSelector`/`namespaceSelector` peers are represented as `Map<K,V>` with
//! AND-of-keys semantics, not an arbitrary expression tree. `matchExpressions`
//! has no representation in that model, exactly as the original daemon only
//! ever read `.MatchLabels` off the selector and never consulted
//! `.MatchExpressions` at all.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use netpold_core::types::Labels;

/// Extracts `selector.matchLabels` into a `Labels` map. If the selector also
/// carries `matchExpressions`, they're logged and dropped rather than
/// silently ignored, since a selector that looks more restrictive than what
/// we actually enforce is a correctness trap for whoever wrote the policy.
pub fn match_labels(selector: &LabelSelector) -> Labels {
    if let Some(exprs) = selector.match_expressions.as_ref() {
        if !exprs.is_empty() {
            tracing::warn!(
                count = exprs.len(),
                "selector uses matchExpressions, which this controller does not enforce; \
                 only matchLabels is applied"
            );
        }
    }
    selector.match_labels.clone().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn extracts_match_labels() {
        let mut ml = BTreeMap::new();
        ml.insert("run1".to_string(), "test1".to_string());
        let selector = LabelSelector {
            match_labels: Some(ml.clone()),
            match_expressions: None,
        };
        assert_eq!(match_labels(&selector), ml);
    }

    #[test]
    fn defaults_to_empty_when_selector_is_empty() {
        let selector = LabelSelector::default();
        assert!(match_labels(&selector).is_empty());
    }
}
