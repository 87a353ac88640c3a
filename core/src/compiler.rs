//! The selector-to-rule compiler (spec §4.3): walks `policyMap` and emits a
//! `*filter`-scoped `iptables-restore` payload plus the full set of
//! address-set names the payload references.

use crate::{
    indexes::Indexes,
    kernel::{SetDesc, SetType},
    naming::{self, prefix},
    types::{Labels, Peer, PolicyKinds, RuleInfo},
    ClusterInfo,
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use std::fmt::Write as _;

/// Existing chains as reported by `iptables-save` before this compile,
/// keyed by chain name, holding the raw `:CHAIN - [pkts:bytes]` line so an
/// unaffected chain's counters survive the restore (spec §4.3 step 1, 3).
pub type ExistingChains = HashMap<String, String>;

pub struct CompileOutput {
    pub payload: Vec<u8>,
    pub active_chains: HashSet<String>,
    pub active_sets: HashMap<String, SetDesc>,
}

struct Buffers {
    chain_defs: String,
    rules: String,
    active_chains: HashSet<String>,
    active_sets: HashMap<String, SetDesc>,
}

impl Buffers {
    fn chain_line(&mut self, existing: &ExistingChains, name: &str) {
        if self.active_chains.contains(name) {
            return;
        }
        self.active_chains.insert(name.to_string());
        match existing.get(name) {
            Some(line) => writeln!(self.chain_defs, "{line}").unwrap(),
            None => writeln!(self.chain_defs, ":{name} - [0:0]").unwrap(),
        }
    }

    fn rule(&mut self, line: &str) {
        writeln!(self.rules, "{line}").unwrap();
    }

    fn register_set(&mut self, name: String, set_type: SetType) {
        self.active_sets
            .entry(name.clone())
            .or_insert(SetDesc { name, set_type });
    }
}

/// Runs the emission algorithm in spec §4.3 steps 2-7 (steps 1 and 8 are the
/// caller's responsibility, since they involve the kernel adapters).
pub fn compile(
    indexes: &Indexes,
    cluster_info: &ClusterInfo,
    existing_chains: &ExistingChains,
) -> CompileOutput {
    let mut buf = Buffers {
        chain_defs: String::new(),
        rules: String::new(),
        active_chains: HashSet::default(),
        active_sets: HashMap::default(),
    };

    writeln!(buf.chain_defs, "*filter").unwrap();
    for root in [prefix::INPUT, prefix::OUTPUT, prefix::FORWARD] {
        buf.chain_line(existing_chains, root);
    }

    // Namespaces whose entry chains have already been emitted this
    // reconcile (spec §4.3 "Per-namespace entry chains are emitted at most
    // once per reconcile even if multiple policies live in that namespace").
    let mut ns_entries_done: HashSet<String> = HashSet::default();

    let mut policies: Vec<_> = indexes.policy_map.iter().collect();
    policies.sort_by(|a, b| a.0.cmp(b.0));

    for ((ns, name), policy) in policies {
        let ns_set = naming::ns_set(ns);
        buf.register_set(ns_set.clone(), SetType::HashIp);

        if ns_entries_done.insert(ns.clone()) {
            if policy.kinds.contains(PolicyKinds::INGRESS) {
                emit_namespace_entry(&mut buf, existing_chains, ns, &ns_set, "ingress");
            }
            if policy.kinds.contains(PolicyKinds::EGRESS) {
                emit_namespace_entry(&mut buf, existing_chains, ns, &ns_set, "egress");
            }
        }

        let spec_pairs: Vec<(&str, &str)> = policy
            .pod_selector
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        if !spec_pairs.is_empty() {
            buf.register_set(
                naming::spec_selector_set(ns, &spec_pairs),
                SetType::HashIp,
            );
            for (k, v) in &spec_pairs {
                buf.register_set(naming::pod_label_set(ns, k, v), SetType::HashIp);
            }
        }

        if policy.kinds.contains(PolicyKinds::INGRESS) {
            let policy_chain = naming::policy_chain(ns, "ingress");
            buf.chain_line(existing_chains, &policy_chain);
            emit_ip_range_jump(&mut buf, &naming::ns_entry_ingress_chain(ns), &policy_chain, cluster_info, "src", "dst");
            for (rule_idx, rule) in policy.ingress.iter().enumerate() {
                emit_rule(&mut buf, existing_chains, ns, name, "ingress", rule_idx, rule, &policy.pod_selector, &policy_chain);
            }
        }

        if policy.kinds.contains(PolicyKinds::EGRESS) {
            let policy_chain = naming::policy_chain(ns, "egress");
            buf.chain_line(existing_chains, &policy_chain);
            emit_ip_range_jump(&mut buf, &naming::ns_entry_egress_chain(ns), &policy_chain, cluster_info, "dst", "src");
            for (rule_idx, rule) in policy.egress.iter().enumerate() {
                emit_rule(&mut buf, existing_chains, ns, name, "egress", rule_idx, rule, &policy.pod_selector, &policy_chain);
            }
        }
    }

    // Step 5: stateful-accept prepend + default reject terminator on every
    // policy chain.
    let mut policy_chains: Vec<String> = buf
        .active_chains
        .iter()
        .filter(|c| c.starts_with(prefix::POLICY_IN) || c.starts_with(prefix::POLICY_EGRESS))
        .cloned()
        .collect();
    policy_chains.sort();
    for chain in &policy_chains {
        buf.rule(&format!(
            "-I {chain} -m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT"
        ));
    }
    for chain in &policy_chains {
        buf.rule(&format!(
            r#"-A {chain} -m comment --comment "default reject rule" -j REJECT"#
        ));
    }

    // Step 6: flush+delete chains from the prior snapshot that are reserved
    // but no longer active.
    let reclaimable_prefixes = [
        prefix::INGRESS,
        prefix::EGRESS,
        prefix::POLICY_IN,
        prefix::POLICY_EGRESS,
        prefix::DISPATCH,
        prefix::IPCIDR,
    ];
    let mut stale: Vec<&String> = existing_chains
        .keys()
        .filter(|name| {
            !buf.active_chains.contains(*name)
                && reclaimable_prefixes.iter().any(|p| name.starts_with(p))
        })
        .collect();
    stale.sort();
    for chain in stale {
        writeln!(buf.chain_defs, "{}", existing_chains[chain]).unwrap();
        buf.rule(&format!("-X {chain}"));
    }

    buf.rule("COMMIT");

    let mut payload = Vec::new();
    payload.extend_from_slice(buf.chain_defs.as_bytes());
    payload.extend_from_slice(buf.rules.as_bytes());

    CompileOutput {
        payload,
        active_chains: buf.active_chains,
        active_sets: buf.active_sets,
    }
}

fn emit_namespace_entry(
    buf: &mut Buffers,
    existing: &ExistingChains,
    ns: &str,
    ns_set: &str,
    direction: &str,
) {
    let entry = match direction {
        "ingress" => naming::ns_entry_ingress_chain(ns),
        _ => naming::ns_entry_egress_chain(ns),
    };
    buf.chain_line(existing, &entry);
    let matched_side = match direction {
        "ingress" => "dst",
        _ => "src",
    };
    buf.rule(&format!(
        r#"-A {} -m set --match-set {ns_set} {matched_side} -m comment --comment "{direction} entry for namespace/{ns}" -j {entry}"#,
        prefix::FORWARD,
    ));
    buf.rule(&format!(
        r#"-A {} -m set --match-set {ns_set} {matched_side} -m comment --comment "{direction} entry for namespace/{ns}" -j {entry}"#,
        prefix::OUTPUT,
    ));
}

/// Emits the body of a namespace entry chain: optional flannel ACCEPT, the
/// IP-range match jumping into `policy_chain`, and the unrestricted-traffic
/// tail (spec §4.3 step 4c). `flannel_dir`/`range_dir` are the match
/// directions appropriate to the entry chain's direction (ingress matches
/// the peer on `src`, egress on `dst`).
fn emit_ip_range_jump(
    buf: &mut Buffers,
    entry_chain: &str,
    policy_chain: &str,
    cluster_info: &ClusterInfo,
    flannel_dir: &str,
    range_dir: &str,
) {
    if let Some(flannel) = &cluster_info.flannel_network {
        let set = naming::flannel_set();
        buf.register_set(set.clone(), SetType::HashIp);
        buf.rule(&format!(
            r#"-A {entry_chain} -m set --match-set {set} {flannel_dir} -m comment --comment "match flannel ip net: {}" -j ACCEPT"#,
            flannel.network
        ));
    }

    if cluster_info.ip_range.prefix_len() == 0 {
        buf.rule(&format!(
            r#"-A {entry_chain} -m comment --comment "ip range is default value {} so directly jump to policy chain" -j {policy_chain}"#,
            cluster_info.ip_range
        ));
    } else {
        let range_set = naming::range_set();
        buf.register_set(range_set.clone(), SetType::HashNet);
        buf.rule(&format!(
            r#"-A {entry_chain} -m set --match-set {range_set} {range_dir} -m comment --comment "match ip range {}" -j {policy_chain}"#,
            cluster_info.ip_range
        ));
        buf.rule(&format!(
            r#"-A {entry_chain} -m comment --comment "accept other traffic beyond ip range" -j ACCEPT"#
        ));
    }
}

/// Emits the dispatch chains for one rule's peers (spec §4.3 step 4d/4e).
/// `self_dir`/`peer_dir` are "dst"/"src" for ingress or "src"/"dst" for
/// egress, matching the policy's own selected pods vs. the rule's peers.
#[allow(clippy::too_many_arguments)]
fn emit_rule(
    buf: &mut Buffers,
    existing_chains: &ExistingChains,
    ns: &str,
    policy_name: &str,
    direction: &str,
    rule_idx: usize,
    rule: &RuleInfo,
    spec_selector: &Labels,
    policy_chain: &str,
) {
    let (self_dir, peer_dir) = match direction {
        "ingress" => ("dst", "src"),
        _ => ("src", "dst"),
    };

    for (peer_idx, peer) in rule.effective_peers().iter().enumerate() {
        let kind = peer.kind_tag();
        let dispatch = naming::dispatch_chain(ns, policy_name, direction, rule_idx, peer_idx, kind);
        buf.chain_line(existing_chains, &dispatch);
        buf.rule(&format!(
            r#"-A {policy_chain} -m comment --comment "policy {ns}:{policy_name} entry for {kind}" -j {dispatch}"#
        ));

        let spec_pairs: Vec<(&str, &str)> =
            spec_selector.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let spec_match = (!spec_pairs.is_empty())
            .then(|| naming::spec_selector_set(ns, &spec_pairs));

        match peer {
            Peer::OnlyPorts => emit_accepts(buf, &dispatch, &rule.ports, self_dir, spec_match.as_deref(), None),
            Peer::PodSelector(labels) => {
                let pairs: Vec<(&str, &str)> =
                    labels.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
                for (k, v) in &pairs {
                    buf.register_set(naming::pod_label_set(ns, k, v), SetType::HashIp);
                }
                let peer_set = if pairs.len() == 1 {
                    naming::pod_label_set(ns, pairs[0].0, pairs[0].1)
                } else {
                    naming::spec_selector_set(ns, &pairs)
                };
                buf.register_set(peer_set.clone(), SetType::HashIp);
                emit_accepts(
                    buf,
                    &dispatch,
                    &rule.ports,
                    self_dir,
                    spec_match.as_deref(),
                    Some((&peer_set, peer_dir)),
                );
            }
            Peer::NamespaceSelector(labels) => {
                let pairs: Vec<(&str, &str)> =
                    labels.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
                for (k, v) in &pairs {
                    buf.register_set(naming::ns_label_set(k, v), SetType::HashIp);
                }
                // Multiple namespace-label keys AND together via one
                // combined set name, mirroring the spec-selector scheme
                // (spec §3.1: "keys within one map are AND").
                let peer_set = if pairs.len() == 1 {
                    naming::ns_label_set(pairs[0].0, pairs[0].1)
                } else {
                    let mut sorted = pairs.clone();
                    sorted.sort();
                    naming::spec_selector_set("ns-label", &sorted)
                };
                buf.register_set(peer_set.clone(), SetType::HashIp);
                emit_accepts(
                    buf,
                    &dispatch,
                    &rule.ports,
                    self_dir,
                    spec_match.as_deref(),
                    Some((&peer_set, peer_dir)),
                );
            }
            Peer::IpBlock(block) => {
                let except_set = naming::except_cidr_set(ns, policy_name, direction, rule_idx, peer_idx);
                buf.register_set(except_set.clone(), SetType::HashNet);
                let ip_chain = naming::ipblock_chain(ns, policy_name, direction, rule_idx, peer_idx);
                buf.chain_line(existing_chains, &ip_chain);

                let cidr_flag = match direction {
                    "ingress" => "-s",
                    _ => "-d",
                };
                emit_ipblock_dispatch(
                    buf,
                    &dispatch,
                    &rule.ports,
                    self_dir,
                    spec_match.as_deref(),
                    cidr_flag,
                    &block.cidr.to_string(),
                    &ip_chain,
                );

                let except_dir = match direction {
                    "ingress" => "src",
                    _ => "dst",
                };
                buf.rule(&format!(
                    r#"-A {ip_chain} -m comment --comment "reject rule selected by policy {ns}/{policy_name}: except cidr" -m set --match-set {except_set} {except_dir} -j REJECT"#
                ));
                buf.rule(&format!(
                    r#"-A {ip_chain} -m comment --comment "accept default traffic of cidr {}" -j ACCEPT"#,
                    block.cidr
                ));
            }
        }
    }
}

fn port_clause(port: &crate::types::PortMatch) -> String {
    let p = match &port.port {
        crate::types::PortRef::Number(n) => n.to_string(),
        crate::types::PortRef::Name(n) => n.clone(),
    };
    format!("-p {} --dport {p}", port.protocol.as_iptables_str())
}

fn emit_accepts(
    buf: &mut Buffers,
    dispatch: &str,
    ports: &[crate::types::PortMatch],
    self_dir: &str,
    spec_match: Option<&str>,
    peer_match: Option<(&str, &str)>,
) {
    let mut base = format!(r#"-A {dispatch} -m comment --comment "accept""#);
    if let Some(set) = spec_match {
        let _ = write!(base, " -m set --match-set {set} {self_dir}");
    }
    if let Some((set, dir)) = peer_match {
        let _ = write!(base, " -m set --match-set {set} {dir}");
    }
    if ports.is_empty() {
        buf.rule(&format!("{base} -j ACCEPT"));
    } else {
        for port in ports {
            buf.rule(&format!("{base} {} -j ACCEPT", port_clause(port)));
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn emit_ipblock_dispatch(
    buf: &mut Buffers,
    dispatch: &str,
    ports: &[crate::types::PortMatch],
    self_dir: &str,
    spec_match: Option<&str>,
    cidr_flag: &str,
    cidr: &str,
    target_chain: &str,
) {
    let mut base = format!(r#"-A {dispatch} -m comment --comment "dispatch to ipBlock""#);
    if let Some(set) = spec_match {
        let _ = write!(base, " -m set --match-set {set} {self_dir}");
    }
    let _ = write!(base, " {cidr_flag} {cidr}");
    if ports.is_empty() {
        buf.rule(&format!("{base} -j {target_chain}"));
    } else {
        for port in ports {
            buf.rule(&format!("{base} {} -j {target_chain}", port_clause(port)));
        }
    }
}
