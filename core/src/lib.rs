#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The reconciliation engine for a per-node network-policy enforcement controller.
//!
//! This crate is kernel-agnostic: it owns the indexing data model, the
//! change-coalescing buffers, the selector-to-rule compiler and the
//! reconcile loop, but it never shells out to `iptables`/`ipset` itself.
//! Callers provide [`kernel::IpTables`], [`kernel::IpTablesBatch`] and
//! [`kernel::IpSet`] implementations and drive the three [`handlers`] traits
//! from a cluster event source.

pub mod changes;
pub mod compiler;
pub mod handlers;
pub mod indexes;
pub mod kernel;
pub mod naming;
pub mod reconcile;
pub mod sets;
pub mod types;

pub use ipnet::{IpNet, Ipv4Net, Ipv6Net};

/// Reserved name prefix. Every chain and set this controller creates starts
/// with this string; `--cleanup-config` removes everything that does.
pub const RESERVED_PREFIX: &str = "ENN";

/// Cluster-wide, effectively-static configuration derived from CLI flags.
///
/// Shared (via `Arc`) between the reconciler, the compiler and the set
/// synchronizer; never mutated after startup.
#[derive(Clone, Debug)]
pub struct ClusterInfo {
    /// Restricts policy enforcement to this CIDR. `0.0.0.0/0` disables the
    /// restriction (see §4.3 step 4c: the match degenerates to an
    /// unconditional jump).
    pub ip_range: IpNet,

    /// When set, the per-namespace policy chain ACCEPTs traffic from/to the
    /// node-local pod-network ranges before consulting the policy rules.
    pub flannel_network: Option<FlannelConfig>,
}

#[derive(Clone, Debug)]
pub struct FlannelConfig {
    pub network: IpNet,
    pub subnet_len_bits: u8,
}

impl ClusterInfo {
    pub fn accept_flannel_ip(&self) -> bool {
        self.flannel_network.is_some()
    }
}
