//! Abstract kernel-adapter interfaces (spec §6.4). The core depends only on
//! these traits; concrete implementations that shell out to `iptables`,
//! `iptables-save`/`iptables-restore` and `ipset` live in the daemon binary.

use async_trait::async_trait;
use ipnet::IpNet;
use std::net::IpAddr;

pub mod fake;

#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("command exited with status {status}: {stderr}")]
    NonZeroExit { status: i32, stderr: String },
    #[error("failed to spawn command: {0}")]
    Spawn(#[from] std::io::Error),
}

pub type KernelResult<T> = Result<T, KernelError>;

/// An `ipset` entry. The core only produces the first two variants (spec
/// §6.4); `HashIpPort`/`HashNetPort` exist so the adapter's wire type is
/// complete even though nothing downstream constructs them yet.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Entry {
    Ip(IpAddr),
    Net(IpNet),
    IpPort(IpAddr, u16),
    NetPort(IpNet, u16),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetType {
    HashIp,
    HashNet,
    HashIpPort,
    HashNetPort,
}

impl SetType {
    pub fn as_ipset_str(&self) -> &'static str {
        match self {
            SetType::HashIp => "hash:ip",
            SetType::HashNet => "hash:net",
            SetType::HashIpPort => "hash:ip,port",
            SetType::HashNetPort => "hash:net,port",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetDesc {
    pub name: String,
    pub set_type: SetType,
}

/// Direct `iptables` invocations (spec §6.4): chain management and a
/// single-rule prepend used to idempotently wire the three root chains into
/// INPUT/OUTPUT/FORWARD.
#[async_trait]
pub trait IpTables: Send + Sync {
    async fn new_chain(&self, table: &str, chain: &str) -> KernelResult<()>;
    /// Prepends `rule_spec` to `chain` iff an identical rule isn't already
    /// present (idempotent; spec §4.3 tie-break rules).
    async fn prepend_unique(&self, table: &str, chain: &str, rule_spec: &str) -> KernelResult<()>;
    async fn delete(&self, table: &str, chain: &str, rule_spec: &str) -> KernelResult<()>;
    async fn list(&self, table: &str, chain: &str) -> KernelResult<Vec<String>>;
    async fn list_chains(&self, table: &str) -> KernelResult<Vec<String>>;
    async fn clear_chain(&self, table: &str, chain: &str) -> KernelResult<()>;
    async fn delete_chain(&self, table: &str, chain: &str) -> KernelResult<()>;
    async fn exists(&self, table: &str, chain: &str, rule_spec: &str) -> KernelResult<bool>;
}

/// Bulk `iptables-save`/`iptables-restore` (spec §6.4), used by the compiler
/// to snapshot existing chains and commit a whole-table payload in one
/// transaction.
#[async_trait]
pub trait IpTablesBatch: Send + Sync {
    async fn save_into(&self, table: &str) -> KernelResult<Vec<u8>>;
    async fn restore_all(&self, payload: &[u8], noflush: bool, counters: bool)
        -> KernelResult<()>;
}

/// `ipset` (spec §6.4).
#[async_trait]
pub trait IpSet: Send + Sync {
    async fn create(&self, set: &SetDesc, ignore_exist: bool) -> KernelResult<()>;
    async fn destroy(&self, set: &str) -> KernelResult<()>;
    async fn list_names(&self) -> KernelResult<Vec<String>>;
    async fn get(&self, name: &str) -> KernelResult<Option<SetDesc>>;
    async fn add_entry(&self, set: &str, entry: &Entry, ignore_exist: bool) -> KernelResult<()>;
    async fn del_entry(&self, set: &str, entry: &Entry, ignore_exist: bool) -> KernelResult<()>;
    async fn list_entries(&self, set: &str) -> KernelResult<Vec<Entry>>;
}

/// The reconciler needs all three kernel capabilities together; blanket-impl'd
/// so any adapter bundle implementing the three traits satisfies this one too.
pub trait Kernel: IpTables + IpTablesBatch + IpSet {}
impl<T: IpTables + IpTablesBatch + IpSet> Kernel for T {}
