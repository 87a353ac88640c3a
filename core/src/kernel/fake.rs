//! An in-memory `Kernel` implementation (spec §10.4) backing end-to-end
//! reconcile tests without shelling out to `iptables`/`ipset`. Mirrors real
//! `iptables-restore --noflush` semantics closely enough for assertions: a
//! chain named in a restore payload has its rule list replaced wholesale;
//! chains absent from the payload keep whatever they had.

use super::{Entry, IpSet, IpTables, IpTablesBatch, KernelError, KernelResult, SetDesc, SetType};
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;

#[derive(Default)]
struct TableState {
    chains: HashMap<String, Vec<String>>,
}

#[derive(Default)]
pub struct FakeKernel {
    tables: Mutex<HashMap<String, TableState>>,
    sets: Mutex<HashMap<String, (SetType, BTreeSet<Entry>)>>,
}

impl FakeKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// The rule list for one chain, in order, for test assertions.
    pub fn rules(&self, table: &str, chain: &str) -> Vec<String> {
        self.tables
            .lock()
            .get(table)
            .and_then(|t| t.chains.get(chain))
            .cloned()
            .unwrap_or_default()
    }

    pub fn chain_names(&self, table: &str) -> Vec<String> {
        self.tables
            .lock()
            .get(table)
            .map(|t| t.chains.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn set_members(&self, name: &str) -> Vec<Entry> {
        self.sets
            .lock()
            .get(name)
            .map(|(_, members)| members.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl IpTables for FakeKernel {
    async fn new_chain(&self, table: &str, chain: &str) -> KernelResult<()> {
        self.tables
            .lock()
            .entry(table.to_string())
            .or_default()
            .chains
            .entry(chain.to_string())
            .or_default();
        Ok(())
    }

    async fn prepend_unique(&self, table: &str, chain: &str, rule_spec: &str) -> KernelResult<()> {
        let mut tables = self.tables.lock();
        let rules = tables
            .entry(table.to_string())
            .or_default()
            .chains
            .entry(chain.to_string())
            .or_default();
        if !rules.iter().any(|r| r == rule_spec) {
            rules.insert(0, rule_spec.to_string());
        }
        Ok(())
    }

    async fn delete(&self, table: &str, chain: &str, rule_spec: &str) -> KernelResult<()> {
        let mut tables = self.tables.lock();
        if let Some(rules) = tables.get_mut(table).and_then(|t| t.chains.get_mut(chain)) {
            if let Some(pos) = rules.iter().position(|r| r == rule_spec) {
                rules.remove(pos);
            }
        }
        Ok(())
    }

    async fn list(&self, table: &str, chain: &str) -> KernelResult<Vec<String>> {
        Ok(self.rules(table, chain))
    }

    async fn list_chains(&self, table: &str) -> KernelResult<Vec<String>> {
        Ok(self.chain_names(table))
    }

    async fn clear_chain(&self, table: &str, chain: &str) -> KernelResult<()> {
        if let Some(rules) = self.tables.lock().get_mut(table).and_then(|t| t.chains.get_mut(chain)) {
            rules.clear();
        }
        Ok(())
    }

    async fn delete_chain(&self, table: &str, chain: &str) -> KernelResult<()> {
        if let Some(t) = self.tables.lock().get_mut(table) {
            t.chains.remove(chain);
        }
        Ok(())
    }

    async fn exists(&self, table: &str, chain: &str, rule_spec: &str) -> KernelResult<bool> {
        Ok(self.rules(table, chain).iter().any(|r| r == rule_spec))
    }
}

#[async_trait]
impl IpTablesBatch for FakeKernel {
    async fn save_into(&self, table: &str) -> KernelResult<Vec<u8>> {
        let tables = self.tables.lock();
        let mut out = String::new();
        if let Some(t) = tables.get(table) {
            let mut names: Vec<&String> = t.chains.keys().collect();
            names.sort();
            for name in names {
                out.push_str(&format!(":{name} - [0:0]\n"));
            }
        }
        Ok(out.into_bytes())
    }

    async fn restore_all(&self, payload: &[u8], _noflush: bool, _counters: bool) -> KernelResult<()> {
        let text = String::from_utf8_lossy(payload);
        let table_name = text
            .lines()
            .find_map(|l| l.strip_prefix('*'))
            .unwrap_or("filter")
            .to_string();

        let mut tables = self.tables.lock();
        let table = tables.entry(table_name).or_default();

        for line in text.lines() {
            if let Some(rest) = line.strip_prefix(':') {
                if let Some(name) = rest.split_whitespace().next() {
                    table.chains.entry(name.to_string()).or_default().clear();
                }
            }
        }
        for line in text.lines() {
            if let Some(rest) = line.strip_prefix("-A ") {
                if let Some((chain, rule)) = rest.split_once(' ') {
                    table.chains.entry(chain.to_string()).or_default().push(rule.to_string());
                }
            } else if let Some(chain) = line.strip_prefix("-X ") {
                table.chains.remove(chain.trim());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl IpSet for FakeKernel {
    async fn create(&self, set: &SetDesc, ignore_exist: bool) -> KernelResult<()> {
        let mut sets = self.sets.lock();
        if sets.contains_key(&set.name) {
            if ignore_exist {
                return Ok(());
            }
            return Err(KernelError::NonZeroExit {
                status: 1,
                stderr: format!("set {} already exists", set.name),
            });
        }
        sets.insert(set.name.clone(), (set.set_type, BTreeSet::new()));
        Ok(())
    }

    async fn destroy(&self, set: &str) -> KernelResult<()> {
        self.sets.lock().remove(set);
        Ok(())
    }

    async fn list_names(&self) -> KernelResult<Vec<String>> {
        Ok(self.sets.lock().keys().cloned().collect())
    }

    async fn get(&self, name: &str) -> KernelResult<Option<SetDesc>> {
        Ok(self
            .sets
            .lock()
            .get(name)
            .map(|(set_type, _)| SetDesc { name: name.to_string(), set_type: *set_type }))
    }

    async fn add_entry(&self, set: &str, entry: &Entry, ignore_exist: bool) -> KernelResult<()> {
        let mut sets = self.sets.lock();
        let Some((_, members)) = sets.get_mut(set) else {
            return Err(KernelError::NonZeroExit {
                status: 1,
                stderr: format!("set {set} does not exist"),
            });
        };
        if !members.insert(entry.clone()) && !ignore_exist {
            return Err(KernelError::NonZeroExit {
                status: 1,
                stderr: format!("entry already a member of {set}"),
            });
        }
        Ok(())
    }

    async fn del_entry(&self, set: &str, entry: &Entry, ignore_exist: bool) -> KernelResult<()> {
        let mut sets = self.sets.lock();
        let Some((_, members)) = sets.get_mut(set) else {
            if ignore_exist {
                return Ok(());
            }
            return Err(KernelError::NonZeroExit {
                status: 1,
                stderr: format!("set {set} does not exist"),
            });
        };
        if !members.remove(entry) && !ignore_exist {
            return Err(KernelError::NonZeroExit {
                status: 1,
                stderr: format!("entry not a member of {set}"),
            });
        }
        Ok(())
    }

    async fn list_entries(&self, set: &str) -> KernelResult<Vec<Entry>> {
        Ok(self
            .sets
            .lock()
            .get(set)
            .map(|(_, members)| members.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    #[tokio::test]
    async fn prepend_unique_is_idempotent() {
        let kernel = FakeKernel::new();
        kernel.prepend_unique("filter", "ENN-INPUT", "-j ACCEPT").await.unwrap();
        kernel.prepend_unique("filter", "ENN-INPUT", "-j ACCEPT").await.unwrap();
        assert_eq!(kernel.rules("filter", "ENN-INPUT"), vec!["-j ACCEPT".to_string()]);
    }

    #[tokio::test]
    async fn restore_all_replaces_only_chains_it_mentions() {
        let kernel = FakeKernel::new();
        kernel.new_chain("filter", "ENN-UNRELATED").await.unwrap();
        kernel.prepend_unique("filter", "ENN-UNRELATED", "-j ACCEPT").await.unwrap();

        let payload = b"*filter\n:ENN-PLY-IN-abc - [0:0]\n-A ENN-PLY-IN-abc -j ACCEPT\nCOMMIT\n";
        kernel.restore_all(payload, true, true).await.unwrap();

        assert_eq!(kernel.rules("filter", "ENN-PLY-IN-abc"), vec!["-j ACCEPT".to_string()]);
        assert_eq!(kernel.rules("filter", "ENN-UNRELATED"), vec!["-j ACCEPT".to_string()]);
    }

    #[tokio::test]
    async fn ipset_add_and_remove() {
        let kernel = FakeKernel::new();
        let set = SetDesc { name: "ENN-PODSET-x".to_string(), set_type: SetType::HashIp };
        kernel.create(&set, false).await.unwrap();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        kernel.add_entry(&set.name, &Entry::Ip(ip), false).await.unwrap();
        assert_eq!(kernel.list_entries(&set.name).await.unwrap(), vec![Entry::Ip(ip)]);
        kernel.del_entry(&set.name, &Entry::Ip(ip), false).await.unwrap();
        assert!(kernel.list_entries(&set.name).await.unwrap().is_empty());
    }
}
