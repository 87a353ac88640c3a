//! Shells out to the `iptables`, `iptables-save`/`iptables-restore`, and
//! `ipset` binaries to implement the core's kernel-adapter traits (spec
//! §6.4). This is the "thin wrapper" collaborator the design explicitly
//! scopes out of the core; it exists only to turn the abstract interfaces
//! into real syscalls.

use async_trait::async_trait;
use netpold_core::kernel::{Entry, IpSet, IpTables, IpTablesBatch, KernelError, KernelResult, SetDesc};
use std::net::IpAddr;
use std::process::Stdio;
use tokio::io::AsyncWriteExt as _;
use tokio::process::Command;

/// Runs `iptables`/`iptables-save`/`iptables-restore`/`ipset` as child
/// processes, optionally under a different binary name (`ip6tables` is
/// never used here; the name is configurable for tests that swap in a
/// recording shim).
pub struct ShellKernel {
    iptables_bin: String,
    iptables_save_bin: String,
    iptables_restore_bin: String,
    ipset_bin: String,
}

impl Default for ShellKernel {
    fn default() -> Self {
        Self {
            iptables_bin: "iptables".to_string(),
            iptables_save_bin: "iptables-save".to_string(),
            iptables_restore_bin: "iptables-restore".to_string(),
            ipset_bin: "ipset".to_string(),
        }
    }
}

async fn run(bin: &str, args: &[&str]) -> KernelResult<std::process::Output> {
    let output = Command::new(bin).args(args).output().await?;
    Ok(output)
}

fn ok_or_err(bin: &str, args: &[&str], output: std::process::Output) -> KernelResult<Vec<u8>> {
    if output.status.success() {
        Ok(output.stdout)
    } else {
        tracing::debug!(bin, args = ?args, "kernel command failed");
        Err(KernelError::NonZeroExit {
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[async_trait]
impl IpTables for ShellKernel {
    async fn new_chain(&self, table: &str, chain: &str) -> KernelResult<()> {
        // `-N` fails if the chain already exists; that's the common case
        // across reconciles, so a failure here is not logged as an error.
        let _ = run(&self.iptables_bin, &["-t", table, "-N", chain]).await?;
        Ok(())
    }

    async fn prepend_unique(&self, table: &str, chain: &str, rule_spec: &str) -> KernelResult<()> {
        if self.exists(table, chain, rule_spec).await? {
            return Ok(());
        }
        let mut args = vec!["-t", table, "-I", chain, "1"];
        args.extend(rule_spec.split_whitespace());
        let output = run(&self.iptables_bin, &args).await?;
        ok_or_err(&self.iptables_bin, &args, output).map(|_| ())
    }

    async fn delete(&self, table: &str, chain: &str, rule_spec: &str) -> KernelResult<()> {
        let mut args = vec!["-t", table, "-D", chain];
        args.extend(rule_spec.split_whitespace());
        let output = run(&self.iptables_bin, &args).await?;
        ok_or_err(&self.iptables_bin, &args, output).map(|_| ())
    }

    async fn list(&self, table: &str, chain: &str) -> KernelResult<Vec<String>> {
        let args = ["-t", table, "-S", chain];
        let output = run(&self.iptables_bin, &args).await?;
        let bytes = ok_or_err(&self.iptables_bin, &args, output)?;
        Ok(String::from_utf8_lossy(&bytes).lines().map(str::to_string).collect())
    }

    async fn list_chains(&self, table: &str) -> KernelResult<Vec<String>> {
        let args = ["-t", table, "-S"];
        let output = run(&self.iptables_bin, &args).await?;
        let bytes = ok_or_err(&self.iptables_bin, &args, output)?;
        Ok(String::from_utf8_lossy(&bytes)
            .lines()
            .filter_map(|line| line.strip_prefix("-N "))
            .map(str::to_string)
            .collect())
    }

    async fn clear_chain(&self, table: &str, chain: &str) -> KernelResult<()> {
        let args = ["-t", table, "-F", chain];
        let output = run(&self.iptables_bin, &args).await?;
        ok_or_err(&self.iptables_bin, &args, output).map(|_| ())
    }

    async fn delete_chain(&self, table: &str, chain: &str) -> KernelResult<()> {
        let args = ["-t", table, "-X", chain];
        let output = run(&self.iptables_bin, &args).await?;
        ok_or_err(&self.iptables_bin, &args, output).map(|_| ())
    }

    async fn exists(&self, table: &str, chain: &str, rule_spec: &str) -> KernelResult<bool> {
        let mut args = vec!["-t", table, "-C", chain];
        args.extend(rule_spec.split_whitespace());
        let output = run(&self.iptables_bin, &args).await?;
        Ok(output.status.success())
    }
}

#[async_trait]
impl IpTablesBatch for ShellKernel {
    async fn save_into(&self, table: &str) -> KernelResult<Vec<u8>> {
        let args = ["-t", table];
        let output = run(&self.iptables_save_bin, &args).await?;
        // iptables-save exits 0 even for an empty/nonexistent table; only a
        // genuine spawn failure surfaces here.
        Ok(output.stdout)
    }

    async fn restore_all(&self, payload: &[u8], noflush: bool, counters: bool) -> KernelResult<()> {
        let mut args = vec!["--noflush".to_string()];
        if !noflush {
            args.clear();
        }
        if counters {
            args.push("--counters".to_string());
        }
        let mut child = Command::new(&self.iptables_restore_bin)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        {
            let mut stdin = child.stdin.take().expect("piped stdin");
            stdin.write_all(payload).await?;
        }
        let output = child.wait_with_output().await?;
        ok_or_err(&self.iptables_restore_bin, &[], output).map(|_| ())
    }
}

#[async_trait]
impl IpSet for ShellKernel {
    async fn create(&self, set: &SetDesc, ignore_exist: bool) -> KernelResult<()> {
        let mut args = vec!["create".to_string(), set.name.clone(), set.set_type.as_ipset_str().to_string()];
        if ignore_exist {
            args.push("-exist".to_string());
        }
        let output = run(&self.ipset_bin, &args.iter().map(String::as_str).collect::<Vec<_>>()).await?;
        if ignore_exist {
            Ok(())
        } else {
            ok_or_err(&self.ipset_bin, &[], output).map(|_| ())
        }
    }

    async fn destroy(&self, set: &str) -> KernelResult<()> {
        // A set referenced by a live iptables rule cannot be destroyed; the
        // compiler always removes the referencing rule in the same restore
        // that stops referencing a set, so by the time GC runs this should
        // succeed. A failure here is logged and retried on the next full
        // sync rather than treated as fatal (spec §7, transient kernel).
        let _ = run(&self.ipset_bin, &["destroy", set]).await?;
        Ok(())
    }

    async fn list_names(&self) -> KernelResult<Vec<String>> {
        let args = ["list", "-name"];
        let output = run(&self.ipset_bin, &args).await?;
        let bytes = ok_or_err(&self.ipset_bin, &args, output)?;
        Ok(String::from_utf8_lossy(&bytes)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn get(&self, name: &str) -> KernelResult<Option<SetDesc>> {
        let args = ["list", name, "-name", "-terse"];
        let output = run(&self.ipset_bin, &args).await?;
        if !output.status.success() {
            return Ok(None);
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let set_type = parse_header(&text, "Type:").and_then(|t| match t.as_str() {
            "hash:ip" => Some(netpold_core::kernel::SetType::HashIp),
            "hash:net" => Some(netpold_core::kernel::SetType::HashNet),
            "hash:ip,port" => Some(netpold_core::kernel::SetType::HashIpPort),
            "hash:net,port" => Some(netpold_core::kernel::SetType::HashNetPort),
            _ => None,
        });
        Ok(set_type.map(|set_type| SetDesc { name: name.to_string(), set_type }))
    }

    async fn add_entry(&self, set: &str, entry: &Entry, ignore_exist: bool) -> KernelResult<()> {
        let member = entry_str(entry);
        let mut args = vec!["add".to_string(), set.to_string(), member];
        if ignore_exist {
            args.push("-exist".to_string());
        }
        let output = run(&self.ipset_bin, &args.iter().map(String::as_str).collect::<Vec<_>>()).await?;
        if ignore_exist {
            Ok(())
        } else {
            ok_or_err(&self.ipset_bin, &[], output).map(|_| ())
        }
    }

    async fn del_entry(&self, set: &str, entry: &Entry, ignore_exist: bool) -> KernelResult<()> {
        let member = entry_str(entry);
        let args = ["del", set, &member];
        let output = run(&self.ipset_bin, &args).await?;
        if ignore_exist {
            Ok(())
        } else {
            ok_or_err(&self.ipset_bin, &args, output).map(|_| ())
        }
    }

    async fn list_entries(&self, set: &str) -> KernelResult<Vec<Entry>> {
        let args = ["list", set];
        let output = run(&self.ipset_bin, &args).await?;
        if !output.status.success() {
            return Ok(Vec::new());
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let in_members = text.lines().skip_while(|l| *l != "Members:").skip(1);
        Ok(in_members.filter_map(parse_entry).collect())
    }
}

fn parse_header(text: &str, key: &str) -> Option<String> {
    text.lines()
        .find_map(|line| line.strip_prefix(key).map(|rest| rest.trim().to_string()))
}

fn entry_str(entry: &Entry) -> String {
    match entry {
        Entry::Ip(ip) => ip.to_string(),
        Entry::Net(net) => net.to_string(),
        Entry::IpPort(ip, port) => format!("{ip},{port}"),
        Entry::NetPort(net, port) => format!("{net},{port}"),
    }
}

fn parse_entry(line: &str) -> Option<Entry> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if let Some((addr, port)) = line.split_once(',') {
        let port: u16 = port.parse().ok()?;
        if let Ok(ip) = addr.parse::<IpAddr>() {
            return Some(Entry::IpPort(ip, port));
        }
        if let Ok(net) = addr.parse::<ipnet::IpNet>() {
            return Some(Entry::NetPort(net, port));
        }
        return None;
    }
    if let Ok(ip) = line.parse::<IpAddr>() {
        return Some(Entry::Ip(ip));
    }
    line.parse::<ipnet::IpNet>().ok().map(Entry::Net)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_ip_member() {
        assert_eq!(parse_entry("10.0.0.1"), Some(Entry::Ip("10.0.0.1".parse().unwrap())));
    }

    #[test]
    fn parses_net_member() {
        assert_eq!(parse_entry("10.244.0.0/16"), Some(Entry::Net("10.244.0.0/16".parse().unwrap())));
    }

    #[test]
    fn skips_blank_lines() {
        assert_eq!(parse_entry(""), None);
        assert_eq!(parse_entry("   "), None);
    }
}
