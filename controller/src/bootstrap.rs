//! Node/pod-CIDR discovery (spec §10.5). Out of the reconciler's scope; a
//! small helper the binary runs once at startup when `--ip-range` wasn't
//! given on the command line.

use anyhow::Context;
use ipnet::IpNet;
use netpold_k8s_api::{Api, Client, Node};

/// Resolves the CIDR to restrict policy enforcement to: the CLI flag if
/// given, otherwise this node's `.spec.podCIDR`, otherwise `0.0.0.0/0`.
pub async fn resolve_ip_range(client: &Client, node_name: &str, cli_ip_range: Option<IpNet>) -> anyhow::Result<IpNet> {
    if let Some(range) = cli_ip_range {
        return Ok(range);
    }

    let nodes: Api<Node> = Api::all(client.clone());
    let node = match nodes.get(node_name).await {
        Ok(node) => node,
        Err(error) => {
            tracing::warn!(%error, node_name, "failed to look up own Node; falling back to 0.0.0.0/0");
            return Ok("0.0.0.0/0".parse().expect("valid CIDR"));
        }
    };

    let pod_cidr = node.spec.as_ref().and_then(|spec| spec.pod_cidr.as_deref());
    match pod_cidr {
        Some(cidr) => cidr.parse().with_context(|| format!("node {node_name} has an unparseable podCIDR {cidr:?}")),
        None => {
            tracing::warn!(node_name, "node has no podCIDR; falling back to 0.0.0.0/0");
            Ok("0.0.0.0/0".parse().expect("valid CIDR"))
        }
    }
}

/// Resolves `--hostname-override`, falling back to the OS hostname
/// lowercased and trimmed, matching kubelet's own node-naming convention.
pub fn resolve_hostname(override_name: Option<&str>) -> anyhow::Result<String> {
    if let Some(name) = override_name {
        return Ok(name.to_string());
    }
    let hostname = hostname::get().context("failed to read OS hostname")?;
    let hostname = hostname.to_string_lossy().trim().to_lowercase();
    if hostname.is_empty() {
        anyhow::bail!("OS hostname is empty; pass --hostname-override");
    }
    Ok(hostname)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_override_wins() {
        assert_eq!(resolve_hostname(Some("Node-A ")).unwrap(), "Node-A ");
    }
}
