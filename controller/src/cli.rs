//! Command-line surface (spec §6.1), matching the teacher's `cli.rs` shape:
//! one `clap::Parser` struct, `FromStr` newtypes for the fields that need
//! domain-specific parsing, and a `LogFormat` enum for `--log-format`.

use clap::Parser;
use netpold_k8s_api::K8sDuration;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "netpold", about = "Per-node network-policy enforcement controller")]
pub struct Args {
    /// Path to a kubeconfig file. Falls back to in-cluster config when unset.
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<String>,

    /// Overrides the API server URL from the kubeconfig/in-cluster config.
    #[arg(long)]
    pub master: Option<String>,

    /// Identifies this node. Falls back to the OS hostname, lowercased and
    /// trimmed, when unset.
    #[arg(long)]
    pub hostname_override: Option<String>,

    /// Restricts policy enforcement to this CIDR. When unset, the controller
    /// looks up its own `Node.spec.podCIDR` (spec §10.5) before falling back
    /// to `0.0.0.0/0`.
    #[arg(long)]
    pub ip_range: Option<ipnet::IpNet>,

    /// Emit a pre-policy ACCEPT for node-internal (flannel/docker) IPs.
    #[arg(long, default_value_t = false)]
    pub accept_flannel_ip: bool,

    /// Overlay network CIDR. Required when `--accept-flannel-ip` is set.
    #[arg(long)]
    pub flannel_network: Option<ipnet::IpNet>,

    /// Bits used to enumerate per-node subnets within `--flannel-network`.
    #[arg(long, default_value_t = 8)]
    pub flannel_len_bit: u8,

    /// Informer resync interval.
    #[arg(long, default_value = "15m")]
    pub config_sync_period: K8sDuration,

    /// Periodic full reconcile interval.
    #[arg(long, default_value = "5m")]
    pub sync_period: K8sDuration,

    /// Minimum interval between reconciles (rate limiter). `0` disables
    /// rate limiting.
    #[arg(long, default_value = "2s")]
    pub min_sync_period: K8sDuration,

    /// Delete every chain/set whose name begins with `ENN`, then exit.
    #[arg(long, default_value_t = false)]
    pub cleanup_config: bool,

    /// Print version (and git SHA, when available) and exit.
    #[arg(long, default_value_t = false)]
    pub version: bool,

    /// `tracing_subscriber::EnvFilter` directive.
    #[arg(long, env = "ENN_POLICY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Structured-JSON or human-readable log output.
    #[arg(long, value_enum, env = "ENN_POLICY_LOG_FORMAT", default_value = "plain")]
    pub log_format: LogFormat,

    /// Bind address for the `/ready`, `/live` admin endpoints.
    #[arg(long, env = "ENN_POLICY_ADMIN_LISTEN_ADDR", default_value = "0.0.0.0:9990")]
    pub admin_listen_addr: SocketAddr,
}

impl Args {
    pub fn config_sync_period(&self) -> Duration {
        self.config_sync_period.into()
    }

    pub fn sync_period(&self) -> Duration {
        self.sync_period.into()
    }

    pub fn min_sync_period(&self) -> Duration {
        self.min_sync_period.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_args() {
        let args = Args::parse_from(["netpold"]);
        assert!(!args.accept_flannel_ip);
        assert_eq!(args.flannel_len_bit, 8);
        assert_eq!(args.log_format, LogFormat::Plain);
    }

    #[test]
    fn parses_durations_and_ip_range() {
        let args = Args::parse_from([
            "netpold",
            "--ip-range",
            "10.244.0.0/16",
            "--sync-period",
            "30s",
            "--min-sync-period",
            "0s",
        ]);
        assert_eq!(args.ip_range, Some("10.244.0.0/16".parse().unwrap()));
        assert_eq!(args.sync_period(), Duration::from_secs(30));
        assert_eq!(args.min_sync_period(), Duration::from_secs(0));
    }
}
