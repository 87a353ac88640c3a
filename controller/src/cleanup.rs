//! `--cleanup-config` (spec §6.1/§6.2/§8.2 scenario 6): delete every chain
//! and set whose name begins with `ENN`, leaving everything else in the
//! kernel untouched.

use netpold_core::kernel::Kernel;
use netpold_core::naming;

const FILTER_TABLE: &str = "filter";

pub async fn run(kernel: &impl Kernel) -> anyhow::Result<()> {
    cleanup_chains(kernel).await?;
    cleanup_sets(kernel).await?;
    Ok(())
}

async fn cleanup_chains(kernel: &impl Kernel) -> anyhow::Result<()> {
    let chains = kernel.list_chains(FILTER_TABLE).await?;
    let reserved: Vec<&String> = chains.iter().filter(|name| naming::is_reserved(name)).collect();

    // Root chains are jumped to from INPUT/OUTPUT/FORWARD; drop those rules
    // before flushing so `-X` never fails on a chain still in use.
    for chain in &reserved {
        if let Err(error) = kernel
            .delete(FILTER_TABLE, "INPUT", &format!("-j {chain}"))
            .await
        {
            tracing::debug!(%error, chain, "no INPUT jump rule to remove");
        }
        if let Err(error) = kernel
            .delete(FILTER_TABLE, "OUTPUT", &format!("-j {chain}"))
            .await
        {
            tracing::debug!(%error, chain, "no OUTPUT jump rule to remove");
        }
        if let Err(error) = kernel
            .delete(FILTER_TABLE, "FORWARD", &format!("-j {chain}"))
            .await
        {
            tracing::debug!(%error, chain, "no FORWARD jump rule to remove");
        }
    }

    for chain in &reserved {
        kernel.clear_chain(FILTER_TABLE, chain).await?;
    }
    for chain in &reserved {
        kernel.delete_chain(FILTER_TABLE, chain).await?;
    }
    tracing::info!(count = reserved.len(), "removed reserved chains");
    Ok(())
}

async fn cleanup_sets(kernel: &impl Kernel) -> anyhow::Result<()> {
    let names = kernel.list_names().await?;
    let reserved: Vec<&String> = names.iter().filter(|name| naming::is_reserved(name)).collect();
    for set in &reserved {
        kernel.destroy(set).await?;
    }
    tracing::info!(count = reserved.len(), "removed reserved sets");
    Ok(())
}
