//! Finalize Command
//!
//! Closes out a parallel build once every shard has run. Joins the
//! build under its parallel nonce, then asks the service to finalize
//! all shards together.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;
use tracing::{debug, info};

use argus_client::ApiClient;
use argus_common::{BuildInfo, Config};
use argus_core::RemoteApi;

use crate::output;

#[derive(Args)]
pub struct FinalizeArgs {
    /// Parallel nonce identifying the build; defaults to the config value
    #[arg(long)]
    pub parallel_nonce: Option<String>,
}

pub async fn execute(args: FinalizeArgs, config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("cannot load config {}", config_path.display()))?;
    config.validate()?;

    let nonce = args
        .parallel_nonce
        .or_else(|| config.build.parallel_nonce.clone())
        .context("a parallel nonce is required, pass --parallel-nonce or set [build] parallel_nonce")?;

    let api = ApiClient::new(&config.api)?;

    // A shard total of -1 joins the build without contributing snapshots.
    let info = BuildInfo {
        parallel_nonce: Some(nonce.clone()),
        parallel_total: Some(-1),
        ..config.build.clone()
    };

    let build = api.create_build(&info).await?;
    debug!(build_id = %build.id, nonce = %nonce, "Joined parallel build");

    api.finalize_build(&build.id, true).await?;

    let status = api.get_build_status(&build.id).await?;
    info!(
        build_id = %build.id,
        state = %status.state,
        snapshots = status.total_snapshots,
        "Parallel build finalized"
    );

    output::print_success(&format!(
        "Finalized parallel build {} ({} snapshots)",
        build.id, status.total_snapshots
    ));
    if let Some(url) = &build.web_url {
        println!("Build results: {}", url);
    }

    Ok(())
}
