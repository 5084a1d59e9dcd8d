//! Run Command
//!
//! Drives one full build: read the snapshot manifest, create the build
//! remotely, discover and upload every snapshot, then finalize.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use serde::Deserialize;
use tracing::{debug, warn};

use argus_client::ApiClient;
use argus_common::{Config, SnapshotRequest};
use argus_core::{BuildOutcome, BuildRunner};

use crate::output;

#[derive(Args)]
pub struct RunArgs {
    /// Snapshot manifest listing the pages to capture
    #[arg(default_value = "snapshots.toml")]
    pub snapshots: PathBuf,

    /// Override the branch reported to the build service
    #[arg(long)]
    pub branch: Option<String>,

    /// Override the commit sha reported to the build service
    #[arg(long)]
    pub commit_sha: Option<String>,

    /// Run as one shard of a parallel build
    #[arg(long)]
    pub parallel_nonce: Option<String>,

    /// Total shard count of the parallel build
    #[arg(long, requires = "parallel_nonce")]
    pub parallel_total: Option<i64>,
}

/// On-disk snapshot manifest: the list of pages to capture.
#[derive(Deserialize)]
struct SnapshotFile {
    #[serde(default)]
    snapshots: Vec<SnapshotRequest>,
}

pub async fn execute(args: RunArgs, config_path: &Path) -> Result<BuildOutcome> {
    let mut config = Config::load(config_path)
        .with_context(|| format!("cannot load config {}", config_path.display()))?;
    apply_overrides(&mut config, &args);

    let requests = read_snapshots(&args.snapshots)?;
    if requests.is_empty() {
        anyhow::bail!("no snapshots listed in {}", args.snapshots.display());
    }
    debug!(count = requests.len(), "Loaded snapshot manifest");

    let api = Arc::new(ApiClient::new(&config.api)?);
    let runner = BuildRunner::launch(config, api).await?;
    runner.start().await?;

    for request in requests {
        let name = request.name.clone();
        if let Err(err) = runner.snapshot(request) {
            warn!(name = %name, error = %err, "Snapshot not accepted");
        }
    }

    // First Ctrl-C aborts outstanding work; whatever already uploaded is
    // still finalized as a partial build.
    let summary = tokio::select! {
        finished = runner.stop() => finished?,
        _ = tokio::signal::ctrl_c() => runner.abort().await?,
    };

    output::print_summary(&summary);
    Ok(summary.outcome())
}

fn apply_overrides(config: &mut Config, args: &RunArgs) {
    if let Some(branch) = &args.branch {
        config.build.branch = Some(branch.clone());
    }
    if let Some(sha) = &args.commit_sha {
        config.build.commit_sha = Some(sha.clone());
    }
    if let Some(nonce) = &args.parallel_nonce {
        config.build.parallel_nonce = Some(nonce.clone());
    }
    if let Some(total) = args.parallel_total {
        config.build.parallel_total = Some(total);
    }
}

fn read_snapshots(path: &Path) -> Result<Vec<SnapshotRequest>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read snapshot manifest {}", path.display()))?;
    let file: SnapshotFile = toml::from_str(&content)
        .with_context(|| format!("invalid snapshot manifest {}", path.display()))?;
    Ok(file.snapshots)
}
