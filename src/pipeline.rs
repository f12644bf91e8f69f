//! End-to-end run: fetch → extract → process → load.
//!
//! Each stage is the same code path as its standalone command and prints
//! its own summary. A stage that returns an error stops the run; per-item
//! failures inside a stage do not.

use anyhow::{Context, Result};
use tracing::info;

use crate::archive::run_extract;
use crate::batch::{run_process, ProcessArgs};
use crate::config::Config;
use crate::fetch::run_fetch;
use crate::load::run_load;

#[derive(Debug, Default, Clone)]
pub struct RunArgs {
    pub limit: Option<usize>,
    pub process: ProcessArgs,
}

/// `medcorpus run`
pub async fn run_pipeline(config: &Config, args: &RunArgs) -> Result<()> {
    info!("stage 1/4: fetch");
    run_fetch(config, args.limit).await.context("fetch stage failed")?;

    info!("stage 2/4: extract");
    let extract_config = config.clone();
    tokio::task::spawn_blocking(move || run_extract(&extract_config))
        .await?
        .context("extract stage failed")?;

    info!("stage 3/4: process");
    run_process(config, &args.process)
        .await
        .context("process stage failed")?;

    info!("stage 4/4: load");
    run_load(config).await.context("load stage failed")?;

    Ok(())
}
