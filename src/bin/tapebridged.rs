use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tapebridge::cli::BridgeOpts;
use tapebridge::engine::BridgeEngine;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let opts = BridgeOpts::parse();

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            stop.store(true, Ordering::Relaxed);
        })
        .context("failed to install signal handler")?;
    }

    let tx_counter = Arc::new(AtomicU64::new(1));
    let mut engine = BridgeEngine::new(opts.job(), opts.config(), stop, tx_counter);
    engine
        .run()
        .context("bridged mount session failed")?;
    Ok(())
}
