#![forbid(unsafe_code)]

//! Lists files under the downloads root that no ringtone references, and
//! optionally deletes them. Meant to run from cron or a systemd timer.

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use ringping::{
    config::{RuntimeOverrides, resolve_runtime_config},
    init_tracing,
    security::ensure_not_root,
    store::RingtoneStore,
    sweep::{find_orphans, remove_orphans},
};

#[derive(Debug, Parser)]
#[command(name = "sweep_orphans", about = "Report or delete unreferenced ringtone files")]
struct SweepArgs {
    /// Directory holding ringping.db (RINGPING_DATA_ROOT).
    #[arg(long)]
    data_root: Option<PathBuf>,

    /// Public downloads root (RINGPING_DOWNLOADS_ROOT).
    #[arg(long)]
    downloads_root: Option<PathBuf>,

    /// Alternative `.env` file.
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Delete the orphans instead of only listing them.
    #[arg(long)]
    delete: bool,

    /// Leave files younger than this alone. Defaults to twice the tool
    /// timeout, which covers any build still in flight.
    #[arg(long)]
    min_age_secs: Option<u64>,
}

impl SweepArgs {
    fn min_age(&self, tool_timeout: Duration) -> Duration {
        self.min_age_secs
            .map(Duration::from_secs)
            .unwrap_or(tool_timeout * 2)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = SweepArgs::parse();
    init_tracing();
    ensure_not_root("sweep_orphans")?;

    let config = resolve_runtime_config(RuntimeOverrides {
        data_root: args.data_root.clone(),
        downloads_root: args.downloads_root.clone(),
        env_path: args.env_file.clone(),
        ..RuntimeOverrides::default()
    })?;
    let store = RingtoneStore::open(&config.database_path())
        .await
        .context("opening ringtone database")?;

    println!("Downloads root: {}", config.downloads_root.display());
    let min_age = args.min_age(config.tool_timeout);
    let mut report = find_orphans(&store, &config.downloads_root, min_age).await?;
    println!(
        "Scanned {} file(s), {} orphaned, {} younger than {}s skipped.",
        report.scanned,
        report.orphans.len(),
        report.recent,
        min_age.as_secs()
    );
    for orphan in &report.orphans {
        let kind = if orphan.partial { "partial" } else { "unreferenced" };
        println!("  - {} ({kind})", orphan.path.display());
    }

    if args.delete && !report.orphans.is_empty() {
        remove_orphans(&mut report).await;
        println!("Removed {} file(s).", report.removed);
    }
    Ok(())
}
