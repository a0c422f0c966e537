use anyhow::Context;
use clap::Parser;
use log::info;

use spillway::conf::Config;
use spillway::core::{CliArgs, Target, setup_logging};
use spillway::harness::{run_bag, run_column};

fn main() -> anyhow::Result<()> {
    setup_logging();
    let args = CliArgs::parse();
    info!(args = args; "Spillway stress harness started.");

    let mut config = match &args.config {
        Some(path) => Config::from_file(path).with_context(|| format!("loading {path}"))?,
        None => Config::default(),
    };
    if let Some(records) = args.records {
        config.stress.records = records;
    }
    info!(
        "Spilling to {} with {} values per slab",
        config.spill.spill_dir.display(),
        config.spill.slab_capacity
    );

    if matches!(args.target, Target::Column | Target::All) {
        run_column(&config).context("column stress run")?;
    }
    if matches!(args.target, Target::Bag | Target::All) {
        run_bag(&config).context("bag stress run")?;
    }
    Ok(())
}
