mod cli;
mod engine;
mod manifest;
mod proxy;
mod record;
mod runner;
mod verify;

use anyhow::{bail, Result};

use manifest::ExperimentManifest;
use runner::ExperimentRunner;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    cli::init_logging(args.log_level, args.log_file.as_ref())?;

    if let Some(path) = &args.create {
        ExperimentManifest::create(path)?;
        println!("Created manifest at {}", path.display());
        return Ok(());
    }
    if let Some(path) = &args.experiment {
        let manifest = ExperimentManifest::load(path)?;
        let mut runner = ExperimentRunner::new(manifest)?;
        return runner.execute().await;
    }
    if let Some(path) = &args.verify {
        return verify::check_consistency(path);
    }
    // clap's required mode group makes this unreachable.
    bail!("no mode selected")
}
