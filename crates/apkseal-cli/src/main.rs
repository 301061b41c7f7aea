//! apkseal command-line entry point.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use apkseal_cli::cmd;
use apkseal_cli::{Cli, Commands, LineageCommands};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Sign {
            input,
            output,
            key,
            target,
            lineage,
            rotation_min_sdk,
            no_v2,
            no_v3,
            no_v31,
            v4,
            preserve_foreign,
            min_sdk,
        } => cmd::sign::sign(&cmd::sign::SignArgs {
            input,
            output,
            keys: key,
            targets: target,
            lineage,
            rotation_min_sdk,
            no_v2,
            no_v3,
            no_v31,
            v4,
            preserve_foreign,
            min_sdk,
        }),
        Commands::Verify {
            input,
            json,
            min_sdk,
            max_sdk,
        } => cmd::verify::verify(&input, json, min_sdk, max_sdk),
        Commands::Lineage { command } => match command {
            LineageCommands::Create { key, output } => cmd::lineage::create(&key, &output),
            LineageCommands::Rotate {
                lineage,
                old_key,
                new_key,
                caps,
                output,
            } => cmd::lineage::rotate(&lineage, &old_key, &new_key, caps, &output),
            LineageCommands::Inspect { lineage, json } => cmd::lineage::inspect(&lineage, json),
        },
        Commands::Keygen { algorithm, output } => cmd::keygen::keygen(algorithm, &output),
    }
}
