mod cli;
mod commands;
mod output;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let exit_code = match cli.command {
        Command::Run {
            scenario,
            enclave,
            set,
            output,
            dry_run,
            report_dir,
        } => {
            commands::run(
                scenario,
                enclave,
                set,
                output,
                dry_run,
                report_dir,
                cli.metrics_url,
                cli.rpc_url,
                cli.sidecar_image,
            )
            .await?
        }
        Command::Fuzz {
            enclave,
            rounds,
            compound_only,
            single_only,
            max_faults,
            trigger,
            seed,
            dry_run,
            log,
        } => {
            commands::fuzz(
                enclave,
                rounds,
                compound_only,
                single_only,
                max_faults,
                trigger,
                seed,
                dry_run,
                log,
                cli.metrics_url,
                cli.rpc_url,
                cli.sidecar_image,
            )
            .await?
        }
    };

    std::process::exit(exit_code);
}
