use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "havoc",
    about = "Chaos-engineering orchestrator for container-based devnets",
    version
)]
pub struct Cli {
    /// Metrics service base URL. Auto-discovered from the enclave when
    /// omitted.
    #[arg(long, env = "HAVOC_METRICS_URL", global = true)]
    pub metrics_url: Option<String>,

    /// EVM JSON-RPC endpoint for rpc criteria.
    #[arg(long, env = "HAVOC_RPC_URL", global = true)]
    pub rpc_url: Option<String>,

    /// Sidecar image carrying the traffic-shaping tools.
    #[arg(
        long,
        env = "HAVOC_SIDECAR_IMAGE",
        default_value = "havoc/netshaper:latest",
        global = true
    )]
    pub sidecar_image: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one scenario file end to end.
    Run {
        /// Path to the scenario YAML.
        scenario: PathBuf,

        /// Override the enclave targets resolve in.
        #[arg(long)]
        enclave: Option<String>,

        /// Scenario overrides, e.g. --set duration=30s --set warmup=0s.
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,

        /// Report output format.
        #[arg(long, default_value = "text")]
        output: OutputFormat,

        /// Validate and wire only; touch no container.
        #[arg(long)]
        dry_run: bool,

        /// Directory for report JSON files.
        #[arg(long, default_value = "reports")]
        report_dir: PathBuf,
    },

    /// Run randomized fault rounds against an enclave.
    Fuzz {
        /// Enclave to fuzz.
        #[arg(long)]
        enclave: String,

        /// Number of rounds.
        #[arg(long, default_value_t = 10)]
        rounds: usize,

        /// Every round is a compound fault.
        #[arg(long, conflicts_with = "single_only")]
        compound_only: bool,

        /// Every round is a single fault.
        #[arg(long, conflicts_with = "compound_only")]
        single_only: bool,

        /// Max faults per compound round.
        #[arg(long, default_value_t = 2)]
        max_faults: usize,

        /// Gate injection on a condition: any, checkpoint, post_restart,
        /// high_load.
        #[arg(long, default_value = "any")]
        trigger: String,

        /// RNG seed; 0 picks one automatically (logged for reproduction).
        #[arg(long, default_value_t = 0)]
        seed: u64,

        /// Sample and log rounds without touching containers.
        #[arg(long)]
        dry_run: bool,

        /// Append-only JSONL round log.
        #[arg(long, default_value = "havoc-fuzz.jsonl")]
        log: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}
