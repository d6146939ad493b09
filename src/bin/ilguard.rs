use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use ilguard::{settings, simulation, SimulationParams};
use ilguard_core::SignatureSchemeKind;
use ilguard_telemetry::init_logging;

#[derive(Parser)]
#[command(name = "ilguard")]
#[command(about = "ILGuard attestation coordinator", long_about = None)]
struct Cli {
    /// TOML settings file. Environment variables ILGUARD__<SECTION>__<KEY>
    /// override it.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration
    Config,

    /// Run one claim through consensus and settlement against a simulated ledger
    Simulate {
        #[arg(long, default_value_t = 3)]
        operators: usize,

        #[arg(long, default_value_t = 2)]
        threshold: usize,

        /// Payout in wei; zero simulates a rejected claim
        #[arg(long, default_value_t = 1_000_000_000)]
        payout: u128,

        #[arg(long, value_enum, default_value_t = Scheme::Ecdsa)]
        scheme: Scheme,

        /// Ledger submissions that fail before the ledger recovers
        #[arg(long, default_value_t = 0)]
        fail_submissions: u32,

        #[arg(long, default_value_t = 5_000)]
        timeout_ms: u64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Scheme {
    Ecdsa,
    Bls,
}

impl From<Scheme> for SignatureSchemeKind {
    fn from(scheme: Scheme) -> Self {
        match scheme {
            Scheme::Ecdsa => SignatureSchemeKind::Ecdsa,
            Scheme::Bls => SignatureSchemeKind::Bls,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = settings::load(cli.config.as_deref()).context("loading settings")?;
    init_logging(&config.log_level).context("installing log subscriber")?;

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Simulate {
            operators,
            threshold,
            payout,
            scheme,
            fail_submissions,
            timeout_ms,
        } => {
            info!(operators, threshold, "Starting simulated claim");
            let params = SimulationParams {
                operators,
                threshold,
                payout,
                scheme: scheme.into(),
                fail_submissions,
                session_timeout: Duration::from_millis(timeout_ms),
            };
            let report = simulation::run(&config, params)
                .await
                .context("simulated claim failed")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
