//! The rodeos cluster harness CLI.

mod cmd;

use anyhow::Result;
use structopt::StructOpt;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Stand up producer, state-history and rodeos clusters and verify replicas converge.
#[derive(StructOpt)]
#[structopt(name = "rodeos-harness")]
pub struct RodeosHarness {
    #[structopt(subcommand)]
    action: RodeosHarnessSubcommands,
    /// Enable debug logging.
    #[structopt(short)]
    verbose: bool,
}

impl RodeosHarness {
    pub async fn run(self) -> Result<()> {
        // Initialize logging based on CLI config, `RUST_LOG` takes precedence.
        let fmt_layer = fmt::layer().with_target(true);
        let (default_filter, level_filter) = if self.verbose {
            ("debug", LevelFilter::DEBUG)
        } else {
            ("info", LevelFilter::INFO)
        };
        let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .with(level_filter)
            .init();

        match &self.action {
            RodeosHarnessSubcommands::Run(inner) => inner.run().await,
            RodeosHarnessSubcommands::Up(inner) => inner.run().await,
        }
    }
}

#[derive(StructOpt)]
enum RodeosHarnessSubcommands {
    /// Run a scenario against a fresh cluster.
    #[structopt(name = "run")]
    Run(cmd::run::Run),
    /// Stand a cluster up and hold it until ctrl-c.
    #[structopt(name = "up")]
    Up(cmd::up::Up),
}
