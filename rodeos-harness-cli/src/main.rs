use anyhow::Result;
use structopt::StructOpt;

use rodeos_harness_cli::RodeosHarness;

#[tokio::main]
async fn main() -> Result<()> {
    RodeosHarness::from_args().run().await
}
