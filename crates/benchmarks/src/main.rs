//! Command-line harness executable for accelmul.

use accelmul_harness::cli::{run_cli, Cli};
use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = Cli::parse();
    run_cli(cli)
}
