use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = abkernel_cli::Cli::parse();
    abkernel_cli::run_cli(cli)
}
