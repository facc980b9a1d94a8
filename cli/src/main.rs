use clap::Parser;
use neo_cli::Cli;
use neo_cli::run_main;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    run_main(Cli::parse()).await
}
