use clap::Parser;
use devvisor_cli::{config::load as load_config, logging, runner, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    logging::init(logging::level_directive(&config.log.level, cli.verbose, cli.quiet));

    runner::run(config).await
}
