#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use retun_client::config::{Cli, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config, cli.strict)?;
    simple_logger::init_with_level(config.log.level.as_level())?;

    if config.auth.token.is_empty() {
        log::warn!("auth.token is empty, login proofs will be trivially forgeable");
    }

    retun_client::startup(config).await
}
