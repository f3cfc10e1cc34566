#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use retun_server::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    simple_logger::init_with_level(config.log.level.as_level())?;

    if config.auth.token.is_empty() {
        log::warn!("auth.token is empty, any client can authenticate");
    }

    retun_server::startup(config).await
}
