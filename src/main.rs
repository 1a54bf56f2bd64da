use clap::Parser;
use mimalloc::MiMalloc;

use netbloat::config::Cli;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    simple_logger::init_with_level(cli.log_level().to_level().unwrap_or(log::Level::Warn))
        .expect("failed to initialize logger");

    if let Err(e) = netbloat::run(cli).await {
        log::error!("{e:#}");
        std::process::exit(1);
    }
}
