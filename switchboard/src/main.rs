use args::Args;
use clap::Parser;

mod args;
mod logger;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    logger::init(&args.log_filter);

    let config = load_config(&args)?;
    config.validate()?;

    let app = llm::router(&config)?;

    let listen_address = args
        .listen_address
        .unwrap_or_else(|| config.server.listen_address_or_default());

    let listener = tokio::net::TcpListener::bind(listen_address).await?;

    // Port 0 asks the kernel; report what was actually bound so clients
    // know where to point their ANTHROPIC_BASE_URL.
    let bound = listener.local_addr()?;
    log::info!("switchboard listening on http://{bound}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<config::Config> {
    match &args.config {
        Some(path) => config::Config::load(path),
        None => {
            log::warn!("no --config given; starting with defaults (passthrough only)");
            Ok(config::Config::default())
        }
    }
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        log::error!("failed to listen for the shutdown signal");
    }
}
