use anyhow::Result;
use clap::Parser;
use portal_tunnel::{
    config::{Cli, Command},
    run_service, RelayClient,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Expose(args) => expose(args).await,
    }
}

async fn expose(args: portal_tunnel::config::ExposeArgs) -> Result<()> {
    let (relay, services) = args.resolve()?;
    let client = RelayClient::new(&relay)?;
    let shutdown = CancellationToken::new();

    let mut tasks = Vec::new();
    for svc in services {
        tasks.push(tokio::spawn(run_service(
            client.clone(),
            svc,
            shutdown.clone(),
        )));
    }

    tokio::signal::ctrl_c().await?;
    debug!("shutting down");
    shutdown.cancel();
    for task in tasks {
        if let Err(err) = task.await {
            debug!(?err, "service task");
        }
    }
    Ok(())
}
