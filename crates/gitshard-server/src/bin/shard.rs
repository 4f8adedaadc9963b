//! gitshard-shard - serve in-memory repositories over both shard protocols.

use anyhow::Result;
use clap::Parser;
use gitshard_server::{serve, MemoryExecutor, MemoryRepo, ShardServer};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "gitshard-shard")]
#[command(about = "Shard endpoint serving binary RPC and legacy HTTP on one port")]
struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value = "3178")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Repository to host, repeatable
    #[arg(short, long = "repo")]
    repos: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let addr = format!("{}:{}", cli.host, cli.port);

    let mut executor = MemoryExecutor::new();
    for repo in &cli.repos {
        executor = executor.with_repo(
            repo.as_str(),
            MemoryRepo::new().with_commit("0000000000000000000000000000000000000001", "gitshard", "Initial commit"),
        );
    }
    println!("Serving {} repositories on {}", cli.repos.len(), addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    serve(listener, ShardServer::new(Arc::new(executor)), shutdown).await?;
    Ok(())
}
