use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::error;
use tracing_subscriber::EnvFilter;

use replikv::server::{self, Config};
use replikv::DEFAULT_PORT;

#[derive(Parser, Debug)]
#[command(name = "replikv-server", about = "In-memory key-value server")]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Run as a replica of the given primary, e.g. "localhost 6379".
    #[arg(long)]
    replicaof: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    // failing to bind is the one fatal error; everything later degrades
    let listener = match TcpListener::bind(("127.0.0.1", args.port)).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(port = args.port, %err, "failed to bind listening socket");
            std::process::exit(1);
        }
    };

    let config = Config {
        port: args.port,
        replicaof: args.replicaof,
    };

    server::run(listener, config, signal::ctrl_c()).await;
}
