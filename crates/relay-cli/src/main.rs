mod login;
mod proxy;
mod token_store;
mod tls;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "relay", version, about = "relaytun user CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bridge stdin/stdout to a workspace agent through the relay, for
    /// use as an `ssh -o ProxyCommand`.
    Proxy {
        /// AgentIdentity to connect to, e.g. `alpha-ws1`.
        identity: String,
        #[arg(long)]
        server: String,
        #[arg(long)]
        tls_cert: Option<String>,
    },
    /// Authenticate against the identity provider and cache a token.
    Login {
        #[arg(long)]
        issuer: String,
        #[arg(long)]
        client_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Proxy { identity, server, tls_cert } => {
            proxy::run(&server, &identity, tls_cert.as_deref()).await
        }
        Command::Login { issuer, client_id } => login::run(&issuer, &client_id).await,
    }
}
