mod cli;
mod control;

use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = cli::parse_args()?;

    control::run(control::AgentConfig {
        server_url: args.server_url,
        identity: args.identity,
        agent_token: args.agent_token,
        tls_cert_path: args.tls_cert_path,
        local_target: args.local_target,
    })
    .await;

    Ok(())
}
