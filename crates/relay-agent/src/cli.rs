use anyhow::Context;

pub(crate) struct Args {
    pub server_url: String,
    pub identity: String,
    pub agent_token: Option<String>,
    pub tls_cert_path: Option<String>,
    pub local_target: String,
}

pub(crate) fn parse_args() -> anyhow::Result<Args> {
    let mut server_url = String::new();
    let mut identity = None;
    let mut agent_token = None;
    let mut tls_cert_path = None;
    let mut local_target = "127.0.0.1:22".to_string();

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-V" | "--version" => {
                println!("relay-agent {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                println!("relay-agent - dials the relay control channel");
                println!();
                println!("USAGE:");
                println!("    relay-agent [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    --server-url <URL>        Relay control channel WebSocket URL");
                println!("    --identity <IDENTITY>     AgentIdentity to register (required)");
                println!(
                    "    --agent-token <TOKEN>     Bearer token (prefer RELAY_AGENT_TOKEN env)"
                );
                println!("    --tls-cert <PATH>         TLS certificate to pin for the relay");
                println!(
                    "    --local-target <HOST:PORT> Local address each stream is bridged to [default: 127.0.0.1:22]"
                );
                println!("    -V, --version             Print version and exit");
                println!("    -h, --help                Print this help and exit");
                std::process::exit(0);
            }
            "--server-url" => {
                i += 1;
                server_url = args.get(i).context("missing --server-url value")?.clone();
            }
            "--identity" => {
                i += 1;
                identity = Some(args.get(i).context("missing --identity value")?.clone());
            }
            "--agent-token" => {
                i += 1;
                agent_token = Some(args.get(i).context("missing --agent-token value")?.clone());
            }
            "--tls-cert" => {
                i += 1;
                tls_cert_path = Some(args.get(i).context("missing --tls-cert value")?.clone());
            }
            "--local-target" => {
                i += 1;
                local_target = args.get(i).context("missing --local-target value")?.clone();
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
        i += 1;
    }

    if agent_token.is_none() {
        agent_token = std::env::var("RELAY_AGENT_TOKEN").ok();
    }

    Ok(Args {
        server_url,
        identity: identity.context("--identity is required")?,
        agent_token,
        tls_cert_path,
        local_target,
    })
}
