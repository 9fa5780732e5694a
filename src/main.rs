use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use tangor::{ChatMessage, Client, Config, Digest, Keypair, NodeId, PortRange};

#[derive(Parser, Debug)]
#[command(name = "tangor")]
#[command(author, version, about = "Decentralized messaging node", long_about = None)]
struct Args {
    /// Local UDP port range to bind, e.g. "9200-9300"
    #[arg(short, long, default_value = "9200-9300")]
    ports: PortRange,

    /// Bootstrap sweep targets, e.g. "192.0.2.10:9200-9300" (repeatable)
    #[arg(short, long = "bootstrap", value_name = "HOST:PORTS")]
    bootstrap: Vec<tangor::BootstrapEntry>,

    /// Group to join and chat in (base58 digest); stdin lines are broadcast
    #[arg(short, long)]
    group: Option<String>,

    /// Nickname published in the profile
    #[arg(short, long, default_value = "anonymous")]
    nickname: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = Config {
        ports: args.ports,
        bootstrap: args.bootstrap,
    };

    let keypair = Keypair::generate();
    let client = Arc::new(Client::bind(&keypair, config).await?);
    info!(id = %client.id(), "node up");

    client.set_profile(tangor::UserProfile {
        nickname: args.nickname,
        ..Default::default()
    });
    client.handle_messages(|src, msg| {
        println!("<{src}> {}", msg.body);
    });

    let group = match &args.group {
        Some(encoded) => {
            let digest: Digest = encoded.parse()?;
            client.join(digest)?;
            info!(group = %digest, "joined group");
            Some(NodeId::group(digest))
        }
        None => None,
    };

    {
        let client = client.clone();
        tokio::spawn(async move {
            client.run().await;
        });
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                client.close().await;
                break;
            }
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                if line.is_empty() {
                    continue;
                }
                let Some(group) = group else {
                    warn!("no group joined, dropping input line");
                    continue;
                };
                if let Err(e) = client.send_message(group, ChatMessage { body: line }).await {
                    warn!(error = %e, "send failed");
                }
            }
        }
    }

    Ok(())
}
