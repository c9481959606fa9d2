//! Pairlink CLI tool
//!
//! A command-line peer for pairing and session negotiation over a
//! pairlink relay server.

use clap::{Parser, Subcommand};
use pairlink::transport::memory::MemoryRelay;
use pairlink::transport::{Transport, TransportEvent, WebSocketTransport};
use pairlink::{
    AppMetadata, Client, ClientConfig, ClientEvent, JsonRpcResponse, MemoryKeyStore,
    MemoryKeyValueStore, PayloadRequestParams, Reason, SessionPermissions,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Pairlink: pair with a peer and negotiate a session
#[derive(Parser)]
#[command(name = "pairlink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Relay server URL
    #[arg(short, long, default_value = "ws://127.0.0.1:8765")]
    relay: String,

    /// Display name shown to the peer
    #[arg(short, long)]
    name: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Propose a pairing and print its URI, then wait for the session
    Propose {
        /// Chains the session may target
        #[arg(short, long, default_value = "eip155:1")]
        chains: Vec<String>,

        /// Methods the session may call
        #[arg(short, long, default_value = "eth_sign")]
        methods: Vec<String>,
    },

    /// Pair with a URI and approve the proposed session (controller side)
    Pair {
        /// Pairing URI (wc:...)
        uri: String,

        /// Accounts to approve the session with
        #[arg(short, long, default_value = "0xabc")]
        accounts: Vec<String>,

        /// Reject the session proposal instead of approving it
        #[arg(long)]
        reject: bool,
    },

    /// Run both peers in-process over an in-memory relay
    Demo,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pairlink=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Propose { chains, methods } => {
            let name = cli.name.unwrap_or_else(|| "pairlink-dapp".to_string());
            let (client, events) = connect(&cli.relay, &name, false).await;
            cmd_propose(client, events, SessionPermissions::new(chains, methods)).await
        }
        Commands::Pair {
            uri,
            accounts,
            reject,
        } => {
            let name = cli.name.unwrap_or_else(|| "pairlink-wallet".to_string());
            let (client, events) = connect(&cli.relay, &name, true).await;
            cmd_pair(client, events, &uri, accounts.into_iter().collect(), reject).await
        }
        Commands::Demo => cmd_demo().await,
    }
}

async fn connect(
    relay_url: &str,
    name: &str,
    is_controller: bool,
) -> (Arc<Client>, mpsc::UnboundedReceiver<ClientEvent>) {
    let (transport, transport_events) = WebSocketTransport::connect(relay_url)
        .await
        .unwrap_or_else(|e| {
            eprintln!("Error: could not reach relay at {}: {}", relay_url, e);
            std::process::exit(1);
        });
    build_client(Arc::new(transport), transport_events, name, is_controller)
}

fn build_client(
    transport: Arc<dyn Transport>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    name: &str,
    is_controller: bool,
) -> (Arc<Client>, mpsc::UnboundedReceiver<ClientEvent>) {
    Client::new(
        ClientConfig::new(AppMetadata::named(name), is_controller),
        transport,
        transport_events,
        Arc::new(MemoryKeyStore::new()),
        Arc::new(MemoryKeyValueStore::new()),
    )
}

async fn cmd_propose(
    client: Arc<Client>,
    mut events: mpsc::UnboundedReceiver<ClientEvent>,
    permissions: SessionPermissions,
) {
    let uri = match client.connect(permissions, None).await {
        Ok(Some(uri)) => uri,
        Ok(None) => fail("propose", "no pairing URI returned"),
        Err(e) => fail("propose", e),
    };

    println!("=== Pairlink Proposal ===");
    println!();
    println!("Share this URI with the peer:");
    println!("{}", uri);
    println!();

    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::PairingSettled(pairing) => {
                println!("Pairing settled on topic {}", pairing.topic);
            }
            ClientEvent::SessionSettled(session) => {
                println!("Session settled on topic {}", session.topic);
                println!("Accounts: {:?}", session.accounts);
                match client.ping(&session.topic).await {
                    Ok(()) => println!("Peer answered ping"),
                    Err(e) => println!("Ping failed: {}", e),
                }
            }
            ClientEvent::SessionRejected { reason, .. } => {
                println!("Session rejected ({}): {}", reason.code, reason.message);
                break;
            }
            ClientEvent::SessionDeleted { reason, .. } => {
                println!("Session deleted ({}): {}", reason.code, reason.message);
                break;
            }
            other => println!("Event: {:?}", other),
        }
    }
}

async fn cmd_pair(
    client: Arc<Client>,
    mut events: mpsc::UnboundedReceiver<ClientEvent>,
    uri: &str,
    accounts: BTreeSet<String>,
    reject: bool,
) {
    let pairing = client.pair(uri).await.unwrap_or_else(|e| {
        eprintln!("Error: pairing failed: {}", e);
        std::process::exit(1);
    });
    println!("Paired on topic {}", pairing.topic);

    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::SessionProposal(proposal) => {
                let from = proposal
                    .proposer
                    .metadata
                    .as_ref()
                    .and_then(|m| m.name.clone())
                    .unwrap_or_else(|| "unknown".to_string());
                println!("Session proposed by {}", from);
                if reject {
                    match client.reject(&proposal, Reason::not_approved()).await {
                        Ok(()) => println!("Proposal rejected"),
                        Err(e) => println!("Reject failed: {}", e),
                    }
                    break;
                }
                match client.approve(&proposal, accounts.clone()).await {
                    Ok(session) => println!("Session approved on topic {}", session.topic),
                    Err(e) => println!("Approve failed: {}", e),
                }
            }
            ClientEvent::SessionRequest(request) => {
                println!("Request {}: {}", request.request.method, request.request.params);
                let response = JsonRpcResponse::new(request.request.id, request.request.params);
                if let Err(e) = client.respond(&request.topic, response.into()).await {
                    println!("Respond failed: {}", e);
                }
            }
            ClientEvent::SessionDeleted { reason, .. } | ClientEvent::PairingDeleted { reason, .. } => {
                println!("Deleted by peer ({}): {}", reason.code, reason.message);
                break;
            }
            other => println!("Event: {:?}", other),
        }
    }
}

async fn cmd_demo() {
    println!("=== Pairlink Demo ===");
    println!();

    let hub = MemoryRelay::new();
    let (dapp_transport, dapp_transport_events) = hub.connect();
    let (wallet_transport, wallet_transport_events) = hub.connect();
    let (dapp, mut dapp_events) =
        build_client(Arc::new(dapp_transport), dapp_transport_events, "demo-dapp", false);
    let (wallet, mut wallet_events) =
        build_client(Arc::new(wallet_transport), wallet_transport_events, "demo-wallet", true);

    println!("1. Dapp proposes a pairing");
    let permissions = SessionPermissions::new(["eip155:1"], ["eth_sign"]);
    let uri = match dapp.connect(permissions, None).await {
        Ok(Some(uri)) => uri,
        Ok(None) => fail("connect", "no pairing URI returned"),
        Err(e) => fail("connect", e),
    };
    println!("   {}", uri);

    println!("2. Wallet pairs with the URI");
    let pairing = wallet.pair(&uri).await.unwrap_or_else(|e| fail("pair", e));
    println!("   pairing topic {}", pairing.topic);

    println!("3. Wallet approves the session proposal");
    let proposal = loop {
        match next(&mut wallet_events).await {
            ClientEvent::SessionProposal(proposal) => break proposal,
            _ => continue,
        }
    };
    let accounts = ["0xabc".to_string()].into_iter().collect();
    let session = wallet
        .approve(&proposal, accounts)
        .await
        .unwrap_or_else(|e| fail("approve", e));
    loop {
        if let ClientEvent::SessionSettled(_) = next(&mut dapp_events).await {
            break;
        }
    }
    println!("   session topic {}", session.topic);

    println!("4. Dapp calls eth_sign over the session");
    let call = tokio::spawn({
        let dapp = dapp.clone();
        let topic = session.topic.clone();
        async move {
            dapp.request(PayloadRequestParams {
                topic,
                method: "eth_sign".to_string(),
                params: serde_json::json!(["0xabc", "0xdeadbeef"]),
                chain_id: Some("eip155:1".to_string()),
            })
            .await
        }
    });
    let request = loop {
        if let ClientEvent::SessionRequest(request) = next(&mut wallet_events).await {
            break request;
        }
    };
    let response = JsonRpcResponse::new(request.request.id, serde_json::json!("0xsigned"));
    wallet
        .respond(&request.topic, response.into())
        .await
        .unwrap_or_else(|e| fail("respond", e));
    match call.await {
        Ok(Ok(response)) => println!("   result {}", response.result),
        Ok(Err(e)) => fail("request", e),
        Err(e) => fail("request", e),
    }

    println!("5. Dapp disconnects");
    dapp.disconnect(&session.topic, Reason::user_disconnected())
        .await
        .unwrap_or_else(|e| fail("disconnect", e));
    loop {
        if let ClientEvent::SessionDeleted { .. } = next(&mut wallet_events).await {
            break;
        }
    }
    println!();
    println!("Demo complete.");
}

async fn next(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
    match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
        Ok(Some(event)) => event,
        _ => {
            eprintln!("Error: timed out waiting for the peer");
            std::process::exit(1);
        }
    }
}

fn fail(step: &str, error: impl std::fmt::Display) -> ! {
    eprintln!("Error: {} failed: {}", step, error);
    std::process::exit(1);
}
