use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use futures::{SinkExt, StreamExt};
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

use emberchain_core::{ChainEngine, ChainEvent, MiningOutcome, SendResult};
use emberchain_net::dispatcher::{Dispatcher, PeerTable};
use emberchain_net::ibd::{IbdController, IbdPhase};
use emberchain_net::message::{
    now_ms, random_node_nonce, Envelope, VersionPayload, MSG_GET_LATEST_BLOCK, MSG_VERSION,
};
use emberchain_net::{housekeeping, MessageCodec, PeerConnection};
use shared::crypto;

/// Wire protocol version this node speaks.
const PROTOCOL_VERSION: i32 = 1;

#[derive(Parser)]
#[command(name = "emberchain-node")]
#[command(about = "EmberChain full node")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start listening for peers and running the chain engine.
    StartNode(StartNodeArgs),
    /// Generate a new secp256k1 keypair and its EmberChain address.
    Keygen,
    /// Show the confirmed-plus-pending balance of an address.
    Balance(BalanceArgs),
    /// Build, sign, and broadcast a transaction into the local mempool.
    Send(SendArgs),
}

#[derive(Args)]
struct StartNodeArgs {
    /// Address to bind the listener to.
    #[arg(long, default_value = "0.0.0.0")]
    bind_address: String,

    /// Port to listen on.
    #[arg(short, long, default_value = "8333")]
    port: u16,

    /// Seed peers to dial on startup (host:port).
    #[arg(short, long)]
    connect: Vec<SocketAddr>,

    /// Directory holding the block store, transaction index, and mempool.
    #[arg(long, default_value = "./data")]
    data_dir: String,

    /// Mine to this address once the initial block download has succeeded.
    #[arg(long)]
    mine: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Args)]
struct BalanceArgs {
    #[arg(long, default_value = "./data")]
    data_dir: String,
    address: String,
}

#[derive(Args)]
struct SendArgs {
    #[arg(long, default_value = "./data")]
    data_dir: String,
    /// Sender's private key, hex-encoded.
    #[arg(long)]
    private_key: String,
    to: String,
    amount: i64,
}

#[tokio::main]
async fn main() -> shared::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::StartNode(args) => run_start_node(args).await,
        Commands::Keygen => {
            run_keygen();
            Ok(())
        }
        Commands::Balance(args) => run_balance(args),
        Commands::Send(args) => run_send(args),
    }
}

fn init_tracing(log_level: &str) {
    let level = match log_level {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    tracing_subscriber::fmt().with_max_level(level).init();
}

async fn run_start_node(args: StartNodeArgs) -> shared::Result<()> {
    init_tracing(&args.log_level);

    let mut engine = ChainEngine::load(&args.data_dir)?;
    let events_rx = engine
        .take_event_receiver()
        .expect("take_event_receiver succeeds once right after load");
    let chain = Arc::new(Mutex::new(engine));
    tokio::spawn(drain_events(events_rx));

    let peers: PeerTable = Arc::new(Mutex::new(HashMap::new()));
    let ibd = Arc::new(Mutex::new(IbdController::new()));
    let dispatcher = Arc::new(Dispatcher {
        node_version: PROTOCOL_VERSION,
        node_nonce: random_node_nonce(),
        chain: chain.clone(),
        peers: peers.clone(),
        ibd: ibd.clone(),
    });

    let shutdown = CancellationToken::new();
    tokio::spawn(housekeeping::run(peers.clone(), shutdown.clone()));

    let listener = TcpListener::bind((args.bind_address.as_str(), args.port)).await?;
    info!(addr = %listener.local_addr()?, "listening for peers");

    {
        let dispatcher = dispatcher.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((socket, addr)) => {
                                tokio::spawn(run_connection(socket, addr, false, dispatcher.clone()));
                            }
                            Err(e) => warn!("accept error: {e}"),
                        }
                    }
                    _ = shutdown.cancelled() => return,
                }
            }
        });
    }

    let mut connected = Vec::new();
    for seed in &args.connect {
        match TcpStream::connect(seed).await {
            Ok(socket) => {
                connected.push(*seed);
                tokio::spawn(run_connection(socket, *seed, true, dispatcher.clone()));
            }
            Err(e) => warn!(%seed, "failed to connect to seed peer: {e}"),
        }
    }

    if connected.is_empty() {
        ibd.lock().await.mark_succeeded();
    } else {
        tokio::time::sleep(Duration::from_millis(500)).await;
        ibd.lock().await.begin_preparing(&connected, now_ms());
        let table = peers.lock().await;
        for addr in &connected {
            if let Some(peer) = table.get(addr) {
                peer.enqueue(Envelope::new(MSG_GET_LATEST_BLOCK, "{}".to_string()));
            }
        }
    }

    if let Some(miner_address) = args.mine.clone() {
        tokio::spawn(run_mining(
            chain.clone(),
            dispatcher.clone(),
            ibd.clone(),
            miner_address,
            shutdown.clone(),
        ));
    }

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    shutdown.cancel();
    chain.lock().await.flush()?;
    Ok(())
}

async fn drain_events(mut rx: tokio::sync::mpsc::Receiver<ChainEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            ChainEvent::LatestBlock(b) => info!(height = b.height, "chain advanced"),
            ChainEvent::Blocks(blocks) => info!(count = blocks.len(), "blocks committed"),
            ChainEvent::Mempool(txs) => info!(count = txs.len(), "mempool accepted transactions"),
        }
    }
}

/// Mines continuously to `miner_address` once IBD has succeeded. Each
/// attempt builds a fresh template under a short-lived lock, searches the
/// nonce space without holding it, and re-checks the chain tip before
/// committing so a block accepted from a peer mid-search is never clobbered.
async fn run_mining(
    chain: Arc<Mutex<ChainEngine>>,
    dispatcher: Arc<Dispatcher>,
    ibd: Arc<Mutex<IbdController>>,
    miner_address: String,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        if ibd.lock().await.phase() != IbdPhase::Succeeded {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(500)) => continue,
                _ = cancel.cancelled() => return,
            }
        }

        let template = chain.lock().await.block_template(&miner_address, now_ms());
        let outcome = emberchain_core::mine(
            template.height,
            template.timestamp,
            template.merkle,
            template.prev,
            template.difficulty,
            &cancel,
        )
        .await;

        match outcome {
            MiningOutcome::Found { nonce, hash } => {
                let committed = chain.lock().await.commit_mined_block(&template, nonce, hash);
                match committed {
                    Ok(true) => {
                        info!(height = template.height, "mined block");
                        dispatcher.broadcast_mined_block().await;
                    }
                    Ok(false) => {
                        tracing::debug!("mined block superseded by a newer chain tip, retrying");
                    }
                    Err(e) => warn!("failed to commit mined block: {e}"),
                }
            }
            MiningOutcome::Exhausted => continue,
            MiningOutcome::Cancelled => return,
        }
    }
}

async fn run_connection(
    socket: TcpStream,
    addr: SocketAddr,
    is_outbound: bool,
    dispatcher: Arc<Dispatcher>,
) {
    let (mut sink, mut stream) = Framed::new(socket, MessageCodec::default()).split();
    let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::unbounded_channel();

    dispatcher
        .peers
        .lock()
        .await
        .insert(addr, PeerConnection::new(addr, is_outbound, outbound_tx.clone()));

    if is_outbound {
        let greeting = Envelope::encode_payload(
            MSG_VERSION,
            &VersionPayload {
                ver: dispatcher.node_version,
                height: 0,
                nonce: dispatcher.node_nonce,
            },
        )
        .expect("version payload serializes");
        let _ = outbound_tx.send(greeting);
    }

    let writer = tokio::spawn(async move {
        while let Some(envelope) = outbound_rx.recv().await {
            if sink.send(envelope).await.is_err() {
                break;
            }
        }
    });

    loop {
        match stream.next().await {
            Some(Ok(envelope)) => {
                if !dispatcher.handle(addr, envelope).await {
                    break;
                }
                let should_disconnect = dispatcher
                    .peers
                    .lock()
                    .await
                    .get(&addr)
                    .map(|p| p.should_disconnect)
                    .unwrap_or(true);
                if should_disconnect {
                    break;
                }
            }
            Some(Err(e)) => {
                tracing::debug!(%addr, "framing error, closing: {e}");
                break;
            }
            None => break,
        }
    }

    dispatcher.peers.lock().await.remove(&addr);
    writer.abort();
}

fn run_keygen() {
    let secp = Secp256k1::new();
    let secret = SecretKey::new(&mut secp256k1::rand::thread_rng());
    let public = PublicKey::from_secret_key(&secp, &secret);
    let address = crypto::address_from_public_key(&public);
    println!("address:     {address}");
    println!("private-key: {}", hex::encode(secret.secret_bytes()));
}

fn run_balance(args: BalanceArgs) -> shared::Result<()> {
    let mut engine = ChainEngine::load(&args.data_dir)?;
    let balance = engine.collect_balance(&args.address)?;
    println!("{balance}");
    Ok(())
}

fn run_send(args: SendArgs) -> shared::Result<()> {
    let secret_bytes =
        hex::decode(&args.private_key).map_err(|_| shared::ChainError::InvalidSignature)?;
    let secret = SecretKey::from_slice(&secret_bytes).map_err(|_| shared::ChainError::InvalidSignature)?;
    let secp = Secp256k1::new();
    let public = PublicKey::from_secret_key(&secp, &secret);
    let from = crypto::address_from_public_key(&public);

    let mut engine = ChainEngine::load(&args.data_dir)?;
    let now = now_ms();
    match engine.send(&from, &args.to, args.amount, &secret, now)? {
        SendResult::Sent(tx) => {
            engine.flush()?;
            println!("broadcast transaction {}", tx.id.to_hex());
        }
        SendResult::InvalidKey => println!("private key does not derive the sending address"),
        SendResult::Insufficient => println!("insufficient confirmed balance"),
        SendResult::TooManyInputs => println!("too many unspent outputs would be required"),
    }
    Ok(())
}
