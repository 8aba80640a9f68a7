//! peergrid node and developer CLI
//!
//! With no subcommand the binary runs a full node: wallet, chain, vault,
//! P2P host, gossip, and the HTTP gateway. Subcommands cover wallet and
//! payment management plus lightweight client flows (upload, download,
//! run-job) that start a chainless, vaultless node just long enough to
//! talk to the grid.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use libp2p::{Multiaddr, PeerId};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use peergrid::api::{self, ApiState};
use peergrid::chain::tx::{unix_now, unix_now_nanos};
use peergrid::chain::{Blockchain, ChainError, Transaction, BLOCK_REWARD, DEFAULT_DIFFICULTY};
use peergrid::crypto::{keys, wallet::wallet_path, Wallet};
use peergrid::network::{build_node, Client, NodeConfig, NodeServices, COMPUTE_CAPABILITY};
use peergrid::pipeline::{download_blob, run_job, upload_blob};
use peergrid::storage::Vault;
use peergrid::vm::{JobRunner, Sandbox};
use peergrid::Shutdown;

const DATA_DIR: &str = "./data";

#[derive(Parser)]
#[command(
    name = "peergrid",
    about = "Peer-to-peer grid node: distributed storage, wasm compute, minimal chain"
)]
struct Cli {
    /// Port to listen on (0 for random)
    #[arg(long, global = true, default_value_t = 0)]
    port: u16,

    /// Path to the secure storage vault
    #[arg(long, global = true, default_value = "./data/vault")]
    vault: PathBuf,

    /// Node mode
    #[arg(long, global = true, value_enum, default_value = "full")]
    mode: Mode,

    /// Bootstrap peer multiaddress (/ip4/../tcp/../p2p/..)
    #[arg(long, global = true)]
    peer: Option<Multiaddr>,

    /// Port for the HTTP gateway (0 disables it)
    #[arg(long = "api-port", global = true, default_value_t = 8080)]
    api_port: u16,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Mode {
    Full,
    Storage,
    Compute,
}

#[derive(Subcommand)]
enum Commands {
    /// Print (creating if necessary) this node's wallet address
    Wallet,
    /// Show the balance of an address (defaults to this node's wallet)
    Balance {
        #[arg(long)]
        address: Option<String>,
    },
    /// Create, sign, and broadcast a payment
    Pay {
        #[arg(long)]
        to: String,
        #[arg(long)]
        amount: u64,
    },
    /// Erasure-code a file and distribute its shards across the grid
    Upload {
        #[arg(long)]
        file: PathBuf,
    },
    /// Reassemble a previously uploaded file
    Download {
        /// Blob name used at upload time
        #[arg(long)]
        file: String,
        /// Original file size in bytes
        #[arg(long)]
        size: usize,
        /// Output path (defaults to the blob name)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Submit a wasm job to a compute provider
    RunJob {
        #[arg(long)]
        wasm: PathBuf,
        #[arg(long, default_value = "")]
        input: String,
        /// Specific provider peer id (discovered via DHT if omitted)
        #[arg(long)]
        target: Option<String>,
        /// Payment transaction id
        #[arg(long, default_value = "")]
        tx: String,
    },
    /// Run a full node with the mining loop
    Mine,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut cli = Cli::parse();
    match cli.command.take() {
        Some(Commands::Wallet) => cmd_wallet(&cli),
        Some(Commands::Balance { address }) => cmd_balance(&cli, address),
        Some(Commands::Pay { to, amount }) => cmd_pay(&cli, &to, amount).await,
        Some(Commands::Upload { file }) => cmd_upload(&cli, &file).await,
        Some(Commands::Download { file, size, out }) => {
            cmd_download(&cli, &file, size, out).await
        }
        Some(Commands::RunJob {
            wasm,
            input,
            target,
            tx,
        }) => cmd_run_job(&cli, &wasm, input, target, tx).await,
        Some(Commands::Mine) => run_node(&cli, true).await,
        None => run_node(&cli, false).await,
    }
}

fn node_id(port: u16) -> String {
    if port == 0 {
        "random".to_string()
    } else {
        port.to_string()
    }
}

fn chain_path(port: u16) -> PathBuf {
    PathBuf::from(DATA_DIR).join(format!("blockchain_{}", node_id(port)))
}

fn vault_key_path(vault: &std::path::Path) -> PathBuf {
    let mut path = vault.as_os_str().to_owned();
    path.push(".key");
    PathBuf::from(path)
}

fn load_wallet(cli: &Cli) -> anyhow::Result<Wallet> {
    fs::create_dir_all(DATA_DIR)?;
    Ok(Wallet::load_or_create(wallet_path(DATA_DIR, cli.port))?)
}

fn cmd_wallet(cli: &Cli) -> anyhow::Result<()> {
    let wallet = load_wallet(cli)?;
    println!("Wallet address: {}", wallet.address());
    Ok(())
}

fn cmd_balance(cli: &Cli, address: Option<String>) -> anyhow::Result<()> {
    let wallet = load_wallet(cli)?;
    let chain = Blockchain::open(chain_path(cli.port), &wallet.address(), DEFAULT_DIFFICULTY)
        .context("failed to open chain store (is a node already running on this data dir?)")?;

    let address = address.unwrap_or_else(|| wallet.address());
    println!("Balance of {address}: {}", chain.balance(&address)?);
    Ok(())
}

async fn cmd_pay(cli: &Cli, to: &str, amount: u64) -> anyhow::Result<()> {
    anyhow::ensure!(amount > 0, "amount must be positive");
    let wallet = load_wallet(cli)?;
    let tx = Transaction::new_signed(&wallet, to, amount);

    // Prefer the running node's gateway; it owns the chain lock.
    let url = format!("http://127.0.0.1:{}/api/v1/transaction", cli.api_port);
    info!(tx_id = %tx.id, %url, "broadcasting payment");
    match reqwest::Client::new().post(&url).json(&tx).send().await {
        Ok(response) if response.status().is_success() => {
            println!("Payment sent via gateway: {}", tx.id);
            return Ok(());
        }
        Ok(response) => {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("gateway rejected transaction: {body}");
        }
        Err(e) => warn!("gateway unreachable ({e}), writing to the chain directly"),
    }

    let chain = Blockchain::open(chain_path(cli.port), &wallet.address(), DEFAULT_DIFFICULTY)
        .context("chain store is locked by a running node; submit through its gateway")?;
    chain.add_transaction(tx.clone())?;
    let block = chain.add_block(vec![], &Shutdown::new())?;
    chain.flush()?;
    println!("Payment {} confirmed in block #{}", tx.id, block.index);
    Ok(())
}

/// Start a lightweight client node: no chain, no vault, no sandbox.
async fn start_client_node(cli: &Cli) -> anyhow::Result<Client> {
    let config = NodeConfig {
        listen_port: 0,
        bootstrap: cli.peer.iter().cloned().collect(),
        serve_compute: false,
    };
    let (client, event_loop, mut events) =
        build_node(config, NodeServices::default(), Shutdown::new()).await?;
    tokio::spawn(event_loop.run());
    tokio::spawn(async move { while events.recv().await.is_some() {} });

    // Give the DHT a moment to bootstrap.
    tokio::time::sleep(Duration::from_secs(2)).await;
    Ok(client)
}

async fn cmd_upload(cli: &Cli, file: &std::path::Path) -> anyhow::Result<()> {
    let data = fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("blob")
        .to_string();

    let client = start_client_node(cli).await?;
    let report = upload_blob(&client, None, &name, &data).await?;

    println!(
        "Upload complete: {}/{} shards stored, original_size={}",
        report.stored_shards, report.total_shards, report.original_size
    );
    Ok(())
}

async fn cmd_download(
    cli: &Cli,
    file: &str,
    size: usize,
    out: Option<PathBuf>,
) -> anyhow::Result<()> {
    anyhow::ensure!(size > 0, "specify the original size with --size");

    let client = start_client_node(cli).await?;
    let data = download_blob(&client, None, file, size).await?;

    let out = out.unwrap_or_else(|| PathBuf::from(file));
    fs::write(&out, &data)?;
    println!("Downloaded {} bytes to {}", data.len(), out.display());
    Ok(())
}

async fn cmd_run_job(
    cli: &Cli,
    wasm_path: &std::path::Path,
    input: String,
    target: Option<String>,
    tx: String,
) -> anyhow::Result<()> {
    let wasm =
        fs::read(wasm_path).with_context(|| format!("failed to read {}", wasm_path.display()))?;
    let target = target
        .map(|t| t.parse::<PeerId>())
        .transpose()
        .context("invalid target peer id")?;

    let client = start_client_node(cli).await?;
    let output = run_job(&client, target, &tx, wasm, input.into_bytes()).await?;

    println!("{}", String::from_utf8_lossy(&output));
    Ok(())
}

async fn run_node(cli: &Cli, mining: bool) -> anyhow::Result<()> {
    fs::create_dir_all(DATA_DIR)?;

    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    let wallet = load_wallet(cli)?;
    info!(address = %wallet.address(), "wallet ready");

    let chain = Arc::new(
        Blockchain::open(chain_path(cli.port), &wallet.address(), DEFAULT_DIFFICULTY)
            .context("failed to open chain store (is another node using this data dir?)")?,
    );
    info!(tip = %chain.tip_hash(), "blockchain initialized");

    let vault_key = keys::load_or_generate(vault_key_path(&cli.vault))?;
    let vault = Arc::new(
        Vault::open(&cli.vault, vault_key)
            .context("failed to open vault (is another node using it?)")?,
    );
    info!(path = %cli.vault.display(), "vault opened");

    let serve_compute = matches!(cli.mode, Mode::Full | Mode::Compute);
    let runner: Option<Arc<dyn JobRunner>> = if serve_compute {
        Some(Arc::new(Sandbox::new()?))
    } else {
        None
    };

    let config = NodeConfig {
        listen_port: cli.port,
        bootstrap: cli.peer.iter().cloned().collect(),
        serve_compute,
    };
    let services = NodeServices {
        vault: Some(vault.clone()),
        chain: Some(chain.clone()),
        runner: runner.clone(),
    };
    let (client, event_loop, mut events) =
        build_node(config, services, shutdown.clone()).await?;
    tokio::spawn(event_loop.run());
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            tracing::debug!(?event, "node event");
        }
    });

    if serve_compute {
        let client = client.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            // Let the DHT settle before advertising the capability.
            tokio::time::sleep(Duration::from_secs(5)).await;
            if shutdown.is_cancelled() {
                return;
            }
            match client.announce(COMPUTE_CAPABILITY).await {
                Ok(()) => info!("announced compute capability"),
                Err(e) => warn!("compute capability announce failed: {e}"),
            }
        });
    }

    if cli.api_port > 0 {
        let state = ApiState {
            client: client.clone(),
            chain: chain.clone(),
            runner,
        };
        let port = cli.api_port;
        tokio::spawn(async move {
            if let Err(e) = api::serve(state, port).await {
                warn!("http gateway stopped: {e}");
            }
        });
    }

    if mining {
        info!(address = %wallet.address(), "mining loop started");
        let miner_address = wallet.address();
        while !shutdown.is_cancelled() {
            let chain = chain.clone();
            let mine_shutdown = shutdown.clone();
            let coinbase = Transaction::coinbase(
                &miner_address,
                BLOCK_REWARD,
                unix_now(),
                format!("COINBASE_{}", unix_now_nanos()),
            );

            let mined =
                tokio::task::spawn_blocking(move || chain.add_block(vec![coinbase], &mine_shutdown))
                    .await?;
            match mined {
                Ok(block) => {
                    if let Err(e) = client.publish_block(block).await {
                        warn!("block broadcast failed: {e}");
                    }
                }
                Err(ChainError::Cancelled) => break,
                Err(e) => warn!("mining failed: {e}"),
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = shutdown.cancelled() => break,
            }
        }
    } else {
        shutdown.cancelled().await;
    }

    chain.flush()?;
    vault.flush()?;
    info!("node stopped");
    Ok(())
}
