// src/main.rs
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dotenv::dotenv;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod clients;
mod config;
mod error;
mod fee;
mod gas;
mod paymaster;
mod price;
mod registry;
mod rpc;
mod sponsor;
mod types;

use crate::clients::{EthersBundlerClient, EthersChainClient, PaymasterSigner};
use crate::paymaster::PaymasterEncoder;
use crate::price::{CryptoCompare, PriceRefreshSettings, PriceRefresher, CRYPTOCOMPARE_URL};
use crate::registry::{ChainEntry, ChainRegistry, RateCache};
use crate::rpc::PaymasterRpc;
use crate::sponsor::Sponsor;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(long, env = "LISTEN_ADDR", default_value = "127.0.0.1:8000")]
    listen_addr: SocketAddr,

    #[clap(long, env = "PAYMASTER_PRIVATE_KEY", hide_env_values = true)]
    private_key: String,

    /// JSON file listing the supported chains.
    #[clap(long, env = "CHAINS_FILE", default_value = "chains.json")]
    chains: PathBuf,

    #[clap(long, env = "PRICE_API_URL", default_value = CRYPTOCOMPARE_URL)]
    price_api_url: String,

    #[clap(long, env = "PRICE_REFRESH_SECS", default_value_t = 120, value_parser = clap::value_parser!(u64).range(1..))]
    price_refresh_secs: u64,

    #[clap(long, env = "PRICE_RETRIES", default_value_t = 3)]
    price_retries: u32,

    /// Failed refresh cycles before a chain is reported degraded.
    #[clap(long, env = "DEGRADED_AFTER", default_value_t = 3)]
    degraded_after: u32,

    #[clap(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    request_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let wallet = config::parse_private_key(&args.private_key)?;
    let chains = config::load_chains(&args.chains)?;

    let mut entries = Vec::with_capacity(chains.len());
    for chain in chains {
        info!(
            chain_id = chain.config.chain_id,
            entry_point = ?chain.config.entry_point,
            version = %chain.config.entry_point_version,
            "Registering chain"
        );
        entries.push(ChainEntry {
            chain: Arc::new(EthersChainClient::new(&chain.rpc_url)?),
            bundler: Arc::new(EthersBundlerClient::new(&chain.config.bundler_url)?),
            rate: RateCache::new(chain.initial_rate),
            config: Arc::new(chain.config),
        });
    }
    let registry = Arc::new(ChainRegistry::new(entries)?);

    let signer: Arc<dyn PaymasterSigner> = Arc::new(wallet);
    info!(paymaster_signer = ?signer.account(), "Loaded sponsoring key");

    let cancel = CancellationToken::new();

    let refresher = Arc::new(PriceRefresher::new(
        Arc::new(CryptoCompare::new(args.price_api_url)),
        PriceRefreshSettings {
            interval: Duration::from_secs(args.price_refresh_secs),
            retries: args.price_retries,
            degraded_after: args.degraded_after,
            ..PriceRefreshSettings::default()
        },
    ));
    let mut refresh_tasks = Vec::new();
    for entry in registry.entries() {
        refresh_tasks.push(refresher.clone().spawn(
            entry.config.chain_id,
            entry.config.price_pair.clone(),
            entry.rate.clone(),
            cancel.clone(),
        ));
    }

    let sponsor = Sponsor::new(
        registry.clone(),
        PaymasterEncoder::new(signer),
        Duration::from_secs(args.request_timeout_secs),
    );
    let rpc = Arc::new(PaymasterRpc::new(Arc::new(sponsor)));

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
        }
        shutdown.cancel();
    });

    rpc::serve(args.listen_addr, rpc, cancel.clone()).await?;

    cancel.cancel();
    for task in refresh_tasks {
        task.await?;
    }
    info!("Paymaster stopped");
    Ok(())
}
