// src/config.rs
use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use ethers::signers::LocalWallet;
use ethers::types::{Address, U256};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::registry::{fixed_point_rate, ChainConfig};
use crate::types::EntryPointVersion;

/// One chain as written in the chains file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ChainFileEntry {
    pub chain_id: u64,
    pub entry_point: Address,
    pub entry_point_version: EntryPointVersion,
    pub rpc_url: String,
    pub bundler_url: String,
    #[serde(default)]
    pub verifying_paymaster: Option<Address>,
    #[serde(default)]
    pub erc20_paymaster: Option<Address>,
    #[serde(default)]
    pub fee_token: Option<Address>,
    #[serde(default = "default_price_pair")]
    pub price_pair: String,
    /// Native coin price in fee token units, used until the first refresh succeeds.
    pub initial_rate: Decimal,
}

fn default_price_pair() -> String {
    "ETH/USD".to_string()
}

/// A validated chain: static config, starting fixed-point rate and node url.
#[derive(Debug)]
pub struct LoadedChain {
    pub config: ChainConfig,
    pub initial_rate: U256,
    pub rpc_url: String,
}

impl ChainFileEntry {
    pub fn into_chain(self) -> Result<LoadedChain> {
        let chain_id = self.chain_id;
        ensure!(
            self.verifying_paymaster.is_some() || self.erc20_paymaster.is_some(),
            "chain {chain_id}: no paymaster configured"
        );
        ensure!(
            self.erc20_paymaster.is_none() || self.fee_token.is_some(),
            "chain {chain_id}: erc20Paymaster requires feeToken"
        );
        ensure!(
            self.price_pair.split_once('/').is_some_and(|(b, q)| !b.is_empty() && !q.is_empty()),
            "chain {chain_id}: price pair {:?} is not BASE/QUOTE",
            self.price_pair
        );
        let initial_rate = match fixed_point_rate(self.initial_rate) {
            Some(rate) if !rate.is_zero() => rate,
            _ => bail!("chain {chain_id}: invalid initial rate {}", self.initial_rate),
        };

        Ok(LoadedChain {
            config: ChainConfig {
                chain_id,
                entry_point: self.entry_point,
                entry_point_version: self.entry_point_version,
                verifying_paymaster: self.verifying_paymaster,
                erc20_paymaster: self.erc20_paymaster,
                fee_token: self.fee_token,
                bundler_url: self.bundler_url,
                price_pair: self.price_pair,
            },
            initial_rate,
            rpc_url: self.rpc_url,
        })
    }
}

pub fn parse_chains(raw: &str) -> Result<Vec<LoadedChain>> {
    let entries: Vec<ChainFileEntry> = serde_json::from_str(raw).context("malformed chains file")?;
    ensure!(!entries.is_empty(), "chains file lists no chains");

    let mut seen = HashSet::new();
    entries
        .into_iter()
        .map(|entry| {
            ensure!(seen.insert(entry.chain_id), "chain {} is configured more than once", entry.chain_id);
            entry.into_chain()
        })
        .collect()
}

pub fn load_chains(path: &Path) -> Result<Vec<LoadedChain>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_chains(&raw).with_context(|| format!("loading {}", path.display()))
}

/// Parses the sponsoring key, with or without a `0x` prefix.
pub fn parse_private_key(raw: &str) -> Result<LocalWallet> {
    let raw = raw.trim();
    let bytes = hex::decode(raw.strip_prefix("0x").unwrap_or(raw)).context("private key is not hex")?;
    ensure!(bytes.len() == 32, "private key must be 32 bytes, got {}", bytes.len());
    LocalWallet::from_bytes(&bytes).context("invalid private key")
}
