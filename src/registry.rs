// src/registry.rs
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use ethers::types::{Address, U256};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::clients::{BundlerClient, ChainClient};
use crate::error::PaymasterError;
use crate::types::{EntryPointVersion, SponsorshipMode};

/// Exchange rates are stored as `price * 10^6`.
pub const RATE_DECIMALS: u32 = 6;

/// Static per-chain settings, immutable once the process is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub entry_point: Address,
    pub entry_point_version: EntryPointVersion,
    pub verifying_paymaster: Option<Address>,
    pub erc20_paymaster: Option<Address>,
    pub fee_token: Option<Address>,
    pub bundler_url: String,
    pub price_pair: String,
}

impl ChainConfig {
    pub fn paymaster_for(&self, mode: SponsorshipMode) -> Result<Address, PaymasterError> {
        let paymaster = match mode {
            SponsorshipMode::Native => self.verifying_paymaster,
            SponsorshipMode::Erc20 => self.erc20_paymaster,
        };
        paymaster.ok_or_else(|| PaymasterError::UnsupportedMode {
            chain_id: self.chain_id,
            mode: mode.to_string(),
        })
    }

    pub fn fee_token(&self) -> Result<Address, PaymasterError> {
        self.fee_token.ok_or_else(|| PaymasterError::UnsupportedMode {
            chain_id: self.chain_id,
            mode: SponsorshipMode::Erc20.to_string(),
        })
    }
}

/// Converts a decimal price into the 6-decimal fixed point form, rounding half away from zero.
pub fn fixed_point_rate(price: Decimal) -> Option<U256> {
    if price.is_sign_negative() {
        return None;
    }
    let scaled = price
        .checked_mul(Decimal::from(10u64.pow(RATE_DECIMALS)))?
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    scaled.to_u128().map(U256::from)
}

#[derive(Debug)]
struct RateState {
    rate: U256,
    updated_at: Option<Instant>,
    consecutive_failures: u32,
    degraded: bool,
}

/// Last known exchange rate of a chain. Written by the price refresh task only.
#[derive(Debug, Clone)]
pub struct RateCache {
    inner: Arc<RwLock<RateState>>,
}

impl RateCache {
    pub fn new(initial_rate: U256) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RateState {
                rate: initial_rate,
                updated_at: None,
                consecutive_failures: 0,
                degraded: false,
            })),
        }
    }

    /// Never waits on a fetch; returns whatever was stored last.
    pub fn current(&self) -> U256 {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).rate
    }

    pub fn record_success(&self, rate: U256) {
        let mut state = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        state.rate = rate;
        state.updated_at = Some(Instant::now());
        state.consecutive_failures = 0;
        state.degraded = false;
    }

    /// Counts a failed refresh cycle and returns whether the rate is now degraded.
    pub fn record_failure(&self, degraded_after: u32) -> bool {
        let mut state = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if state.consecutive_failures >= degraded_after {
            state.degraded = true;
        }
        state.degraded
    }

    pub fn is_degraded(&self) -> bool {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).degraded
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).consecutive_failures
    }

    /// Time since the last successful refresh, `None` while only the configured rate is known.
    pub fn age(&self) -> Option<Duration> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .updated_at
            .map(|at| at.elapsed())
    }
}

/// Everything the service holds for one supported chain.
#[derive(Clone)]
pub struct ChainEntry {
    pub config: Arc<ChainConfig>,
    pub chain: Arc<dyn ChainClient>,
    pub bundler: Arc<dyn BundlerClient>,
    pub rate: RateCache,
}

/// Request-scoped view of one chain, resolved once and passed through the whole sponsorship.
#[derive(Clone)]
pub struct RequestContext {
    pub chain_id: u64,
    pub config: Arc<ChainConfig>,
    pub chain: Arc<dyn ChainClient>,
    pub bundler: Arc<dyn BundlerClient>,
    /// Exchange rate read when the request started. Every step of the request uses this value.
    pub exchange_rate: U256,
}

pub struct ChainRegistry {
    chains: HashMap<u64, ChainEntry>,
}

impl ChainRegistry {
    pub fn new(entries: Vec<ChainEntry>) -> Result<Self> {
        let mut chains = HashMap::with_capacity(entries.len());
        for entry in entries {
            let chain_id = entry.config.chain_id;
            if chains.insert(chain_id, entry).is_some() {
                bail!("chain {chain_id} is configured more than once");
            }
        }
        Ok(Self { chains })
    }

    fn entry(&self, chain_id: u64) -> Result<&ChainEntry, PaymasterError> {
        self.chains
            .get(&chain_id)
            .ok_or_else(|| PaymasterError::UnknownChain(chain_id.to_string()))
    }

    pub fn config_for(&self, chain_id: u64) -> Result<Arc<ChainConfig>, PaymasterError> {
        self.entry(chain_id).map(|entry| entry.config.clone())
    }

    pub fn current_rate(&self, chain_id: u64) -> Result<U256, PaymasterError> {
        self.entry(chain_id).map(|entry| entry.rate.current())
    }

    pub fn context(&self, chain_id: u64) -> Result<RequestContext, PaymasterError> {
        let entry = self.entry(chain_id)?;
        Ok(RequestContext {
            chain_id,
            config: entry.config.clone(),
            chain: entry.chain.clone(),
            bundler: entry.bundler.clone(),
            exchange_rate: entry.rate.current(),
        })
    }

    /// The chain implied when a request names none, only defined for single-chain deployments.
    pub fn sole_chain(&self) -> Option<u64> {
        match self.chains.len() {
            1 => self.chains.keys().next().copied(),
            _ => None,
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &ChainEntry> {
        self.chains.values()
    }

    pub fn degraded_chains(&self) -> Vec<u64> {
        let mut degraded: Vec<u64> = self
            .chains
            .values()
            .filter(|entry| entry.rate.is_degraded())
            .map(|entry| entry.config.chain_id)
            .collect();
        degraded.sort_unstable();
        degraded
    }
}
