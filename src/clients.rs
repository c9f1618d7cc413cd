// src/clients.rs
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::types::{GasLimits, UserOperationV0_6, UserOperationV0_7, UserOperationVariant};

mod bindings {
    use ethers::prelude::abigen;

    abigen!(
        VerifyingPaymasterV06,
        r#"[
            struct UserOperation { address sender; uint256 nonce; bytes initCode; bytes callData; uint256 callGasLimit; uint256 verificationGasLimit; uint256 preVerificationGas; uint256 maxFeePerGas; uint256 maxPriorityFeePerGas; bytes paymasterAndData; bytes signature; }
            function getHash(UserOperation userOp, uint48 validUntil, uint48 validAfter) external view returns (bytes32)
        ]"#
    );

    abigen!(
        TokenPaymasterV06,
        r#"[
            struct UserOperation { address sender; uint256 nonce; bytes initCode; bytes callData; uint256 callGasLimit; uint256 verificationGasLimit; uint256 preVerificationGas; uint256 maxFeePerGas; uint256 maxPriorityFeePerGas; bytes paymasterAndData; bytes signature; }
            function getHash(UserOperation userOp, uint48 validUntil, uint48 validAfter, address feeToken, uint256 exchangeRate) external view returns (bytes32)
        ]"#
    );

    abigen!(
        VerifyingPaymasterV07,
        r#"[
            struct PackedUserOperation { address sender; uint256 nonce; bytes initCode; bytes callData; bytes32 accountGasLimits; uint256 preVerificationGas; bytes32 gasFees; bytes paymasterAndData; bytes signature; }
            function getHash(PackedUserOperation userOp, uint48 validUntil, uint48 validAfter) external view returns (bytes32)
        ]"#
    );

    abigen!(
        TokenPaymasterV07,
        r#"[
            struct PackedUserOperation { address sender; uint256 nonce; bytes initCode; bytes callData; bytes32 accountGasLimits; uint256 preVerificationGas; bytes32 gasFees; bytes paymasterAndData; bytes signature; }
            function getHash(PackedUserOperation userOp, uint48 validUntil, uint48 validAfter, address feeToken, uint256 exchangeRate) external view returns (bytes32)
        ]"#
    );

    abigen!(
        Erc20Token,
        r#"[
            function allowance(address owner, address spender) external view returns (uint256)
            function balanceOf(address account) external view returns (uint256)
        ]"#
    );
}

use bindings::{
    token_paymaster_v06, token_paymaster_v07, verifying_paymaster_v06, verifying_paymaster_v07,
    Erc20Token, TokenPaymasterV06, TokenPaymasterV07, VerifyingPaymasterV06, VerifyingPaymasterV07,
};

/// Token terms a token paymaster binds into its hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenTerms {
    pub token: Address,
    pub exchange_rate: U256,
}

/// Arguments of a paymaster `getHash` view call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymasterHashRequest {
    pub paymaster: Address,
    pub user_op: UserOperationVariant,
    pub valid_until: u64,
    pub valid_after: u64,
    pub token_terms: Option<TokenTerms>,
}

/// Chain reads the sponsorship needs, scoped to one chain.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn block_number(&self) -> Result<u64>;

    async fn paymaster_hash(&self, request: PaymasterHashRequest) -> Result<H256>;

    async fn token_allowance(&self, token: Address, owner: Address, spender: Address) -> Result<U256>;

    async fn token_balance(&self, token: Address, owner: Address) -> Result<U256>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait BundlerClient: Send + Sync {
    async fn estimate_user_operation_gas(
        &self,
        user_op: UserOperationVariant,
        entry_point: Address,
    ) -> Result<GasLimits>;
}

/// The sponsoring account.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PaymasterSigner: Send + Sync {
    fn account(&self) -> Address;

    /// EIP-191 personal signature over raw bytes.
    async fn sign(&self, message: Vec<u8>) -> Result<Bytes>;
}

pub struct EthersChainClient {
    client: Arc<Provider<Http>>,
}

impl EthersChainClient {
    pub fn new(rpc_url: &str) -> Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .with_context(|| format!("invalid rpc url {rpc_url}"))?;
        Ok(Self { client: Arc::new(provider) })
    }
}

fn v06_tuple(op: UserOperationV0_6) -> verifying_paymaster_v06::UserOperation {
    verifying_paymaster_v06::UserOperation {
        sender: op.sender,
        nonce: op.nonce,
        init_code: op.init_code,
        call_data: op.call_data,
        call_gas_limit: op.call_gas_limit,
        verification_gas_limit: op.verification_gas_limit,
        pre_verification_gas: op.pre_verification_gas,
        max_fee_per_gas: op.max_fee_per_gas,
        max_priority_fee_per_gas: op.max_priority_fee_per_gas,
        paymaster_and_data: op.paymaster_and_data,
        signature: op.signature,
    }
}

fn v06_token_tuple(op: UserOperationV0_6) -> token_paymaster_v06::UserOperation {
    let op = v06_tuple(op);
    token_paymaster_v06::UserOperation {
        sender: op.sender,
        nonce: op.nonce,
        init_code: op.init_code,
        call_data: op.call_data,
        call_gas_limit: op.call_gas_limit,
        verification_gas_limit: op.verification_gas_limit,
        pre_verification_gas: op.pre_verification_gas,
        max_fee_per_gas: op.max_fee_per_gas,
        max_priority_fee_per_gas: op.max_priority_fee_per_gas,
        paymaster_and_data: op.paymaster_and_data,
        signature: op.signature,
    }
}

fn v07_packed(op: &UserOperationV0_7) -> verifying_paymaster_v07::PackedUserOperation {
    verifying_paymaster_v07::PackedUserOperation {
        sender: op.sender,
        nonce: op.nonce,
        init_code: op.init_code(),
        call_data: op.call_data.clone(),
        account_gas_limits: op.account_gas_limits(),
        pre_verification_gas: op.pre_verification_gas,
        gas_fees: op.gas_fees(),
        paymaster_and_data: op.paymaster_and_data(),
        signature: op.signature.clone(),
    }
}

fn v07_token_packed(op: &UserOperationV0_7) -> token_paymaster_v07::PackedUserOperation {
    let op = v07_packed(op);
    token_paymaster_v07::PackedUserOperation {
        sender: op.sender,
        nonce: op.nonce,
        init_code: op.init_code,
        call_data: op.call_data,
        account_gas_limits: op.account_gas_limits,
        pre_verification_gas: op.pre_verification_gas,
        gas_fees: op.gas_fees,
        paymaster_and_data: op.paymaster_and_data,
        signature: op.signature,
    }
}

#[async_trait]
impl ChainClient for EthersChainClient {
    async fn block_number(&self) -> Result<u64> {
        Ok(self.client.get_block_number().await?.as_u64())
    }

    async fn paymaster_hash(&self, request: PaymasterHashRequest) -> Result<H256> {
        let PaymasterHashRequest { paymaster, user_op, valid_until, valid_after, token_terms } = request;
        debug!(%paymaster, valid_until, valid_after, token = token_terms.is_some(), "Requesting paymaster hash");

        let hash = match (user_op, token_terms) {
            (UserOperationVariant::V0_6(op), None) => {
                VerifyingPaymasterV06::new(paymaster, self.client.clone())
                    .get_hash(v06_tuple(op), valid_until, valid_after)
                    .call()
                    .await?
            }
            (UserOperationVariant::V0_6(op), Some(terms)) => {
                TokenPaymasterV06::new(paymaster, self.client.clone())
                    .get_hash(v06_token_tuple(op), valid_until, valid_after, terms.token, terms.exchange_rate)
                    .call()
                    .await?
            }
            (UserOperationVariant::V0_7(op), None) => {
                VerifyingPaymasterV07::new(paymaster, self.client.clone())
                    .get_hash(v07_packed(&op), valid_until, valid_after)
                    .call()
                    .await?
            }
            (UserOperationVariant::V0_7(op), Some(terms)) => {
                TokenPaymasterV07::new(paymaster, self.client.clone())
                    .get_hash(v07_token_packed(&op), valid_until, valid_after, terms.token, terms.exchange_rate)
                    .call()
                    .await?
            }
        };
        Ok(H256::from(hash))
    }

    async fn token_allowance(&self, token: Address, owner: Address, spender: Address) -> Result<U256> {
        Ok(Erc20Token::new(token, self.client.clone()).allowance(owner, spender).call().await?)
    }

    async fn token_balance(&self, token: Address, owner: Address) -> Result<U256> {
        Ok(Erc20Token::new(token, self.client.clone()).balance_of(owner).call().await?)
    }
}

pub struct EthersBundlerClient {
    provider: Provider<Http>,
}

impl EthersBundlerClient {
    pub fn new(bundler_url: &str) -> Result<Self> {
        let provider = Provider::<Http>::try_from(bundler_url)
            .with_context(|| format!("invalid bundler url {bundler_url}"))?;
        Ok(Self { provider })
    }
}

#[async_trait]
impl BundlerClient for EthersBundlerClient {
    async fn estimate_user_operation_gas(
        &self,
        user_op: UserOperationVariant,
        entry_point: Address,
    ) -> Result<GasLimits> {
        let limits: GasLimits = self
            .provider
            .request("eth_estimateUserOperationGas", (user_op, entry_point))
            .await?;
        Ok(limits)
    }
}

#[async_trait]
impl PaymasterSigner for LocalWallet {
    fn account(&self) -> Address {
        Signer::address(self)
    }

    async fn sign(&self, message: Vec<u8>) -> Result<Bytes> {
        let signature = Signer::sign_message(self, message).await?;
        Ok(Bytes::from(signature.to_vec()))
    }
}
