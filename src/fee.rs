// src/fee.rs
use ethers::types::U256;
use num_bigint::BigUint;
use tracing::debug;

use crate::error::PaymasterError;
use crate::registry::RequestContext;
use crate::types::{GasLimits, SponsorshipMode, UserOperationVariant};

/// Scale of the wei amount in `gas_in_wei * rate`.
const WEI_DECIMALS: u32 = 18;

pub fn to_biguint(value: U256) -> BigUint {
    let mut bytes = [0u8; 32];
    value.to_big_endian(&mut bytes);
    BigUint::from_bytes_be(&bytes)
}

/// Exact `(call + preVerification + verification + paymasterVerification + paymasterPostOp) * maxFeePerGas`.
pub fn calculate_gas_in_wei(limits: &GasLimits, max_fee_per_gas: U256) -> BigUint {
    let total_gas = [
        Some(limits.call_gas_limit),
        Some(limits.pre_verification_gas),
        Some(limits.verification_gas_limit),
        limits.paymaster_verification_gas_limit,
        limits.paymaster_post_op_gas_limit,
    ]
    .into_iter()
    .flatten()
    .map(to_biguint)
    .sum::<BigUint>();
    total_gas * to_biguint(max_fee_per_gas)
}

/// `gas_in_wei * rate / 10^18` rounded half up, in fee token units.
pub fn calculate_gas_in_token(gas_in_wei: &BigUint, exchange_rate: U256) -> BigUint {
    let scale = BigUint::from(10u32).pow(WEI_DECIMALS);
    let product = gas_in_wei * to_biguint(exchange_rate);
    let quotient = &product / &scale;
    let remainder = &product % &scale;
    if remainder * 2u32 >= scale {
        quotient + 1u32
    } else {
        quotient
    }
}

#[derive(Debug, Default)]
pub struct FeeValidator;

impl FeeValidator {
    /// Checks the sender has approved and holds enough fee token for the operation's gas.
    /// Returns the required token amount.
    pub async fn ensure_token_payment(
        &self,
        ctx: &RequestContext,
        user_op: &UserOperationVariant,
    ) -> Result<BigUint, PaymasterError> {
        let token = ctx.config.fee_token()?;
        let paymaster = ctx.config.paymaster_for(SponsorshipMode::Erc20)?;
        let sender = user_op.sender();

        let gas_in_wei = calculate_gas_in_wei(&user_op.gas_limits(), user_op.max_fee_per_gas());
        let gas_in_token = calculate_gas_in_token(&gas_in_wei, ctx.exchange_rate);

        let (allowance, balance) = tokio::try_join!(
            ctx.chain.token_allowance(token, sender, paymaster),
            ctx.chain.token_balance(token, sender),
        )
        .map_err(|e| PaymasterError::ChainReadFailed(format!("{e:#}")))?;
        debug!(
            chain_id = ctx.chain_id,
            %sender,
            %gas_in_wei,
            %gas_in_token,
            %allowance,
            %balance,
            "Validating token payment"
        );

        if to_biguint(allowance) < gas_in_token {
            return Err(PaymasterError::PaymasterNotApproved);
        }
        if to_biguint(balance) < gas_in_token {
            return Err(PaymasterError::InsufficientTokenBalance);
        }
        Ok(gas_in_token)
    }
}

#[cfg(test)]
mod tests {
    use ethers::types::Address;
    use mockall::predicate::eq;

    use super::*;
    use crate::clients::{MockBundlerClient, MockChainClient};
    use crate::paymaster::tests::v06_op;
    use crate::registry::tests::{arbitrum_config, entry};
    use crate::registry::ChainRegistry;
    use crate::types::EntryPointVersion;

    const RATE: u64 = 4_000_000_000;
    const REQUIRED: u64 = 1_200_000;

    fn limits(call: u64, pre: u64, verification: u64) -> GasLimits {
        GasLimits {
            call_gas_limit: U256::from(call),
            verification_gas_limit: U256::from(verification),
            pre_verification_gas: U256::from(pre),
            paymaster_verification_gas_limit: None,
            paymaster_post_op_gas_limit: None,
        }
    }

    fn context(chain: MockChainClient) -> RequestContext {
        ChainRegistry::new(vec![entry(
            arbitrum_config(EntryPointVersion::V0_6),
            chain,
            MockBundlerClient::new(),
            U256::from(RATE),
        )])
        .unwrap()
        .context(42161)
        .unwrap()
    }

    fn chain_with(allowance: u64, balance: u64) -> MockChainClient {
        let mut chain = MockChainClient::new();
        chain
            .expect_token_allowance()
            .with(eq(Address::repeat_byte(0x0c)), eq(Address::repeat_byte(0x5e)), eq(Address::repeat_byte(0x02)))
            .times(1)
            .returning(move |_, _, _| Ok(U256::from(allowance)));
        chain
            .expect_token_balance()
            .with(eq(Address::repeat_byte(0x0c)), eq(Address::repeat_byte(0x5e)))
            .times(1)
            .returning(move |_, _| Ok(U256::from(balance)));
        chain
    }

    #[test]
    fn gas_in_wei_is_exact_at_u256_max() {
        let max = U256::MAX;
        let limits = GasLimits {
            call_gas_limit: max,
            verification_gas_limit: max,
            pre_verification_gas: max,
            paymaster_verification_gas_limit: Some(max),
            paymaster_post_op_gas_limit: Some(max),
        };
        let big_max = (BigUint::from(1u32) << 256u32) - 1u32;
        assert_eq!(calculate_gas_in_wei(&limits, max), &big_max * 5u32 * &big_max);
    }

    #[test]
    fn arbitrum_scenario() {
        // (100000 + 50000 + 150000) * 1 gwei
        let gas_in_wei = calculate_gas_in_wei(&limits(100_000, 50_000, 150_000), U256::from(1_000_000_000u64));
        assert_eq!(gas_in_wei, BigUint::from(300_000_000_000_000u64));
        // 3e14 * 4000e6 / 1e18
        assert_eq!(calculate_gas_in_token(&gas_in_wei, U256::from(RATE)), BigUint::from(REQUIRED));
    }

    #[test]
    fn token_amount_rounds_half_up() {
        let scale = BigUint::from(10u32).pow(18);
        let half = &scale / 2u32;
        assert_eq!(calculate_gas_in_token(&(&scale * 3u32 + &half), U256::one()), BigUint::from(4u32));
        assert_eq!(calculate_gas_in_token(&(&scale * 3u32 + &half - 1u32), U256::one()), BigUint::from(3u32));
        assert_eq!(calculate_gas_in_token(&BigUint::from(0u32), U256::from(RATE)), BigUint::from(0u32));
    }

    #[tokio::test]
    async fn accepts_sufficient_allowance_and_balance() {
        let ctx = context(chain_with(REQUIRED, REQUIRED));
        let required = FeeValidator.ensure_token_payment(&ctx, &v06_op()).await.unwrap();
        assert_eq!(required, BigUint::from(REQUIRED));
    }

    #[tokio::test]
    async fn low_allowance_rejects_even_with_balance() {
        let ctx = context(chain_with(REQUIRED - 1, u64::MAX));
        let err = FeeValidator.ensure_token_payment(&ctx, &v06_op()).await.unwrap_err();
        assert!(matches!(err, PaymasterError::PaymasterNotApproved));
    }

    #[tokio::test]
    async fn low_balance_rejects_with_allowance() {
        let ctx = context(chain_with(REQUIRED, REQUIRED - 1));
        let err = FeeValidator.ensure_token_payment(&ctx, &v06_op()).await.unwrap_err();
        assert!(matches!(err, PaymasterError::InsufficientTokenBalance));
    }

    #[tokio::test]
    async fn allowance_checked_before_balance() {
        let ctx = context(chain_with(0, 0));
        let err = FeeValidator.ensure_token_payment(&ctx, &v06_op()).await.unwrap_err();
        assert!(matches!(err, PaymasterError::PaymasterNotApproved));
    }

    #[tokio::test]
    async fn read_failure_is_internal() {
        let mut chain = MockChainClient::new();
        chain.expect_token_allowance().returning(|_, _, _| Err(anyhow::anyhow!("timeout")));
        chain.expect_token_balance().returning(|_, _| Ok(U256::zero()));
        let err = FeeValidator.ensure_token_payment(&context(chain), &v06_op()).await.unwrap_err();
        assert!(matches!(err, PaymasterError::ChainReadFailed(_)));
    }
}
