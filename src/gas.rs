// src/gas.rs
use ethers::types::U256;
use tracing::debug;

use crate::error::PaymasterError;
use crate::registry::RequestContext;
use crate::types::{ensure_packable, EntryPointVersion, GasLimits, PaymasterAuthorization, UserOperationVariant};

/// v0.6 verification gas is accepted at 130% of the estimate.
const LEGACY_VERIFICATION_GAS_NUMERATOR: u64 = 13;
const LEGACY_VERIFICATION_GAS_DENOMINATOR: u64 = 10;

/// `raw * 1.3`, rounded to the nearest integer.
pub fn inflate_verification_gas(raw: U256) -> Option<U256> {
    let scaled = raw.checked_mul(U256::from(LEGACY_VERIFICATION_GAS_NUMERATOR))?;
    let half = U256::from(LEGACY_VERIFICATION_GAS_DENOMINATOR / 2);
    Some(scaled.checked_add(half)? / U256::from(LEGACY_VERIFICATION_GAS_DENOMINATOR))
}

#[derive(Debug, Default)]
pub struct GasEstimator;

impl GasEstimator {
    /// Estimates gas for `user_op` with `placeholder` attached. Not retried on failure.
    pub async fn estimate(
        &self,
        ctx: &RequestContext,
        user_op: &UserOperationVariant,
        placeholder: &PaymasterAuthorization,
    ) -> Result<GasLimits, PaymasterError> {
        let mut image = user_op.clone();
        image.apply_authorization(placeholder);

        let mut limits = ctx
            .bundler
            .estimate_user_operation_gas(image, ctx.config.entry_point)
            .await
            .map_err(|e| PaymasterError::EstimationFailed(format!("{e:#}")))?;
        debug!(chain_id = ctx.chain_id, ?limits, "Bundler gas estimate");

        match user_op.version() {
            EntryPointVersion::V0_6 => {
                limits.verification_gas_limit = inflate_verification_gas(limits.verification_gas_limit)
                    .ok_or_else(|| {
                        PaymasterError::EstimationFailed("verification gas estimate overflows".to_string())
                    })?;
                limits.paymaster_verification_gas_limit = None;
                limits.paymaster_post_op_gas_limit = None;
            }
            // the bundler already reports paymaster overhead separately
            EntryPointVersion::V0_7 => {
                ensure_packable(&[
                    ("callGasLimit", Some(limits.call_gas_limit)),
                    ("verificationGasLimit", Some(limits.verification_gas_limit)),
                    ("paymasterVerificationGasLimit", limits.paymaster_verification_gas_limit),
                    ("paymasterPostOpGasLimit", limits.paymaster_post_op_gas_limit),
                ])
                .map_err(PaymasterError::EstimationFailed)?;
            }
        }
        Ok(limits)
    }
}
