// src/sponsor.rs
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ethers::types::Address;
use tracing::{debug, info, warn};

use crate::error::PaymasterError;
use crate::fee::FeeValidator;
use crate::gas::GasEstimator;
use crate::paymaster::PaymasterEncoder;
use crate::registry::{ChainRegistry, RequestContext};
use crate::types::{PaymasterAuthorization, SponsorshipMode, SponsorshipRequest, SponsorshipResult, UserOperationVariant};

/// Steps of a sponsorship, used to tag logs and failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Estimating,
    PlaceholderSigned,
    GasKnown,
    FinalSigning,
    TokenValidating,
    Accepted,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Received => "received",
            Self::Estimating => "estimating",
            Self::PlaceholderSigned => "placeholder_signed",
            Self::GasKnown => "gas_known",
            Self::FinalSigning => "final_signing",
            Self::TokenValidating => "token_validating",
            Self::Accepted => "accepted",
        };
        f.write_str(name)
    }
}

pub struct Sponsor {
    registry: Arc<ChainRegistry>,
    encoder: PaymasterEncoder,
    estimator: GasEstimator,
    fees: FeeValidator,
    request_timeout: Duration,
}

impl Sponsor {
    pub fn new(registry: Arc<ChainRegistry>, encoder: PaymasterEncoder, request_timeout: Duration) -> Self {
        Self {
            registry,
            encoder,
            estimator: GasEstimator,
            fees: FeeValidator,
            request_timeout,
        }
    }

    pub fn registry(&self) -> &ChainRegistry {
        &self.registry
    }

    /// Current block height of the chain as a `0x` hex string.
    pub async fn block_number(&self, chain_id: u64) -> Result<String, PaymasterError> {
        let ctx = self.registry.context(chain_id)?;
        let block = tokio::time::timeout(self.request_timeout, ctx.chain.block_number())
            .await
            .map_err(|_| PaymasterError::Timeout(self.request_timeout.as_secs()))?
            .map_err(|e| PaymasterError::ChainReadFailed(format!("{e:#}")))?;
        Ok(format!("0x{block:x}"))
    }

    /// Handles `pm_sponsorUserOperation` params for `chain_id`.
    pub async fn sponsor_user_operation(
        &self,
        chain_id: u64,
        params: serde_json::Value,
    ) -> Result<SponsorshipResult, PaymasterError> {
        // Received: everything below is checked before any network access
        let request = SponsorshipRequest::from_params(params)?;
        let ctx = self.registry.context(chain_id)?;
        let user_op = request.user_op.into_variant(ctx.config.entry_point_version)?;
        let paymaster = ctx.config.paymaster_for(request.mode)?;
        if request.mode == SponsorshipMode::Erc20 {
            ctx.config.fee_token()?;
        }
        if request.paymaster_hint != Address::zero() && request.paymaster_hint != paymaster {
            warn!(
                chain_id,
                hint = ?request.paymaster_hint,
                configured = ?paymaster,
                "Paymaster hint differs from configured paymaster, using configured"
            );
        }
        debug!(
            chain_id,
            stage = %Stage::Received,
            sender = ?user_op.sender(),
            mode = %request.mode,
            "Sponsorship requested"
        );

        let result = tokio::time::timeout(self.request_timeout, self.sponsor(&ctx, user_op, request.mode))
            .await
            .map_err(|_| PaymasterError::Timeout(self.request_timeout.as_secs()))??;
        Ok(result)
    }

    async fn sponsor(
        &self,
        ctx: &RequestContext,
        user_op: UserOperationVariant,
        mode: SponsorshipMode,
    ) -> Result<SponsorshipResult, PaymasterError> {
        match self.run(ctx, user_op, mode).await {
            Ok(user_op) => {
                info!(
                    chain_id = ctx.chain_id,
                    stage = %Stage::Accepted,
                    sender = ?user_op.sender(),
                    %mode,
                    "Sponsored user operation"
                );
                Ok(user_op.sponsorship_result())
            }
            Err((stage, err)) => {
                warn!(chain_id = ctx.chain_id, %stage, error = %err, "Sponsorship rejected");
                Err(err)
            }
        }
    }

    /// Runs the sponsorship steps, tagging a failure with the stage it happened in.
    async fn run(
        &self,
        ctx: &RequestContext,
        mut user_op: UserOperationVariant,
        mode: SponsorshipMode,
    ) -> Result<UserOperationVariant, (Stage, PaymasterError)> {
        let at = |stage: Stage| move |err: PaymasterError| (stage, err);

        // 1. Estimate with a placeholder authorization
        let placeholder = self
            .encoder
            .authorize(ctx, &user_op, mode, false)
            .await
            .map_err(at(Stage::Estimating))?;
        debug!(chain_id = ctx.chain_id, stage = %Stage::PlaceholderSigned, "Estimating gas");
        let limits = self
            .estimator
            .estimate(ctx, &user_op, &placeholder)
            .await
            .map_err(at(Stage::Estimating))?;
        user_op.apply_gas_limits(&limits);

        // 2. Attach the placeholder with the estimated paymaster gas
        debug!(chain_id = ctx.chain_id, stage = %Stage::GasKnown, ?limits, "Gas limits applied");
        let gas = user_op.gas_limits();
        user_op.apply_authorization(&PaymasterAuthorization {
            verification_gas_limit: gas.paymaster_verification_gas_limit.unwrap_or_default(),
            post_op_gas_limit: gas.paymaster_post_op_gas_limit.unwrap_or_default(),
            ..placeholder
        });

        match mode {
            // 3. Re-sign over the real hash now that the gas limits are final
            SponsorshipMode::Native => {
                let authorization = self
                    .encoder
                    .authorize(ctx, &user_op, mode, true)
                    .await
                    .map_err(at(Stage::FinalSigning))?;
                user_op.apply_authorization(&authorization);
            }
            // Token sponsorship keeps the placeholder signature; the token
            // paymaster is not re-signed over the real hash.
            SponsorshipMode::Erc20 => {
                self.fees
                    .ensure_token_payment(ctx, &user_op)
                    .await
                    .map_err(at(Stage::TokenValidating))?;
            }
        }
        Ok(user_op)
    }
}
