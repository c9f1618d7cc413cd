// src/paymaster.rs
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use ethers::abi::{encode, Token};
use ethers::types::{Address, Bytes, U256};
use tracing::debug;

use crate::clients::{PaymasterHashRequest, PaymasterSigner, TokenTerms};
use crate::error::PaymasterError;
use crate::registry::RequestContext;
use crate::types::{EntryPointVersion, PaymasterAuthorization, SponsorshipMode, UserOperationVariant};

/// Margin on both sides of `now` for the authorization's validity window.
pub const VALIDITY_MARGIN_SECS: u64 = 3600;

/// Signed instead of a real hash while gas limits are still unknown. The
/// signature is void but has the same size as a real one.
pub const PLACEHOLDER_MESSAGE: [u8; 1] = [0];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidityWindow {
    pub valid_after: u64,
    pub valid_until: u64,
}

impl ValidityWindow {
    pub fn around(now: u64) -> Self {
        Self {
            valid_after: now.saturating_sub(VALIDITY_MARGIN_SECS),
            valid_until: now + VALIDITY_MARGIN_SECS,
        }
    }

    pub fn now() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();
        Self::around(now)
    }
}

// Encode: abi(uint48 validUntil, uint48 validAfter, address feeToken, uint256 exchangeRate) + signature
fn encode_legacy_tail(window: ValidityWindow, terms: Option<TokenTerms>, signature: &[u8]) -> Bytes {
    let terms = terms.unwrap_or(TokenTerms { token: Address::zero(), exchange_rate: U256::zero() });
    let mut data = encode(&[
        Token::Uint(window.valid_until.into()),
        Token::Uint(window.valid_after.into()),
        Token::Address(terms.token),
        Token::Uint(terms.exchange_rate),
    ]);
    data.extend_from_slice(signature);
    Bytes::from(data)
}

// Encode: abi(uint48 validUntil, uint48 validAfter) + signature
fn encode_split_tail(window: ValidityWindow, signature: &[u8]) -> Bytes {
    let mut data = encode(&[
        Token::Uint(window.valid_until.into()),
        Token::Uint(window.valid_after.into()),
    ]);
    data.extend_from_slice(signature);
    Bytes::from(data)
}

pub struct PaymasterEncoder {
    signer: Arc<dyn PaymasterSigner>,
}

impl PaymasterEncoder {
    pub fn new(signer: Arc<dyn PaymasterSigner>) -> Self {
        Self { signer }
    }

    /// Builds a paymaster authorization for `user_op`.
    ///
    /// Without `request_real_signature` the placeholder message is signed and
    /// no chain call is made. Otherwise the paymaster's `getHash` is read for
    /// the fully assembled operation and that hash is signed.
    pub async fn authorize(
        &self,
        ctx: &RequestContext,
        user_op: &UserOperationVariant,
        mode: SponsorshipMode,
        request_real_signature: bool,
    ) -> Result<PaymasterAuthorization, PaymasterError> {
        // 1. Resolve the paymaster and token terms for the mode
        let paymaster = ctx.config.paymaster_for(mode)?;
        let token_terms = match mode {
            SponsorshipMode::Native => None,
            SponsorshipMode::Erc20 => Some(TokenTerms {
                token: ctx.config.fee_token()?,
                exchange_rate: ctx.exchange_rate,
            }),
        };
        let gas = user_op.gas_limits();
        let verification_gas_limit = gas.paymaster_verification_gas_limit.unwrap_or_default();
        let post_op_gas_limit = gas.paymaster_post_op_gas_limit.unwrap_or_default();

        // 2. Create time-range for paymaster validity
        let window = ValidityWindow::now();

        // 3. Hash and sign
        let message = if request_real_signature {
            let mut image = user_op.clone();
            image.apply_authorization(&PaymasterAuthorization {
                paymaster,
                verification_gas_limit,
                post_op_gas_limit,
                data: Bytes::default(),
            });
            let hash = ctx
                .chain
                .paymaster_hash(PaymasterHashRequest {
                    paymaster,
                    user_op: image,
                    valid_until: window.valid_until,
                    valid_after: window.valid_after,
                    token_terms,
                })
                .await
                .map_err(|e| PaymasterError::HashComputationFailed(format!("{e:#}")))?;
            debug!(chain_id = ctx.chain_id, ?hash, "Signing paymaster hash");
            hash.as_bytes().to_vec()
        } else {
            PLACEHOLDER_MESSAGE.to_vec()
        };
        let signature = self
            .signer
            .sign(message)
            .await
            .map_err(|e| PaymasterError::SigningFailed(format!("{e:#}")))?;

        // 4. Encode the paymaster data for the operation's EntryPoint
        let data = match user_op.version() {
            EntryPointVersion::V0_6 => encode_legacy_tail(window, token_terms, &signature),
            EntryPointVersion::V0_7 => encode_split_tail(window, &signature),
        };

        Ok(PaymasterAuthorization { paymaster, verification_gas_limit, post_op_gas_limit, data })
    }
}


#[cfg(test)]
pub(crate) mod tests {
    use ethers::types::H256;
    use ethers::utils::hash_message;
    use mockall::predicate::function;

    use super::layout::*;
    use super::*;
    use crate::clients::tests::test_wallet;
    use crate::clients::{MockBundlerClient, MockChainClient, MockPaymasterSigner};
    use crate::registry::tests::{arbitrum_config, entry};
    use crate::registry::ChainRegistry;
    use crate::types::{UserOperationV0_6, UserOperationV0_7};

    pub(crate) fn v06_op() -> UserOperationVariant {
        UserOperationVariant::V0_6(UserOperationV0_6 {
            sender: Address::repeat_byte(0x5e),
            nonce: U256::from(7),
            init_code: Bytes::default(),
            call_data: Bytes::from(vec![0xb6, 0x1d, 0x27, 0xf6]),
            call_gas_limit: U256::from(100_000),
            verification_gas_limit: U256::from(150_000),
            pre_verification_gas: U256::from(50_000),
            max_fee_per_gas: U256::from(1_000_000_000u64),
            max_priority_fee_per_gas: U256::from(1_000_000u64),
            paymaster_and_data: Bytes::default(),
            signature: Bytes::default(),
        })
    }

    pub(crate) fn v07_op() -> UserOperationVariant {
        UserOperationVariant::V0_7(UserOperationV0_7 {
            sender: Address::repeat_byte(0x5e),
            nonce: U256::from(7),
            factory: None,
            factory_data: None,
            call_data: Bytes::from(vec![0xb6, 0x1d, 0x27, 0xf6]),
            call_gas_limit: U256::from(100_000),
            verification_gas_limit: U256::from(150_000),
            pre_verification_gas: U256::from(50_000),
            max_fee_per_gas: U256::from(1_000_000_000u64),
            max_priority_fee_per_gas: U256::from(1_000_000u64),
            paymaster: None,
            paymaster_verification_gas_limit: U256::from(40_000),
            paymaster_post_op_gas_limit: U256::from(20_000),
            paymaster_data: Bytes::default(),
            signature: Bytes::default(),
        })
    }

    fn context(version: EntryPointVersion, chain: MockChainClient) -> RequestContext {
        let registry = ChainRegistry::new(vec![entry(
            arbitrum_config(version),
            chain,
            MockBundlerClient::new(),
            U256::from(4_000_000_000u64),
        )])
        .unwrap();
        registry.context(42161).unwrap()
    }

    fn now() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
    }

    #[test]
    fn validity_window_spans_two_hours() {
        let before = now();
        let window = ValidityWindow::now();
        let after = now();
        assert_eq!(window.valid_until - window.valid_after, 7200);
        assert!(window.valid_after <= before);
        assert!(after <= window.valid_until);
    }

    #[test]
    fn legacy_blob_layout() {
        let data = LegacyPaymasterData {
            paymaster: Address::repeat_byte(0x02),
            window: ValidityWindow::around(1_700_000_000),
            fee_token: Address::repeat_byte(0x0c),
            exchange_rate: U256::from(4_000_000_000u64),
            signature: Bytes::from(vec![0x11; 65]),
        };
        let terms = TokenTerms { token: data.fee_token, exchange_rate: data.exchange_rate };
        let mut packed = data.paymaster.as_bytes().to_vec();
        packed.extend_from_slice(&encode_legacy_tail(data.window, Some(terms), &data.signature));
        assert_eq!(packed.len(), 20 + 128 + 65);
        assert_eq!(&packed[..20], Address::repeat_byte(0x02).as_bytes());
        assert_eq!(unpack_legacy(&packed).unwrap(), data);
    }

    #[test]
    fn unpack_rejects_short_blobs() {
        assert!(unpack_legacy(&[0u8; 100]).is_err());
        assert!(unpack_split(&[0u8; 10]).is_err());
    }

    #[tokio::test]
    async fn placeholder_skips_chain() {
        // no expectations: any chain call panics
        let ctx = context(EntryPointVersion::V0_7, MockChainClient::new());
        let wallet = test_wallet();
        let encoder = PaymasterEncoder::new(Arc::new(wallet.clone()));

        let auth = encoder.authorize(&ctx, &v07_op(), SponsorshipMode::Native, false).await.unwrap();
        assert_eq!(auth.paymaster, Address::repeat_byte(0x01));
        assert_eq!(auth.verification_gas_limit, U256::from(40_000));
        assert_eq!(auth.post_op_gas_limit, U256::from(20_000));
        assert_eq!(auth.data.len(), 64 + 65);

        let (window, signature) = unpack_split(&auth.data).unwrap();
        assert_eq!(window.valid_until - window.valid_after, 7200);
        let signature = ethers::types::Signature::try_from(signature.as_ref()).unwrap();
        assert_eq!(signature.recover(hash_message(PLACEHOLDER_MESSAGE)).unwrap(), wallet.account());
    }

    #[tokio::test]
    async fn real_signature_signs_paymaster_hash() {
        let hash = H256::repeat_byte(0x42);
        let mut chain = MockChainClient::new();
        chain
            .expect_paymaster_hash()
            .with(function(|req: &PaymasterHashRequest| {
                let UserOperationVariant::V0_6(op) = &req.user_op else { return false };
                req.paymaster == Address::repeat_byte(0x01)
                    && req.token_terms.is_none()
                    && req.valid_until - req.valid_after == 7200
                    && op.paymaster_and_data.as_ref() == Address::repeat_byte(0x01).as_bytes()
            }))
            .times(1)
            .returning(move |_| Ok(hash));
        let ctx = context(EntryPointVersion::V0_6, chain);
        let wallet = test_wallet();
        let encoder = PaymasterEncoder::new(Arc::new(wallet.clone()));

        let auth = encoder.authorize(&ctx, &v06_op(), SponsorshipMode::Native, true).await.unwrap();
        let decoded = unpack_legacy(&auth.paymaster_and_data()).unwrap();
        assert_eq!(decoded.paymaster, Address::repeat_byte(0x01));
        assert_eq!(decoded.fee_token, Address::zero());
        assert_eq!(decoded.exchange_rate, U256::zero());
        let signature = ethers::types::Signature::try_from(decoded.signature.as_ref()).unwrap();
        assert_eq!(signature.recover(hash_message(hash.as_bytes())).unwrap(), wallet.account());
    }

    #[tokio::test]
    async fn token_terms_embedded_in_legacy_blob() {
        let mut chain = MockChainClient::new();
        chain
            .expect_paymaster_hash()
            .with(function(|req: &PaymasterHashRequest| {
                req.token_terms
                    == Some(TokenTerms {
                        token: Address::repeat_byte(0x0c),
                        exchange_rate: U256::from(4_000_000_000u64),
                    })
            }))
            .returning(|_| Ok(H256::zero()));
        let ctx = context(EntryPointVersion::V0_6, chain);
        let encoder = PaymasterEncoder::new(Arc::new(test_wallet()));

        let auth = encoder.authorize(&ctx, &v06_op(), SponsorshipMode::Erc20, true).await.unwrap();
        let decoded = unpack_legacy(&auth.paymaster_and_data()).unwrap();
        assert_eq!(decoded.paymaster, Address::repeat_byte(0x02));
        assert_eq!(decoded.fee_token, Address::repeat_byte(0x0c));
        assert_eq!(decoded.exchange_rate, U256::from(4_000_000_000u64));
    }

    #[tokio::test]
    async fn hash_failure_maps_to_hash_error() {
        let mut chain = MockChainClient::new();
        chain.expect_paymaster_hash().returning(|_| Err(anyhow::anyhow!("execution reverted")));
        let ctx = context(EntryPointVersion::V0_7, chain);
        let encoder = PaymasterEncoder::new(Arc::new(test_wallet()));

        let err = encoder.authorize(&ctx, &v07_op(), SponsorshipMode::Native, true).await.unwrap_err();
        assert!(matches!(err, PaymasterError::HashComputationFailed(_)));
    }

    #[tokio::test]
    async fn signer_failure_maps_to_signing_error() {
        let mut signer = MockPaymasterSigner::new();
        signer.expect_sign().returning(|_| Err(anyhow::anyhow!("key unavailable")));
        let ctx = context(EntryPointVersion::V0_7, MockChainClient::new());
        let encoder = PaymasterEncoder::new(Arc::new(signer));

        let err = encoder.authorize(&ctx, &v07_op(), SponsorshipMode::Native, false).await.unwrap_err();
        assert!(matches!(err, PaymasterError::SigningFailed(_)));
    }
}
