// src/types.rs
use std::fmt;

use ethers::types::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};

use crate::error::PaymasterError;

/// EntryPoint release a chain is deployed with. Selects the user operation shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryPointVersion {
    #[serde(rename = "v0.6")]
    V0_6,
    #[serde(rename = "v0.7")]
    V0_7,
}

impl fmt::Display for EntryPointVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V0_6 => write!(f, "v0.6"),
            Self::V0_7 => write!(f, "v0.7"),
        }
    }
}

/// Numeric fields arrive as `0x` hex strings, decimal strings or plain JSON integers.
pub mod quantity {
    use ethers::types::U256;
    use serde::{de::Error, Deserialize, Deserializer};
    use serde_json::Value;

    pub fn parse(s: &str) -> Result<U256, String> {
        let s = s.trim();
        if let Some(digits) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            if digits.is_empty() {
                return Err(format!("empty hex quantity {s:?}"));
            }
            U256::from_str_radix(digits, 16).map_err(|e| format!("bad hex quantity {s:?}: {e}"))
        } else {
            if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
                return Err(format!("bad decimal quantity {s:?}"));
            }
            U256::from_dec_str(s).map_err(|e| format!("bad decimal quantity {s:?}: {e}"))
        }
    }

    fn from_value<E: Error>(value: Value) -> Result<Option<U256>, E> {
        match value {
            Value::Null => Ok(None),
            Value::String(s) => parse(&s).map(Some).map_err(E::custom),
            Value::Number(n) => n
                .as_u64()
                .map(|n| Some(U256::from(n)))
                .ok_or_else(|| E::custom(format!("quantity {n} is not an unsigned integer"))),
            other => Err(E::custom(format!("expected quantity, got {other}"))),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<U256, D::Error> {
        from_value(Value::deserialize(d)?)?.ok_or_else(|| D::Error::custom("missing quantity"))
    }

    pub fn option<'de, D: Deserializer<'de>>(d: D) -> Result<Option<U256>, D::Error> {
        from_value(Value::deserialize(d)?)
    }
}

/// User operation as submitted by the caller, before its shape is checked
/// against the chain's EntryPoint version.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcUserOperation {
    pub sender: Address,
    #[serde(deserialize_with = "quantity::deserialize")]
    pub nonce: U256,
    pub call_data: Bytes,
    #[serde(default, deserialize_with = "quantity::option")]
    pub call_gas_limit: Option<U256>,
    #[serde(default, deserialize_with = "quantity::option")]
    pub verification_gas_limit: Option<U256>,
    #[serde(default, deserialize_with = "quantity::option")]
    pub pre_verification_gas: Option<U256>,
    #[serde(deserialize_with = "quantity::deserialize")]
    pub max_fee_per_gas: U256,
    #[serde(deserialize_with = "quantity::deserialize")]
    pub max_priority_fee_per_gas: U256,
    #[serde(default)]
    pub signature: Bytes,
    // v0.6 only
    pub init_code: Option<Bytes>,
    pub paymaster_and_data: Option<Bytes>,
    // v0.7 only
    pub factory: Option<Address>,
    pub factory_data: Option<Bytes>,
    pub paymaster: Option<Address>,
    #[serde(default, deserialize_with = "quantity::option")]
    pub paymaster_verification_gas_limit: Option<U256>,
    #[serde(default, deserialize_with = "quantity::option")]
    pub paymaster_post_op_gas_limit: Option<U256>,
    pub paymaster_data: Option<Bytes>,
}

impl RpcUserOperation {
    /// Checks the operation carries only the fields of `version` and builds the typed form.
    pub fn into_variant(self, version: EntryPointVersion) -> Result<UserOperationVariant, PaymasterError> {
        match version {
            EntryPointVersion::V0_6 => {
                let split_fields = [
                    ("factory", self.factory.is_some()),
                    ("factoryData", self.factory_data.is_some()),
                    ("paymaster", self.paymaster.is_some()),
                    ("paymasterVerificationGasLimit", self.paymaster_verification_gas_limit.is_some()),
                    ("paymasterPostOpGasLimit", self.paymaster_post_op_gas_limit.is_some()),
                    ("paymasterData", self.paymaster_data.is_some()),
                ];
                reject_fields(version, &split_fields)?;

                Ok(UserOperationVariant::V0_6(UserOperationV0_6 {
                    sender: self.sender,
                    nonce: self.nonce,
                    init_code: self.init_code.unwrap_or_default(),
                    call_data: self.call_data,
                    call_gas_limit: self.call_gas_limit.unwrap_or_default(),
                    verification_gas_limit: self.verification_gas_limit.unwrap_or_default(),
                    pre_verification_gas: self.pre_verification_gas.unwrap_or_default(),
                    max_fee_per_gas: self.max_fee_per_gas,
                    max_priority_fee_per_gas: self.max_priority_fee_per_gas,
                    // replaced by the sponsorship
                    paymaster_and_data: Bytes::default(),
                    signature: self.signature,
                }))
            }
            EntryPointVersion::V0_7 => {
                let legacy_fields = [
                    ("initCode", self.init_code.is_some()),
                    ("paymasterAndData", self.paymaster_and_data.is_some()),
                ];
                reject_fields(version, &legacy_fields)?;
                ensure_packable(&[
                    ("callGasLimit", self.call_gas_limit),
                    ("verificationGasLimit", self.verification_gas_limit),
                    ("maxFeePerGas", Some(self.max_fee_per_gas)),
                    ("maxPriorityFeePerGas", Some(self.max_priority_fee_per_gas)),
                    ("paymasterVerificationGasLimit", self.paymaster_verification_gas_limit),
                    ("paymasterPostOpGasLimit", self.paymaster_post_op_gas_limit),
                ])
                .map_err(PaymasterError::InvalidParams)?;
                if self.factory.is_none() && self.factory_data.as_ref().is_some_and(|d| !d.is_empty()) {
                    return Err(PaymasterError::InvalidParams(
                        "factoryData supplied without factory".to_string(),
                    ));
                }

                Ok(UserOperationVariant::V0_7(UserOperationV0_7 {
                    sender: self.sender,
                    nonce: self.nonce,
                    factory: self.factory,
                    factory_data: self.factory.map(|_| self.factory_data.unwrap_or_default()),
                    call_data: self.call_data,
                    call_gas_limit: self.call_gas_limit.unwrap_or_default(),
                    verification_gas_limit: self.verification_gas_limit.unwrap_or_default(),
                    pre_verification_gas: self.pre_verification_gas.unwrap_or_default(),
                    max_fee_per_gas: self.max_fee_per_gas,
                    max_priority_fee_per_gas: self.max_priority_fee_per_gas,
                    paymaster: None,
                    paymaster_verification_gas_limit: self.paymaster_verification_gas_limit.unwrap_or_default(),
                    paymaster_post_op_gas_limit: self.paymaster_post_op_gas_limit.unwrap_or_default(),
                    paymaster_data: Bytes::default(),
                    signature: self.signature,
                }))
            }
        }
    }
}

fn reject_fields(version: EntryPointVersion, fields: &[(&str, bool)]) -> Result<(), PaymasterError> {
    let present: Vec<&str> = fields.iter().filter(|(_, set)| *set).map(|(name, _)| *name).collect();
    if present.is_empty() {
        Ok(())
    } else {
        Err(PaymasterError::InvalidParams(format!(
            "fields {} are not valid for EntryPoint {version}",
            present.join(", ")
        )))
    }
}

/// EntryPoint v0.6 user operation. Deployment and paymaster data are single blobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationV0_6 {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

/// EntryPoint v0.7 user operation with split factory and paymaster fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationV0_7 {
    pub sender: Address,
    pub nonce: U256,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub factory: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub factory_data: Option<Bytes>,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paymaster: Option<Address>,
    pub paymaster_verification_gas_limit: U256,
    pub paymaster_post_op_gas_limit: U256,
    pub paymaster_data: Bytes,
    pub signature: Bytes,
}

impl UserOperationV0_7 {
    /// `factory ‖ factoryData`, empty when no deployment is requested.
    pub fn init_code(&self) -> Bytes {
        match self.factory {
            Some(factory) => {
                let mut init_code = factory.as_bytes().to_vec();
                init_code.extend_from_slice(self.factory_data.as_deref().unwrap_or_default());
                init_code.into()
            }
            None => Bytes::default(),
        }
    }

    /// `verificationGasLimit ‖ callGasLimit` as two big-endian 128-bit halves.
    pub fn account_gas_limits(&self) -> [u8; 32] {
        concat_128(self.verification_gas_limit, self.call_gas_limit)
    }

    /// `maxPriorityFeePerGas ‖ maxFeePerGas` as two big-endian 128-bit halves.
    pub fn gas_fees(&self) -> [u8; 32] {
        concat_128(self.max_priority_fee_per_gas, self.max_fee_per_gas)
    }

    /// `paymaster ‖ uint128 verificationGas ‖ uint128 postOpGas ‖ paymasterData`.
    pub fn paymaster_and_data(&self) -> Bytes {
        match self.paymaster {
            Some(paymaster) => {
                let mut data = paymaster.as_bytes().to_vec();
                data.extend_from_slice(&u128_be(self.paymaster_verification_gas_limit));
                data.extend_from_slice(&u128_be(self.paymaster_post_op_gas_limit));
                data.extend_from_slice(&self.paymaster_data);
                data.into()
            }
            None => Bytes::default(),
        }
    }
}

/// Checks fields packed into 128-bit halves of the v0.7 operation fit in 128 bits.
pub fn ensure_packable(fields: &[(&str, Option<U256>)]) -> Result<(), String> {
    match fields.iter().find(|(_, value)| value.is_some_and(|v| v.bits() > 128)) {
        Some((name, _)) => Err(format!("{name} does not fit in 128 bits")),
        None => Ok(()),
    }
}

fn u128_be(value: U256) -> [u8; 16] {
    value.low_u128().to_be_bytes()
}

fn concat_128(high: U256, low: U256) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[..16].copy_from_slice(&u128_be(high));
    out[16..].copy_from_slice(&u128_be(low));
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum UserOperationVariant {
    V0_6(UserOperationV0_6),
    V0_7(UserOperationV0_7),
}

impl UserOperationVariant {
    pub fn version(&self) -> EntryPointVersion {
        match self {
            Self::V0_6(_) => EntryPointVersion::V0_6,
            Self::V0_7(_) => EntryPointVersion::V0_7,
        }
    }

    pub fn sender(&self) -> Address {
        match self {
            Self::V0_6(op) => op.sender,
            Self::V0_7(op) => op.sender,
        }
    }

    pub fn max_fee_per_gas(&self) -> U256 {
        match self {
            Self::V0_6(op) => op.max_fee_per_gas,
            Self::V0_7(op) => op.max_fee_per_gas,
        }
    }

    /// Current gas limits carried by the operation. Paymaster limits are zero on v0.6.
    pub fn gas_limits(&self) -> GasLimits {
        match self {
            Self::V0_6(op) => GasLimits {
                call_gas_limit: op.call_gas_limit,
                verification_gas_limit: op.verification_gas_limit,
                pre_verification_gas: op.pre_verification_gas,
                paymaster_verification_gas_limit: None,
                paymaster_post_op_gas_limit: None,
            },
            Self::V0_7(op) => GasLimits {
                call_gas_limit: op.call_gas_limit,
                verification_gas_limit: op.verification_gas_limit,
                pre_verification_gas: op.pre_verification_gas,
                paymaster_verification_gas_limit: Some(op.paymaster_verification_gas_limit),
                paymaster_post_op_gas_limit: Some(op.paymaster_post_op_gas_limit),
            },
        }
    }

    pub fn apply_gas_limits(&mut self, limits: &GasLimits) {
        match self {
            Self::V0_6(op) => {
                op.call_gas_limit = limits.call_gas_limit;
                op.verification_gas_limit = limits.verification_gas_limit;
                op.pre_verification_gas = limits.pre_verification_gas;
            }
            Self::V0_7(op) => {
                op.call_gas_limit = limits.call_gas_limit;
                op.verification_gas_limit = limits.verification_gas_limit;
                op.pre_verification_gas = limits.pre_verification_gas;
                if let Some(gas) = limits.paymaster_verification_gas_limit {
                    op.paymaster_verification_gas_limit = gas;
                }
                if let Some(gas) = limits.paymaster_post_op_gas_limit {
                    op.paymaster_post_op_gas_limit = gas;
                }
            }
        }
    }

    pub fn apply_authorization(&mut self, auth: &PaymasterAuthorization) {
        match self {
            Self::V0_6(op) => op.paymaster_and_data = auth.paymaster_and_data(),
            Self::V0_7(op) => {
                op.paymaster = Some(auth.paymaster);
                op.paymaster_verification_gas_limit = auth.verification_gas_limit;
                op.paymaster_post_op_gas_limit = auth.post_op_gas_limit;
                op.paymaster_data = auth.data.clone();
            }
        }
    }

    /// Final gas and paymaster fields returned to the caller.
    pub fn sponsorship_result(&self) -> SponsorshipResult {
        match self {
            Self::V0_6(op) => SponsorshipResult::V0_6(SponsoredFieldsV0_6 {
                call_gas_limit: op.call_gas_limit,
                verification_gas_limit: op.verification_gas_limit,
                pre_verification_gas: op.pre_verification_gas,
                paymaster_and_data: op.paymaster_and_data.clone(),
            }),
            Self::V0_7(op) => SponsorshipResult::V0_7(SponsoredFieldsV0_7 {
                call_gas_limit: op.call_gas_limit,
                verification_gas_limit: op.verification_gas_limit,
                pre_verification_gas: op.pre_verification_gas,
                paymaster: op.paymaster.unwrap_or_default(),
                paymaster_verification_gas_limit: op.paymaster_verification_gas_limit,
                paymaster_post_op_gas_limit: op.paymaster_post_op_gas_limit,
                paymaster_data: op.paymaster_data.clone(),
            }),
        }
    }
}

/// Gas limits reported by the bundler. The paymaster pair is only present for v0.7.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasLimits {
    #[serde(deserialize_with = "quantity::deserialize")]
    pub call_gas_limit: U256,
    #[serde(deserialize_with = "quantity::deserialize")]
    pub verification_gas_limit: U256,
    #[serde(deserialize_with = "quantity::deserialize")]
    pub pre_verification_gas: U256,
    #[serde(default, deserialize_with = "quantity::option", skip_serializing_if = "Option::is_none")]
    pub paymaster_verification_gas_limit: Option<U256>,
    #[serde(default, deserialize_with = "quantity::option", skip_serializing_if = "Option::is_none")]
    pub paymaster_post_op_gas_limit: Option<U256>,
}

/// Who ends up paying the sponsored gas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum SponsorshipMode {
    /// The paymaster pays in the chain's native coin.
    #[serde(rename = "ether")]
    Native,
    /// The sender pays the paymaster back in the chain's fee token.
    #[serde(rename = "erc20Token")]
    Erc20,
}

impl fmt::Display for SponsorshipMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native => write!(f, "ether"),
            Self::Erc20 => write!(f, "erc20Token"),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SponsorshipContext {
    #[serde(rename = "type")]
    pub mode: SponsorshipMode,
}

#[derive(Debug, Clone)]
pub struct SponsorshipRequest {
    pub user_op: RpcUserOperation,
    pub paymaster_hint: Address,
    pub mode: SponsorshipMode,
}

impl SponsorshipRequest {
    /// Parses `[userOperation, paymasterAddress, { type }]`.
    pub fn from_params(params: serde_json::Value) -> Result<Self, PaymasterError> {
        let (user_op, paymaster_hint, context): (RpcUserOperation, Address, SponsorshipContext) =
            serde_json::from_value(params).map_err(|e| PaymasterError::InvalidParams(e.to_string()))?;
        Ok(Self { user_op, paymaster_hint, mode: context.mode })
    }
}

/// Signed permission for a paymaster to cover an operation's gas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymasterAuthorization {
    pub paymaster: Address,
    pub verification_gas_limit: U256,
    pub post_op_gas_limit: U256,
    /// Validity window, optional token terms and the signature.
    pub data: Bytes,
}

impl PaymasterAuthorization {
    /// v0.6 single-blob form: `paymaster ‖ data`.
    pub fn paymaster_and_data(&self) -> Bytes {
        let mut out = self.paymaster.as_bytes().to_vec();
        out.extend_from_slice(&self.data);
        out.into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SponsoredFieldsV0_6 {
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub paymaster_and_data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SponsoredFieldsV0_7 {
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub paymaster: Address,
    pub paymaster_verification_gas_limit: U256,
    pub paymaster_post_op_gas_limit: U256,
    pub paymaster_data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum SponsorshipResult {
    V0_6(SponsoredFieldsV0_6),
    V0_7(SponsoredFieldsV0_7),
}
