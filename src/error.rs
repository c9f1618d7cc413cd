// src/error.rs
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PaymasterError {
    #[error("Invalid JSON-RPC request")]
    InvalidRequest,

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Method not found")]
    UnknownMethod(String),

    #[error("Unsupported chain: {0}")]
    UnknownChain(String),

    #[error("Sponsorship mode not available on chain {chain_id}: {mode}")]
    UnsupportedMode { chain_id: u64, mode: String },

    #[error("Gas estimation failed: {0}")]
    EstimationFailed(String),

    #[error("Paymaster hash computation failed: {0}")]
    HashComputationFailed(String),

    #[error("Signing failed: {0}")]
    SigningFailed(String),

    #[error("Chain read failed: {0}")]
    ChainReadFailed(String),

    #[error("Paymaster not approved!")]
    PaymasterNotApproved,

    #[error("Insufficient token balance for gas!")]
    InsufficientTokenBalance,

    #[error("Request deadline of {0}s exceeded")]
    Timeout(u64),
}

/// How an error surfaces to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed envelope or unknown method, answered with a normal response.
    Protocol,
    /// The caller must change something before retrying.
    Rejected,
    /// An upstream dependency failed. Details stay in the server log.
    Internal,
}

impl PaymasterError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidRequest | Self::UnknownMethod(_) => ErrorClass::Protocol,
            Self::InvalidParams(_)
            | Self::UnknownChain(_)
            | Self::UnsupportedMode { .. }
            | Self::PaymasterNotApproved
            | Self::InsufficientTokenBalance => ErrorClass::Rejected,
            Self::EstimationFailed(_)
            | Self::HashComputationFailed(_)
            | Self::SigningFailed(_)
            | Self::ChainReadFailed(_)
            | Self::Timeout(_) => ErrorClass::Internal,
        }
    }

    /// Message returned in the `error` field of a response.
    pub fn user_message(&self) -> String {
        match self.class() {
            ErrorClass::Internal => "Internal error".to_string(),
            _ => self.to_string(),
        }
    }
}
