//! Error types for TollGate merchant operations

use thiserror::Error;

pub type TollGateResult<T> = Result<T, TollGateError>;

#[derive(Error, Debug)]
pub enum TollGateError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0} is not a valid MAC address")]
    InvalidMacAddress(String),

    #[error("Invalid cashu token: {0}")]
    InvalidToken(String),

    #[error("Token rejected. Token for mint {0} is not accepted and wallet does not allow swapping of untrusted mints")]
    UntrustedMint(String),

    #[error("Failed to redeem token: {0}")]
    Redeem(String),

    #[error("Cashu wallet error: {0}")]
    Wallet(String),

    #[error("Insufficient funds: need {needed} sats, have {available} sats")]
    InsufficientFunds { needed: u64, available: u64 },

    #[error("Lightning address error: {0}")]
    Lightning(String),

    #[error("amount {amount_sats} sats is outside allowed range ({min_msat}-{max_msat} msats)")]
    AmountOutOfRange {
        amount_sats: u64,
        min_msat: i64,
        max_msat: i64,
    },

    #[error("melt cost exceeds maximum allowed: {cost} > {max_cost}")]
    MeltCostExceeded { cost: u64, max_cost: u64 },

    #[error("failed to melt after {attempts} attempts: {last_error}")]
    MeltExhausted { attempts: u32, last_error: String },

    #[error("Gate control error: {0}")]
    Gate(String),

    #[error("Nostr error: {0}")]
    Nostr(String),
}

impl TollGateError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn wallet(msg: impl Into<String>) -> Self {
        Self::Wallet(msg.into())
    }

    pub fn lightning(msg: impl Into<String>) -> Self {
        Self::Lightning(msg.into())
    }

    pub fn gate(msg: impl Into<String>) -> Self {
        Self::Gate(msg.into())
    }

    pub fn nostr(msg: impl Into<String>) -> Self {
        Self::Nostr(msg.into())
    }
}
