//! Operator configuration
//!
//! Loaded once at startup from a JSON file. Misconfiguration that would
//! make the merchant unable to operate (no accepted mints, a zero price,
//! broken profit shares) is rejected here, before any network state is
//! touched; everything past this point treats the config as valid.

use crate::errors::{TollGateError, TollGateResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One accepted ecash mint and its payout thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MintConfig {
    pub url: String,
    /// Reserve kept in the wallet; payouts never draw the tracked balance
    /// below this amount.
    #[serde(default)]
    pub min_balance: u64,
    /// Extra cost (fees) the operator tolerates on a payout, as a percent
    /// of the aimed share amount.
    #[serde(default = "default_balance_tolerance_percent")]
    pub balance_tolerance_percent: u64,
    #[serde(default = "default_payout_interval_seconds")]
    pub payout_interval_seconds: u64,
    /// Balances below this are left to accumulate until a later tick.
    #[serde(default)]
    pub min_payout_amount: u64,
}

fn default_balance_tolerance_percent() -> u64 {
    1
}

fn default_payout_interval_seconds() -> u64 {
    60
}

/// A fractional payout split to one Lightning recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfitShare {
    pub factor: f64,
    pub lightning_address: String,
}

/// Payment announcement ("bragging") settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BraggingConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Which facts to include in the announcement: "amount", "mint",
    /// "duration".
    #[serde(default)]
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Hex or bech32 nostr secret key used to sign the advertisement and
    /// payment announcements.
    pub tollgate_private_key: String,
    pub accepted_mints: Vec<MintConfig>,
    /// Price in sats per minute of access.
    pub price_per_minute: u64,
    #[serde(default)]
    pub profit_shares: Vec<ProfitShare>,
    #[serde(default)]
    pub bragging: BraggingConfig,
    #[serde(default)]
    pub relays: Vec<String>,
    /// Directory holding the wallet seed and per-mint databases.
    #[serde(default = "default_wallet_dir")]
    pub wallet_dir: PathBuf,
    /// Accept tokens from unknown mints by adding a wallet for them on
    /// the fly instead of rejecting the payment.
    #[serde(default)]
    pub allow_untrusted_mints: bool,
}

fn default_wallet_dir() -> PathBuf {
    PathBuf::from("/etc/tollgate")
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> TollGateResult<Self> {
        let data = std::fs::read(path.as_ref())?;
        let config: Config = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> TollGateResult<()> {
        if self.accepted_mints.is_empty() {
            return Err(TollGateError::config(
                "No mints provided. Wallet requires at least 1 accepted mint, none were provided",
            ));
        }
        if self.price_per_minute == 0 {
            return Err(TollGateError::config("price_per_minute must be at least 1"));
        }

        let mut factor_sum = 0.0_f64;
        for share in &self.profit_shares {
            if !(share.factor > 0.0 && share.factor <= 1.0) {
                return Err(TollGateError::config(format!(
                    "profit share factor {} for {} is outside (0, 1]",
                    share.factor, share.lightning_address
                )));
            }
            if !share.lightning_address.contains('@') {
                return Err(TollGateError::config(format!(
                    "invalid lightning address: {}",
                    share.lightning_address
                )));
            }
            factor_sum += share.factor;
        }
        if factor_sum > 1.0 + 1e-9 {
            return Err(TollGateError::config(format!(
                "profit share factors sum to {factor_sum}, which exceeds 1.0"
            )));
        }

        for mint in &self.accepted_mints {
            if mint.payout_interval_seconds == 0 {
                return Err(TollGateError::config(format!(
                    "payout_interval_seconds for mint {} must be at least 1",
                    mint.url
                )));
            }
        }

        Ok(())
    }

    pub fn mint_urls(&self) -> Vec<String> {
        self.accepted_mints.iter().map(|m| m.url.clone()).collect()
    }
}
