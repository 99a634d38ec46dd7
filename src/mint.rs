//! Mint connectors
//!
//! `MintConnector` is the seam between the wallet logic and the cdk mint
//! library: one connector per mint URL, created through a factory so the
//! wallet can add mints on demand. The production implementation keeps a
//! cdk wallet with a sqlite database per mint under the configured wallet
//! directory, all derived from one persisted mnemonic seed.

use crate::errors::{TollGateError, TollGateResult};
use async_trait::async_trait;
use bip39::{Language, Mnemonic};
use cdk::amount::Amount;
use cdk::nuts::CurrencyUnit;
use cdk::wallet::{ReceiveOptions, SendOptions, Wallet};
use cdk_sqlite::wallet::WalletSqliteDatabase;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Melt quote as returned by the mint.
#[derive(Debug, Clone)]
pub struct MeltQuoteInfo {
    pub id: String,
    /// Invoice amount in sats.
    pub amount: u64,
    /// Fee reserve the mint demands on top of the amount.
    pub fee_reserve: u64,
}

impl MeltQuoteInfo {
    pub fn total_cost(&self) -> u64 {
        self.amount + self.fee_reserve
    }
}

/// Outcome of an executed melt.
#[derive(Debug, Clone)]
pub struct MeltOutcome {
    pub amount: u64,
    pub fee_paid: u64,
    pub preimage: Option<String>,
}

/// Operations against a single mint.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MintConnector: Send + Sync {
    /// Redeem a serialized token; returns the net amount credited after
    /// mint fees.
    async fn receive(&self, token: &str) -> TollGateResult<u64>;
    /// Produce a fresh, independently spendable token for `amount`.
    async fn send(&self, amount: u64, include_fees: bool) -> TollGateResult<String>;
    async fn balance(&self) -> TollGateResult<u64>;
    async fn melt_quote(&self, invoice: &str) -> TollGateResult<MeltQuoteInfo>;
    async fn melt(&self, quote_id: &str) -> TollGateResult<MeltOutcome>;
}

/// Creates connectors for mint URLs.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MintConnectorFactory: Send + Sync {
    async fn connect(&self, mint_url: &str) -> TollGateResult<Arc<dyn MintConnector>>;
}

#[derive(Debug, Clone)]
struct WalletStoragePaths {
    secrets_file: PathBuf,
    wallets_dir: PathBuf,
}

impl WalletStoragePaths {
    fn new(root_dir: &Path) -> TollGateResult<Self> {
        let wallets_dir = root_dir.join("wallets");
        fs::create_dir_all(root_dir)?;
        fs::create_dir_all(&wallets_dir)?;

        Ok(Self {
            secrets_file: root_dir.join("wallet-secrets.json"),
            wallets_dir,
        })
    }

    fn mint_db_path(&self, mint_url: &str) -> PathBuf {
        let hash = format!("{:x}", Sha256::digest(mint_url.as_bytes()));
        let sanitized: String = mint_url
            .chars()
            .filter(|ch| ch.is_ascii_alphanumeric())
            .collect();
        let prefix: String = sanitized.chars().take(32).collect();
        let stem = if prefix.is_empty() {
            hash[..16].to_string()
        } else {
            format!("{}-{}", prefix.to_lowercase(), &hash[..16])
        };

        self.wallets_dir.join(format!("{}.sqlite", stem))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct StoredSecrets {
    mnemonic: Option<String>,
}

fn load_or_create_seed(paths: &WalletStoragePaths) -> TollGateResult<[u8; 64]> {
    if paths.secrets_file.exists() {
        let data = fs::read(&paths.secrets_file)?;
        let stored: StoredSecrets = serde_json::from_slice(&data)?;
        let phrase = stored
            .mnemonic
            .ok_or_else(|| TollGateError::wallet("Wallet secrets file is empty"))?;
        let mnemonic = Mnemonic::parse_in(Language::English, phrase.trim())
            .map_err(|e| TollGateError::wallet(format!("Invalid mnemonic: {}", e)))?;
        Ok(mnemonic.to_seed(""))
    } else {
        let mnemonic = Mnemonic::generate_in(Language::English, 12)
            .map_err(|e| TollGateError::wallet(format!("Failed to generate mnemonic: {}", e)))?;
        let stored = StoredSecrets {
            mnemonic: Some(mnemonic.to_string()),
        };
        fs::write(&paths.secrets_file, serde_json::to_vec_pretty(&stored)?)?;
        Ok(mnemonic.to_seed(""))
    }
}

/// Factory producing cdk-backed connectors with sqlite persistence.
pub struct CdkConnectorFactory {
    storage: WalletStoragePaths,
    seed: [u8; 64],
}

impl CdkConnectorFactory {
    /// Opens (or initializes) wallet storage under `root_dir`.
    pub fn new(root_dir: &Path) -> TollGateResult<Self> {
        let storage = WalletStoragePaths::new(root_dir)?;
        let seed = load_or_create_seed(&storage)?;
        Ok(Self { storage, seed })
    }
}

#[async_trait]
impl MintConnectorFactory for CdkConnectorFactory {
    async fn connect(&self, mint_url: &str) -> TollGateResult<Arc<dyn MintConnector>> {
        let db_path = self.storage.mint_db_path(mint_url);
        let localstore = WalletSqliteDatabase::new(db_path).await.map_err(|e| {
            TollGateError::wallet(format!(
                "Failed to open wallet database for mint {}: {}",
                mint_url, e
            ))
        })?;

        let wallet = Wallet::new(
            mint_url,
            CurrencyUnit::Sat,
            Arc::new(localstore),
            self.seed,
            None,
        )
        .map_err(|e| {
            TollGateError::wallet(format!(
                "Failed to create wallet for mint {}: {}",
                mint_url, e
            ))
        })?;

        log::info!("Connected wallet for mint: {}", mint_url);
        Ok(Arc::new(CdkMintConnector { wallet }))
    }
}

/// Connector backed by a cdk wallet for one mint.
pub struct CdkMintConnector {
    wallet: Wallet,
}

#[async_trait]
impl MintConnector for CdkMintConnector {
    async fn receive(&self, token: &str) -> TollGateResult<u64> {
        let received = self
            .wallet
            .receive(token, ReceiveOptions::default())
            .await
            .map_err(|e| TollGateError::Redeem(e.to_string()))?;
        Ok(received.into())
    }

    async fn send(&self, amount: u64, include_fees: bool) -> TollGateResult<String> {
        let prepared_send = self
            .wallet
            .prepare_send(
                Amount::from(amount),
                SendOptions {
                    include_fee: include_fees,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| TollGateError::wallet(format!("Failed to prepare send: {}", e)))?;

        let token = prepared_send
            .confirm(None)
            .await
            .map_err(|e| TollGateError::wallet(format!("Failed to confirm send: {}", e)))?;

        Ok(token.to_string())
    }

    async fn balance(&self) -> TollGateResult<u64> {
        let balance = self
            .wallet
            .total_balance()
            .await
            .map_err(|e| TollGateError::wallet(format!("Failed to get balance: {}", e)))?;
        Ok(balance.into())
    }

    async fn melt_quote(&self, invoice: &str) -> TollGateResult<MeltQuoteInfo> {
        let quote = self
            .wallet
            .melt_quote(invoice.to_string(), None)
            .await
            .map_err(|e| TollGateError::wallet(format!("Failed to request melt quote: {}", e)))?;

        Ok(MeltQuoteInfo {
            id: quote.id.clone(),
            amount: quote.amount.into(),
            fee_reserve: quote.fee_reserve.into(),
        })
    }

    async fn melt(&self, quote_id: &str) -> TollGateResult<MeltOutcome> {
        let melted = self
            .wallet
            .melt(quote_id)
            .await
            .map_err(|e| TollGateError::wallet(format!("Failed to melt: {}", e)))?;

        Ok(MeltOutcome {
            amount: melted.amount.into(),
            fee_paid: melted.fee_paid.into(),
            preimage: melted.preimage,
        })
    }
}
