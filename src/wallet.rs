//! Ecash wallet ("TollWallet")
//!
//! The only component allowed to mutate mint balances. Wraps one mint
//! connector per accepted mint, gates inbound tokens on the accepted-mint
//! set, and converts accumulated balance into Lightning payments with a
//! cost-bounded retry loop.

use crate::errors::{TollGateError, TollGateResult};
use crate::lightning::InvoiceSource;
use crate::mint::{MintConnector, MintConnectorFactory};
use crate::retry::{reduce_by_percent, RetryPolicy};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Total attempts for one melt, counting invoice, quote, and melt
/// failures alike.
const MELT_RETRY: RetryPolicy = RetryPolicy::new(10);
/// Cost-exceeded reduction applied to the candidate amount per attempt.
const MELT_REDUCTION_PERCENT: u64 = 5;

/// Wallet operations consumed by the merchant.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EcashWallet: Send + Sync {
    /// Decode and redeem a serialized cashu token, returning the net
    /// credited amount.
    async fn receive(&self, token: &str) -> TollGateResult<u64>;
    /// Produce a fresh spendable token from the balance at `mint_url`.
    async fn send(&self, amount: u64, mint_url: &str, include_fees: bool)
        -> TollGateResult<String>;
    /// Total balance across all mints.
    async fn balance(&self) -> TollGateResult<u64>;
    /// Balance at one mint; unknown mints report 0, not an error.
    async fn balance_by_mint(&self, mint_url: &str) -> TollGateResult<u64>;
    /// URLs of every mint the wallet currently holds a connector for,
    /// including mints added on the fly for swapped tokens.
    async fn mint_urls(&self) -> Vec<String>;
    /// Convert balance at `mint_url` into a Lightning payment to
    /// `lightning_address`, never spending more than `max_cost`.
    async fn melt_to_lightning(
        &self,
        mint_url: &str,
        target_amount: u64,
        max_cost: u64,
        lightning_address: &str,
    ) -> TollGateResult<()>;
}

struct MintHandle {
    connector: Arc<dyn MintConnector>,
    /// Serializes balance-affecting operations for this mint.
    op_lock: Arc<Mutex<()>>,
}

impl MintHandle {
    fn new(connector: Arc<dyn MintConnector>) -> Self {
        Self {
            connector,
            op_lock: Arc::new(Mutex::new(())),
        }
    }
}

/// Cashu wallet holding one connector per mint URL.
pub struct TollWallet {
    mints: RwLock<HashMap<String, MintHandle>>,
    accepted_mints: Vec<String>,
    allow_untrusted_swap: bool,
    factory: Arc<dyn MintConnectorFactory>,
    invoice_source: Arc<dyn InvoiceSource>,
}

impl TollWallet {
    /// Connects a wallet for every accepted mint. At least one accepted
    /// mint is required.
    pub async fn new(
        factory: Arc<dyn MintConnectorFactory>,
        invoice_source: Arc<dyn InvoiceSource>,
        accepted_mints: Vec<String>,
        allow_untrusted_swap: bool,
    ) -> TollGateResult<Self> {
        if accepted_mints.is_empty() {
            return Err(TollGateError::wallet(
                "No mints provided. Wallet requires at least 1 accepted mint, none were provided",
            ));
        }

        let mut mints = HashMap::new();
        for mint_url in &accepted_mints {
            let connector = factory.connect(mint_url).await?;
            mints.insert(mint_url.clone(), MintHandle::new(connector));
        }

        Ok(Self {
            mints: RwLock::new(mints),
            accepted_mints,
            allow_untrusted_swap,
            factory,
            invoice_source,
        })
    }

    fn is_accepted(&self, mint_url: &str) -> bool {
        self.accepted_mints.iter().any(|m| m == mint_url)
    }

    async fn handle_parts(
        &self,
        mint_url: &str,
    ) -> Option<(Arc<dyn MintConnector>, Arc<Mutex<()>>)> {
        let mints = self.mints.read().await;
        mints
            .get(mint_url)
            .map(|h| (Arc::clone(&h.connector), Arc::clone(&h.op_lock)))
    }

    async fn ensure_mint(&self, mint_url: &str) -> TollGateResult<()> {
        if self.mints.read().await.contains_key(mint_url) {
            return Ok(());
        }
        log::info!("Mint {} not found, adding it", mint_url);
        let connector = self.factory.connect(mint_url).await?;
        self.mints
            .write()
            .await
            .insert(mint_url.to_string(), MintHandle::new(connector));
        Ok(())
    }
}

#[async_trait]
impl EcashWallet for TollWallet {
    async fn receive(&self, token: &str) -> TollGateResult<u64> {
        let parsed = cdk::nuts::Token::from_str(token)
            .map_err(|e| TollGateError::InvalidToken(e.to_string()))?;
        let mint_url = parsed
            .mint_url()
            .map_err(|e| TollGateError::InvalidToken(format!("missing mint URL: {}", e)))?
            .to_string();

        if !self.is_accepted(&mint_url) {
            if !self.allow_untrusted_swap {
                return Err(TollGateError::UntrustedMint(mint_url));
            }
            self.ensure_mint(&mint_url).await?;
        }

        let (connector, op_lock) = self
            .handle_parts(&mint_url)
            .await
            .ok_or_else(|| TollGateError::wallet(format!("Mint not found: {}", mint_url)))?;

        let _guard = op_lock.lock().await;
        let credited = connector.receive(token).await?;
        log::info!(
            "Successfully received {} sats from token at mint {}",
            credited,
            mint_url
        );
        Ok(credited)
    }

    async fn send(
        &self,
        amount: u64,
        mint_url: &str,
        include_fees: bool,
    ) -> TollGateResult<String> {
        let (connector, op_lock) = self
            .handle_parts(mint_url)
            .await
            .ok_or_else(|| TollGateError::wallet(format!("Mint not found: {}", mint_url)))?;

        let _guard = op_lock.lock().await;
        let available = connector.balance().await?;
        if available < amount {
            return Err(TollGateError::InsufficientFunds {
                needed: amount,
                available,
            });
        }

        connector.send(amount, include_fees).await
    }

    async fn balance(&self) -> TollGateResult<u64> {
        let connectors: Vec<Arc<dyn MintConnector>> = {
            let mints = self.mints.read().await;
            mints.values().map(|h| Arc::clone(&h.connector)).collect()
        };

        let mut total = 0;
        for connector in connectors {
            total += connector.balance().await?;
        }
        Ok(total)
    }

    async fn balance_by_mint(&self, mint_url: &str) -> TollGateResult<u64> {
        match self.handle_parts(mint_url).await {
            Some((connector, _)) => connector.balance().await,
            None => Ok(0),
        }
    }

    async fn mint_urls(&self) -> Vec<String> {
        self.mints.read().await.keys().cloned().collect()
    }

    async fn melt_to_lightning(
        &self,
        mint_url: &str,
        target_amount: u64,
        max_cost: u64,
        lightning_address: &str,
    ) -> TollGateResult<()> {
        log::info!(
            "Attempting to melt {} sats at {} to {} with max cost {} sats",
            target_amount,
            mint_url,
            lightning_address,
            max_cost
        );

        // Resolving the mint up front: an unknown mint must never fall
        // through into the retry loop.
        let (connector, op_lock) = self
            .handle_parts(mint_url)
            .await
            .ok_or_else(|| TollGateError::wallet(format!("Mint not found: {}", mint_url)))?;

        let mut current_amount = target_amount;
        let mut last_error: Option<TollGateError> = None;

        for attempt in MELT_RETRY.attempts() {
            log::debug!("Attempt {}: trying to melt {} sats", attempt, current_amount);

            let invoice = match self
                .invoice_source
                .fetch_invoice(lightning_address, current_amount)
                .await
            {
                Ok(invoice) => invoice,
                Err(e) => {
                    log::warn!("Error getting invoice from {}: {}", lightning_address, e);
                    last_error = Some(e);
                    continue;
                }
            };

            let quote = match connector.melt_quote(&invoice).await {
                Ok(quote) => quote,
                Err(e) => {
                    log::warn!("Error requesting melt quote from {}: {}", mint_url, e);
                    last_error = Some(e);
                    continue;
                }
            };

            if quote.total_cost() > max_cost {
                log::warn!(
                    "Melting {} sats to {} costs too much, reducing by {}%",
                    current_amount,
                    lightning_address,
                    MELT_REDUCTION_PERCENT
                );
                last_error = Some(TollGateError::MeltCostExceeded {
                    cost: quote.total_cost(),
                    max_cost,
                });
                current_amount = reduce_by_percent(current_amount, MELT_REDUCTION_PERCENT);
                continue;
            }

            let _guard = op_lock.lock().await;
            match connector.melt(&quote.id).await {
                Ok(outcome) => {
                    log::info!(
                        "Successfully melted {} sats with {} sats in fees",
                        outcome.amount,
                        outcome.fee_paid
                    );
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("Error melting quote {} at {}: {}", quote.id, mint_url, e);
                    last_error = Some(e);
                }
            }
        }

        Err(TollGateError::MeltExhausted {
            attempts: MELT_RETRY.max_attempts(),
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempt was made".to_string()),
        })
    }
}
