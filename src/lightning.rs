//! Lightning Address (LNURL-pay) invoice fetching
//!
//! Payouts settle over Lightning. Recipients are configured as Lightning
//! Addresses (`user@domain`), which resolve to an LNURL-pay endpoint that
//! issues bolt11 invoices for a requested amount.

use crate::errors::{TollGateError, TollGateResult};
use async_trait::async_trait;
use lightning_invoice::Bolt11Invoice;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

/// Issues bolt11 invoices for a Lightning Address and amount.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InvoiceSource: Send + Sync {
    async fn fetch_invoice(
        &self,
        lightning_address: &str,
        amount_sats: u64,
    ) -> TollGateResult<String>;
}

/// First response from the LNURL-pay service.
#[derive(Debug, Deserialize)]
struct LnurlPayResponse {
    callback: String,
    #[serde(rename = "maxSendable")]
    max_sendable: i64, // millisatoshis
    #[serde(rename = "minSendable")]
    min_sendable: i64, // millisatoshis
}

/// Callback response carrying the invoice.
#[derive(Debug, Deserialize)]
struct LnurlInvoiceResponse {
    pr: String,
}

/// LNURL-pay client resolving Lightning Addresses over HTTPS.
pub struct LnurlClient {
    client: reqwest::Client,
}

impl LnurlClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for LnurlClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InvoiceSource for LnurlClient {
    async fn fetch_invoice(
        &self,
        lightning_address: &str,
        amount_sats: u64,
    ) -> TollGateResult<String> {
        let (username, domain) = split_lightning_address(lightning_address)?;
        let well_known_url = format!("https://{}/.well-known/lnurlp/{}", domain, username);

        let pay_response: LnurlPayResponse = self
            .client
            .get(&well_known_url)
            .timeout(Duration::from_secs(10))
            .send()
            .await?
            .json()
            .await?;

        let amount_msat = checked_amount_msat(
            amount_sats,
            pay_response.min_sendable,
            pay_response.max_sendable,
        )?;

        let invoice_response: LnurlInvoiceResponse = self
            .client
            .get(&pay_response.callback)
            .query(&[("amount", amount_msat.to_string())])
            .timeout(Duration::from_secs(10))
            .send()
            .await?
            .json()
            .await?;

        if invoice_response.pr.is_empty() {
            return Err(TollGateError::lightning(
                "received empty invoice from Lightning Address service",
            ));
        }

        // Reject anything that is not a parseable bolt11 invoice before it
        // reaches the mint.
        Bolt11Invoice::from_str(&invoice_response.pr).map_err(|e| {
            TollGateError::lightning(format!(
                "Lightning Address service returned an invalid invoice: {}",
                e
            ))
        })?;

        Ok(invoice_response.pr)
    }
}

fn split_lightning_address(lightning_address: &str) -> TollGateResult<(&str, &str)> {
    match lightning_address.split_once('@') {
        Some((username, domain))
            if !username.is_empty() && !domain.is_empty() && !domain.contains('@') =>
        {
            Ok((username, domain))
        }
        _ => Err(TollGateError::lightning(format!(
            "invalid Lightning Address format (expected user@domain.com): {}",
            lightning_address
        ))),
    }
}

fn checked_amount_msat(amount_sats: u64, min_msat: i64, max_msat: i64) -> TollGateResult<i64> {
    let amount_msat = amount_sats as i64 * 1000;
    if amount_msat < min_msat || amount_msat > max_msat {
        return Err(TollGateError::AmountOutOfRange {
            amount_sats,
            min_msat,
            max_msat,
        });
    }
    Ok(amount_msat)
}
