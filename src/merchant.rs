//! Session merchant
//!
//! Ties the wallet, the valve, and the announcer together:
//! - sells timed access in exchange for cashu tokens
//! - runs the periodic payout routine that forwards profit over Lightning
//! - serves the signed pricing advertisement shown to clients
//!
//! Every purchase outcome is reported as a [`PurchaseSessionResult`] so the
//! captive portal can render it; failures never panic the merchant.

use crate::bragging::PaymentAnnouncer;
use crate::config::{Config, MintConfig};
use crate::errors::{TollGateError, TollGateResult};
use crate::mac::MacAddress;
use crate::valve::Valve;
use crate::wallet::EcashWallet;
use nostr::{EventBuilder, JsonUtil, Keys, Kind, Tag};
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Kind of the TollGate pricing advertisement event.
const ADVERTISEMENT_KIND: u16 = 21021;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PurchaseStatus {
    Success,
    /// The client sent something we refuse to act on.
    Rejected,
    /// We accepted the request but failed while serving it.
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct PurchaseSessionResult {
    pub status: PurchaseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PurchaseSessionResult {
    fn success() -> Self {
        Self {
            status: PurchaseStatus::Success,
            description: None,
        }
    }

    fn rejected(description: impl Into<String>) -> Self {
        Self {
            status: PurchaseStatus::Rejected,
            description: Some(description.into()),
        }
    }

    fn error(description: impl Into<String>) -> Self {
        Self {
            status: PurchaseStatus::Error,
            description: Some(description.into()),
        }
    }
}

pub struct Merchant {
    config: Config,
    wallet: Arc<dyn EcashWallet>,
    valve: Arc<Valve>,
    announcer: Option<Arc<dyn PaymentAnnouncer>>,
    advertisement: String,
}

impl Merchant {
    /// The announcer is optional; pass `None` when bragging is disabled.
    pub fn new(
        config: Config,
        wallet: Arc<dyn EcashWallet>,
        valve: Arc<Valve>,
        announcer: Option<Arc<dyn PaymentAnnouncer>>,
    ) -> TollGateResult<Self> {
        config.validate()?;
        let advertisement = build_advertisement(&config)?;

        log::info!(
            "Merchant ready: {} accepted mint(s), {} sat/min",
            config.accepted_mints.len(),
            config.price_per_minute
        );

        Ok(Self {
            config,
            wallet,
            valve,
            announcer,
            advertisement,
        })
    }

    /// The precomputed signed advertisement, as JSON.
    pub fn advertisement(&self) -> &str {
        &self.advertisement
    }

    /// Redeems a payment token and opens the gate for the paying device.
    pub async fn purchase_session(
        &self,
        payment_token: &str,
        mac_address: &str,
    ) -> PurchaseSessionResult {
        let mac = match MacAddress::from_str(mac_address) {
            Ok(mac) => mac,
            Err(e) => return PurchaseSessionResult::rejected(e.to_string()),
        };

        let credited = match self.wallet.receive(payment_token).await {
            Ok(credited) => credited,
            Err(TollGateError::InvalidToken(e)) => {
                log::info!("Rejecting payment from {}: invalid token: {}", mac, e);
                return PurchaseSessionResult::rejected("Invalid cashu token");
            }
            Err(TollGateError::UntrustedMint(mint)) => {
                log::info!("Rejecting payment from {}: untrusted mint {}", mac, mint);
                return PurchaseSessionResult::rejected(format!(
                    "Mint {} is not accepted here",
                    mint
                ));
            }
            Err(e) => {
                log::error!("Error processing payment from {}: {}", mac, e);
                return PurchaseSessionResult::error("Error processing payment");
            }
        };

        let allotted_minutes = (credited / self.config.price_per_minute).max(1);
        let duration_seconds = allotted_minutes * 60;
        log::info!(
            "Calculated minutes: {} (from value {})",
            allotted_minutes,
            credited
        );

        if let Err(e) = self.valve.open_gate(&mac, duration_seconds as i64).await {
            log::error!("Error opening gate for MAC {}: {}", mac, e);
            return PurchaseSessionResult::error(format!("Error while opening gate for {}", mac));
        }

        if let Some(announcer) = &self.announcer {
            if let Err(e) = announcer.announce(credited, duration_seconds).await {
                log::warn!("Error while announcing payment: {}", e);
            }
        }

        log::info!("Access granted to {} for {} minutes", mac, allotted_minutes);
        PurchaseSessionResult::success()
    }

    /// Spawns one payout loop per accepted mint, plus a sweep loop for
    /// mints added on the fly when untrusted tokens are allowed. The
    /// returned handles run until aborted.
    pub fn start_payout_routine(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        log::info!("Starting payout routine");

        let mut handles: Vec<JoinHandle<()>> = self
            .config
            .accepted_mints
            .iter()
            .cloned()
            .map(|mint| {
                let merchant = Arc::clone(self);
                tokio::spawn(async move {
                    let mut interval =
                        tokio::time::interval(Duration::from_secs(mint.payout_interval_seconds));
                    // The first tick completes immediately; skip it so the
                    // first payout check happens a full interval after start.
                    interval.tick().await;
                    loop {
                        interval.tick().await;
                        merchant.process_payout(&mint).await;
                    }
                })
            })
            .collect();

        if self.config.allow_untrusted_mints {
            let merchant = Arc::clone(self);
            let interval_seconds = self.config.accepted_mints[0].payout_interval_seconds;
            handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(interval_seconds));
                interval.tick().await;
                loop {
                    interval.tick().await;
                    merchant.sweep_dynamic_mints().await;
                }
            }));
        }

        handles
    }

    /// Drains mints the wallet added for swapped untrusted tokens. They
    /// have no operator-configured entry, so value left there would
    /// otherwise be unreachable by any payout loop.
    async fn sweep_dynamic_mints(&self) {
        for url in self.wallet.mint_urls().await {
            if self.config.accepted_mints.iter().any(|m| m.url == url) {
                continue;
            }
            let mint = self.dynamic_mint_config(url);
            self.process_payout(&mint).await;
        }
    }

    /// Payout settings for a mint added at runtime: no reserve is kept
    /// there, thresholds follow the first configured mint.
    fn dynamic_mint_config(&self, url: String) -> MintConfig {
        let base = &self.config.accepted_mints[0];
        MintConfig {
            url,
            min_balance: 0,
            balance_tolerance_percent: base.balance_tolerance_percent,
            payout_interval_seconds: base.payout_interval_seconds,
            min_payout_amount: base.min_payout_amount,
        }
    }

    /// One payout tick for one mint.
    async fn process_payout(&self, mint: &MintConfig) {
        let balance = match self.wallet.balance_by_mint(&mint.url).await {
            Ok(balance) => balance,
            Err(e) => {
                log::error!("Failed to read balance for mint {}: {}", mint.url, e);
                return;
            }
        };

        if balance < mint.min_payout_amount {
            log::debug!(
                "Skipping payout {}, balance {} does not meet threshold of {}",
                mint.url,
                balance,
                mint.min_payout_amount
            );
            return;
        }

        let aimed_payment_amount = balance.saturating_sub(mint.min_balance);
        if aimed_payment_amount == 0 {
            return;
        }

        // Rounded shares may overshoot; cap each one by what is left of
        // the aimed amount so the reserve is never touched.
        let mut remaining = aimed_payment_amount;
        for share in &self.config.profit_shares {
            let amount =
                ((aimed_payment_amount as f64 * share.factor).round() as u64).min(remaining);
            if amount == 0 {
                continue;
            }
            self.payout_share(mint, amount, &share.lightning_address)
                .await;
            remaining -= amount;
        }

        log::info!("Payout completed for mint {}", mint.url);
    }

    async fn payout_share(&self, mint: &MintConfig, amount: u64, lightning_address: &str) {
        let max_cost = amount + amount * mint.balance_tolerance_percent / 100;
        log::info!(
            "Processing payout for mint {}: aiming for {} sats with max cost {} sats",
            mint.url,
            amount,
            max_cost
        );

        if let Err(e) = self
            .wallet
            .melt_to_lightning(&mint.url, amount, max_cost, lightning_address)
            .await
        {
            log::error!(
                "Error during payout for mint {}. Error melting to lightning. Skipping... {}",
                mint.url,
                e
            );
        }
    }
}

/// Builds and signs the pricing advertisement, returning it as JSON.
pub fn build_advertisement(config: &Config) -> TollGateResult<String> {
    let keys = Keys::parse(&config.tollgate_private_key)
        .map_err(|e| TollGateError::nostr(format!("Invalid tollgate private key: {}", e)))?;

    let mut raw_tags: Vec<Vec<String>> = vec![
        vec!["metric".to_string(), "milliseconds".to_string()],
        vec!["step_size".to_string(), "60000".to_string()],
        vec![
            "price_per_step".to_string(),
            config.price_per_minute.to_string(),
            "sat".to_string(),
        ],
        vec![
            "tips".to_string(),
            "1".to_string(),
            "2".to_string(),
            "3".to_string(),
        ],
    ];
    for mint in &config.accepted_mints {
        raw_tags.push(vec!["mint".to_string(), mint.url.clone()]);
    }

    let mut tags: Vec<Tag> = Vec::with_capacity(raw_tags.len());
    for raw in raw_tags {
        tags.push(Tag::parse(raw).map_err(|e| TollGateError::nostr(e.to_string()))?);
    }

    let event = EventBuilder::new(Kind::Custom(ADVERTISEMENT_KIND), "")
        .tags(tags)
        .sign_with_keys(&keys)
        .map_err(|e| TollGateError::nostr(format!("Error signing advertisement event: {}", e)))?;

    Ok(event.as_json())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bragging::MockPaymentAnnouncer;
    use crate::config::tests::test_config;
    use crate::valve::MockGateBackend;
    use crate::wallet::MockEcashWallet;
    use nostr::Event;

    const MAC: &str = "00:1A:2B:3C:4D:5E";

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    fn idle_backend() -> MockGateBackend {
        let mut backend = MockGateBackend::new();
        backend.expect_authorize().times(0);
        backend.expect_deauthorize().times(0);
        backend
    }

    fn merchant_with(
        config: Config,
        wallet: MockEcashWallet,
        backend: MockGateBackend,
        announcer: Option<Arc<dyn PaymentAnnouncer>>,
    ) -> (Arc<Merchant>, Arc<Valve>) {
        let valve = Arc::new(Valve::new(Arc::new(backend)));
        let merchant = Merchant::new(config, Arc::new(wallet), Arc::clone(&valve), announcer)
            .map(Arc::new)
            .unwrap();
        (merchant, valve)
    }

    #[tokio::test]
    async fn test_invalid_mac_is_rejected_before_touching_the_wallet() {
        let mut wallet = MockEcashWallet::new();
        wallet.expect_receive().times(0);
        let (merchant, _) = merchant_with(test_config(), wallet, idle_backend(), None);

        let result = merchant.purchase_session("cashuA...", "not-a-mac").await;
        assert_eq!(result.status, PurchaseStatus::Rejected);
        assert!(result
            .description
            .unwrap()
            .contains("is not a valid MAC address"));
    }

    #[tokio::test]
    async fn test_invalid_token_is_rejected() {
        let mut wallet = MockEcashWallet::new();
        wallet
            .expect_receive()
            .times(1)
            .returning(|_| Err(TollGateError::InvalidToken("bad prefix".to_string())));
        let (merchant, _) = merchant_with(test_config(), wallet, idle_backend(), None);

        let result = merchant.purchase_session("garbage", MAC).await;
        assert_eq!(result.status, PurchaseStatus::Rejected);
        assert_eq!(result.description.unwrap(), "Invalid cashu token");
    }

    #[tokio::test]
    async fn test_untrusted_mint_is_rejected() {
        let mut wallet = MockEcashWallet::new();
        wallet.expect_receive().times(1).returning(|_| {
            Err(TollGateError::UntrustedMint(
                "https://rogue.example.com".to_string(),
            ))
        });
        let (merchant, _) = merchant_with(test_config(), wallet, idle_backend(), None);

        let result = merchant.purchase_session("cashuA...", MAC).await;
        assert_eq!(result.status, PurchaseStatus::Rejected);
        assert!(result.description.unwrap().contains("rogue.example.com"));
    }

    #[tokio::test]
    async fn test_redeem_failure_is_an_error_not_a_rejection() {
        let mut wallet = MockEcashWallet::new();
        wallet
            .expect_receive()
            .times(1)
            .returning(|_| Err(TollGateError::Redeem("proofs already spent".to_string())));
        let (merchant, _) = merchant_with(test_config(), wallet, idle_backend(), None);

        let result = merchant.purchase_session("cashuA...", MAC).await;
        assert_eq!(result.status, PurchaseStatus::Error);
        assert_eq!(result.description.unwrap(), "Error processing payment");
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_purchase_grants_paid_duration() {
        let mut wallet = MockEcashWallet::new();
        wallet.expect_receive().times(1).returning(|_| Ok(150));

        let mut backend = MockGateBackend::new();
        backend.expect_authorize().times(1).returning(|_| Ok(()));
        backend.expect_deauthorize().times(1).returning(|_| Ok(()));

        // 150 sats at 1 sat/min buys 150 minutes.
        let (merchant, valve) = merchant_with(test_config(), wallet, backend, None);
        let result = merchant.purchase_session("cashuA...", MAC).await;
        assert_eq!(result.status, PurchaseStatus::Success);
        assert!(result.description.is_none());
        assert_eq!(valve.active_timers().await, 1);
        settle().await;

        tokio::time::advance(Duration::from_secs(8999)).await;
        settle().await;
        assert_eq!(valve.active_timers().await, 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(valve.active_timers().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_payment_still_buys_one_minute() {
        let mut config = test_config();
        config.price_per_minute = 5;

        let mut wallet = MockEcashWallet::new();
        wallet.expect_receive().times(1).returning(|_| Ok(3));

        let mut backend = MockGateBackend::new();
        backend.expect_authorize().times(1).returning(|_| Ok(()));
        backend.expect_deauthorize().times(1).returning(|_| Ok(()));

        let (merchant, valve) = merchant_with(config, wallet, backend, None);
        let result = merchant.purchase_session("cashuA...", MAC).await;
        assert_eq!(result.status, PurchaseStatus::Success);
        settle().await;

        tokio::time::advance(Duration::from_secs(59)).await;
        settle().await;
        assert_eq!(valve.active_timers().await, 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(valve.active_timers().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_is_floored_per_whole_minute() {
        let mut config = test_config();
        config.price_per_minute = 5;

        let mut wallet = MockEcashWallet::new();
        wallet.expect_receive().times(1).returning(|_| Ok(12));

        let mut backend = MockGateBackend::new();
        backend.expect_authorize().times(1).returning(|_| Ok(()));
        backend.expect_deauthorize().times(1).returning(|_| Ok(()));

        // 12 sats at 5 sat/min buys exactly 2 whole minutes.
        let (merchant, valve) = merchant_with(config, wallet, backend, None);
        let result = merchant.purchase_session("cashuA...", MAC).await;
        assert_eq!(result.status, PurchaseStatus::Success);
        settle().await;

        tokio::time::advance(Duration::from_secs(119)).await;
        settle().await;
        assert_eq!(valve.active_timers().await, 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(valve.active_timers().await, 0);
    }

    #[tokio::test]
    async fn test_gate_failure_is_an_error() {
        let mut wallet = MockEcashWallet::new();
        wallet.expect_receive().times(1).returning(|_| Ok(60));

        let mut backend = MockGateBackend::new();
        backend
            .expect_authorize()
            .times(1)
            .returning(|_| Err(TollGateError::gate("ndsctl exited with status 1")));
        backend.expect_deauthorize().times(0);

        let (merchant, valve) = merchant_with(test_config(), wallet, backend, None);
        let result = merchant.purchase_session("cashuA...", MAC).await;
        assert_eq!(result.status, PurchaseStatus::Error);
        assert!(result.description.unwrap().contains(MAC));
        assert_eq!(valve.active_timers().await, 0);
    }

    #[tokio::test]
    async fn test_announcer_failure_does_not_fail_the_purchase() {
        let mut wallet = MockEcashWallet::new();
        wallet.expect_receive().times(1).returning(|_| Ok(150));

        let mut backend = MockGateBackend::new();
        backend.expect_authorize().times(1).returning(|_| Ok(()));

        let mut announcer = MockPaymentAnnouncer::new();
        announcer
            .expect_announce()
            .withf(|amount, duration| *amount == 150 && *duration == 9000)
            .times(1)
            .returning(|_, _| Err(TollGateError::nostr("all relays unreachable")));

        let (merchant, _valve) =
            merchant_with(test_config(), wallet, backend, Some(Arc::new(announcer)));
        let result = merchant.purchase_session("cashuA...", MAC).await;
        assert_eq!(result.status, PurchaseStatus::Success);
    }

    #[tokio::test]
    async fn test_payout_splits_between_shares() {
        let mut config = test_config();
        config.accepted_mints[0].min_balance = 200;
        config.accepted_mints[0].min_payout_amount = 500;
        config.accepted_mints[0].balance_tolerance_percent = 2;
        config.profit_shares = vec![
            crate::config::ProfitShare {
                factor: 0.7,
                lightning_address: "a@example.com".to_string(),
            },
            crate::config::ProfitShare {
                factor: 0.3,
                lightning_address: "b@example.com".to_string(),
            },
        ];

        let mut wallet = MockEcashWallet::new();
        wallet
            .expect_balance_by_mint()
            .times(1)
            .returning(|_| Ok(1000));
        // aimed = 1000 - 200 = 800; shares 560 and 240.
        wallet
            .expect_melt_to_lightning()
            .withf(|_, amount, max_cost, addr| {
                *amount == 560 && *max_cost == 571 && addr == "a@example.com"
            })
            .times(1)
            .returning(|_, _, _, _| {
                Err(TollGateError::MeltExhausted {
                    attempts: 10,
                    last_error: "mint unreachable".to_string(),
                })
            });
        // A failed first share never blocks the second.
        wallet
            .expect_melt_to_lightning()
            .withf(|_, amount, max_cost, addr| {
                *amount == 240 && *max_cost == 244 && addr == "b@example.com"
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let mint = config.accepted_mints[0].clone();
        let (merchant, _) = merchant_with(config, wallet, idle_backend(), None);
        merchant.process_payout(&mint).await;
    }

    #[tokio::test]
    async fn test_rounded_shares_never_exceed_the_aimed_amount() {
        let mut config = test_config();
        config.accepted_mints[0].min_balance = 0;
        config.accepted_mints[0].min_payout_amount = 0;
        config.profit_shares = vec![
            crate::config::ProfitShare {
                factor: 0.5,
                lightning_address: "a@example.com".to_string(),
            },
            crate::config::ProfitShare {
                factor: 0.5,
                lightning_address: "b@example.com".to_string(),
            },
        ];

        let mut wallet = MockEcashWallet::new();
        wallet
            .expect_balance_by_mint()
            .times(1)
            .returning(|_| Ok(3));
        // aimed = 3; both shares round to 2, so the second is capped at
        // the 1 sat that is left.
        wallet
            .expect_melt_to_lightning()
            .withf(|_, amount, _, addr| *amount == 2 && addr == "a@example.com")
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        wallet
            .expect_melt_to_lightning()
            .withf(|_, amount, _, addr| *amount == 1 && addr == "b@example.com")
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let mint = config.accepted_mints[0].clone();
        let (merchant, _) = merchant_with(config, wallet, idle_backend(), None);
        merchant.process_payout(&mint).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_payout_reaches_mints_added_for_swapped_tokens() {
        let mut config = test_config();
        config.allow_untrusted_mints = true;

        let mut wallet = MockEcashWallet::new();
        wallet.expect_mint_urls().returning(|| {
            vec![
                "https://mint.example.com".to_string(),
                "https://8333.space:3338".to_string(),
            ]
        });
        wallet.expect_balance_by_mint().returning(|url| {
            if url == "https://8333.space:3338" {
                Ok(1000)
            } else {
                Ok(0)
            }
        });
        // No reserve at the swapped-in mint: the full 1000 sats drain to
        // the configured share.
        wallet
            .expect_melt_to_lightning()
            .withf(|url, amount, max_cost, addr| {
                url == "https://8333.space:3338"
                    && *amount == 1000
                    && *max_cost == 1020
                    && addr == "operator@getalby.com"
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let (merchant, _) = merchant_with(config, wallet, idle_backend(), None);
        let handles = merchant.start_payout_routine();
        assert_eq!(handles.len(), 2);
        settle().await;

        tokio::time::advance(Duration::from_secs(61)).await;
        settle().await;

        for handle in handles {
            handle.abort();
        }
    }

    #[tokio::test]
    async fn test_payout_skipped_below_threshold() {
        let mut wallet = MockEcashWallet::new();
        wallet
            .expect_balance_by_mint()
            .times(1)
            .returning(|_| Ok(400));
        wallet.expect_melt_to_lightning().times(0);

        let config = test_config();
        let mint = config.accepted_mints[0].clone();
        let (merchant, _) = merchant_with(config, wallet, idle_backend(), None);
        merchant.process_payout(&mint).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_payout_routine_ticks_on_the_configured_interval() {
        let mut wallet = MockEcashWallet::new();
        wallet
            .expect_balance_by_mint()
            .times(2)
            .returning(|_| Ok(0));
        wallet.expect_melt_to_lightning().times(0);

        let (merchant, _) = merchant_with(test_config(), wallet, idle_backend(), None);
        let handles = merchant.start_payout_routine();
        assert_eq!(handles.len(), 1);
        settle().await;

        // Two full 60s intervals pass, so exactly two balance checks run.
        tokio::time::advance(Duration::from_secs(61)).await;
        settle().await;
        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;

        for handle in handles {
            handle.abort();
        }
    }

    #[test]
    fn test_advertisement_is_a_signed_21021_event() {
        let config = test_config();
        let advertisement = build_advertisement(&config).unwrap();

        let event = Event::from_json(&advertisement).unwrap();
        assert_eq!(event.kind, Kind::Custom(21021));
        assert!(event.verify().is_ok());

        let tag_values: Vec<Vec<String>> =
            event.tags.iter().map(|t| t.clone().to_vec()).collect();
        assert!(tag_values.contains(&vec!["metric".to_string(), "milliseconds".to_string()]));
        assert!(tag_values.contains(&vec!["step_size".to_string(), "60000".to_string()]));
        assert!(tag_values.contains(&vec![
            "price_per_step".to_string(),
            "1".to_string(),
            "sat".to_string()
        ]));
        assert!(tag_values.contains(&vec![
            "mint".to_string(),
            "https://mint.example.com".to_string()
        ]));
    }
}
