//! Public payment announcements ("bragging")
//!
//! Optionally publishes a kind-1 note after every successful purchase,
//! built from the operator-selected fields. Publishing is fire and
//! forget, a relay outage never affects the session that triggered it.

use crate::errors::{TollGateError, TollGateResult};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use nostr::{Event, EventBuilder, Keys, Kind, Tag};
use nostr_sdk::Client;

const BRAGGING_HASHTAG: &str = "#BraggingTollGateRawData";

/// Receives a notification for every successful purchase.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PaymentAnnouncer: Send + Sync {
    async fn announce(&self, amount: u64, duration_seconds: u64) -> TollGateResult<()>;
}

/// Announcer that publishes notes to the configured nostr relays.
pub struct NostrAnnouncer {
    keys: Keys,
    client: Client,
    fields: Vec<String>,
    mints: Vec<String>,
}

impl NostrAnnouncer {
    /// Connects to the given relays. Individual relay failures are
    /// logged and skipped.
    pub async fn new(
        keys: Keys,
        relays: &[String],
        fields: Vec<String>,
        mints: Vec<String>,
    ) -> TollGateResult<Self> {
        let client = Client::default();
        for relay_url in relays {
            if let Err(e) = client.add_relay(relay_url).await {
                log::warn!("Failed to add relay {}: {}", relay_url, e);
            }
        }
        client.connect().await;

        Ok(Self {
            keys,
            client,
            fields,
            mints,
        })
    }
}

#[async_trait]
impl PaymentAnnouncer for NostrAnnouncer {
    async fn announce(&self, amount: u64, duration_seconds: u64) -> TollGateResult<()> {
        let event = build_announcement(
            &self.keys,
            &self.fields,
            &self.mints,
            amount,
            duration_seconds,
        )?;

        self.client
            .send_event(&event)
            .await
            .map_err(|e| TollGateError::nostr(format!("Failed to publish announcement: {}", e)))?;
        log::info!("Published payment announcement for {} sats", amount);
        Ok(())
    }
}

/// Builds the kind-1 announcement note from the configured fields.
pub fn build_announcement(
    keys: &Keys,
    fields: &[String],
    mints: &[String],
    amount: u64,
    duration_seconds: u64,
) -> TollGateResult<Event> {
    let mut tags: Vec<Tag> = Vec::new();
    let mut content = String::new();

    for field in fields {
        match field.as_str() {
            "amount" => {
                tags.push(
                    Tag::parse(vec!["amount".to_string(), amount.to_string()])
                        .map_err(|e| TollGateError::nostr(e.to_string()))?,
                );
                content.push_str(&format!("Amount: {} sats,\n", amount));
            }
            "mint" => {
                if let Some(mint) = mints.first() {
                    tags.push(
                        Tag::parse(vec!["mint".to_string(), mint.clone()])
                            .map_err(|e| TollGateError::nostr(e.to_string()))?,
                    );
                    content.push_str(&format!("Mint: {},\n", mint));
                }
            }
            "duration" => {
                tags.push(
                    Tag::parse(vec!["duration".to_string(), duration_seconds.to_string()])
                        .map_err(|e| TollGateError::nostr(e.to_string()))?,
                );
                content.push_str(&format!("Duration: {} seconds", duration_seconds));
            }
            other => log::warn!("Unknown bragging field: {}", other),
        }
    }

    if !content.is_empty() {
        content.truncate(content.trim_end_matches(['\n', ',']).len());
        content.push_str("\n\n");
        content.push_str(BRAGGING_HASHTAG);
    }

    EventBuilder::new(Kind::TextNote, content)
        .tags(tags)
        .sign_with_keys(keys)
        .map_err(|e| TollGateError::nostr(format!("Failed to sign announcement: {}", e)))
}
