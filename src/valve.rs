//! Gate control ("valve")
//!
//! Maintains one revocable time-boxed network authorization per MAC
//! address and is the only component talking to the OS-level
//! captive-portal backend. Per MAC the state machine is
//! Unauthorized -> Authorized(expiry) -> Unauthorized: the backend
//! authorize action runs exactly once when a MAC first gains access, a
//! later grant while still authorized replaces the expiry timer, and the
//! deauthorize action runs exactly once when the timer fires.

use crate::errors::{TollGateError, TollGateResult};
use crate::mac::MacAddress;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Grants shorter than this are rounded up; the gate never opens for less
/// than one minute.
pub const MIN_GRANT_SECONDS: u64 = 60;

/// OS-level access-control backend. Zero exit status means success; any
/// command output is advisory.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GateBackend: Send + Sync {
    async fn authorize(&self, mac: &MacAddress) -> TollGateResult<()>;
    async fn deauthorize(&self, mac: &MacAddress) -> TollGateResult<()>;
}

/// Backend driving openNDS via the `ndsctl` command line tool.
pub struct NdsctlBackend;

impl NdsctlBackend {
    async fn run(&self, action: &str, mac: &MacAddress) -> TollGateResult<()> {
        let output = tokio::process::Command::new("ndsctl")
            .arg(action)
            .arg(mac.as_str())
            .output()
            .await?;

        if !output.status.success() {
            return Err(TollGateError::gate(format!(
                "ndsctl {} {} failed: {}",
                action,
                mac,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        log::debug!(
            "ndsctl {} {} output: {}",
            action,
            mac,
            String::from_utf8_lossy(&output.stdout).trim()
        );
        Ok(())
    }
}

#[async_trait]
impl GateBackend for NdsctlBackend {
    async fn authorize(&self, mac: &MacAddress) -> TollGateResult<()> {
        self.run("auth", mac).await
    }

    async fn deauthorize(&self, mac: &MacAddress) -> TollGateResult<()> {
        self.run("deauth", mac).await
    }
}

struct TimerEntry {
    generation: u64,
    handle: JoinHandle<()>,
}

type TimerMap = Arc<Mutex<HashMap<MacAddress, TimerEntry>>>;

/// Gate controller holding the MAC -> expiry-timer map.
///
/// All reads, inserts, and removals go through one async mutex, so a
/// firing expiry and a concurrent `open_gate` for the same MAC cannot
/// race. Generation numbers let a superseded timer that already slept
/// detect it was replaced and step aside.
pub struct Valve {
    backend: Arc<dyn GateBackend>,
    timers: TimerMap,
    generation: AtomicU64,
}

impl Valve {
    pub fn new(backend: Arc<dyn GateBackend>) -> Self {
        Self {
            backend,
            timers: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    /// Authorize `mac` for `duration_seconds`, flooring the grant at one
    /// minute. If the MAC is already authorized the call is an extension:
    /// the backend is not re-invoked and the existing timer is replaced,
    /// not accumulated.
    pub async fn open_gate(&self, mac: &MacAddress, duration_seconds: i64) -> TollGateResult<()> {
        let seconds = if duration_seconds < MIN_GRANT_SECONDS as i64 {
            MIN_GRANT_SECONDS
        } else {
            duration_seconds as u64
        };

        let mut timers = self.timers.lock().await;

        if timers.contains_key(mac) {
            log::info!("Extending access for already authorized MAC {}", mac);
        } else {
            self.backend.authorize(mac).await?;
            log::info!("New authorization for MAC {}", mac);
        }

        if let Some(old) = timers.remove(mac) {
            old.handle.abort();
            log::debug!("Canceled existing timer for MAC {}", mac);
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn(expire_after(
            Arc::clone(&self.timers),
            Arc::clone(&self.backend),
            mac.clone(),
            seconds,
            generation,
        ));
        timers.insert(
            mac.clone(),
            TimerEntry {
                generation,
                handle,
            },
        );

        log::info!("Opened gate for {} for {} second(s)", mac, seconds);
        Ok(())
    }

    /// Number of MACs currently holding an authorization.
    pub async fn active_timers(&self) -> usize {
        self.timers.lock().await.len()
    }

    /// Cancels every pending expiry timer without deauthorizing; devices
    /// keep whatever access they currently hold at the backend. Call this
    /// at service shutdown rather than relying on `Drop`.
    pub async fn shutdown(&self) {
        let mut timers = self.timers.lock().await;
        for (_, entry) in timers.drain() {
            entry.handle.abort();
        }
        log::info!("Valve shut down, all expiry timers canceled");
    }
}

async fn expire_after(
    timers: TimerMap,
    backend: Arc<dyn GateBackend>,
    mac: MacAddress,
    seconds: u64,
    generation: u64,
) {
    tokio::time::sleep(Duration::from_secs(seconds)).await;

    let mut timers = timers.lock().await;
    match timers.get(&mac) {
        Some(entry) if entry.generation == generation => {}
        // Replaced by a later grant while this task was waking up.
        _ => return,
    }

    // Fail-open: on a backend failure the device stays authorized at the
    // OS level, but the entry is dropped so a later purchase re-authorizes.
    match backend.deauthorize(&mac).await {
        Ok(()) => log::info!(
            "Successfully deauthorized MAC {} after timeout of {} second(s)",
            mac,
            seconds
        ),
        Err(e) => log::error!("Error deauthorizing MAC {} after timeout: {}", mac, e),
    }
    timers.remove(&mac);
}

impl Drop for Valve {
    fn drop(&mut self) {
        // Best effort only: a contended lock here is skipped. `shutdown`
        // is the reliable cleanup path.
        if let Ok(mut timers) = self.timers.try_lock() {
            for (_, entry) in timers.drain() {
                entry.handle.abort();
            }
        }
    }
}
