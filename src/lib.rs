//! TollGate merchant
//!
//! Sells timed network access for cashu ecash. The merchant redeems
//! payment tokens, opens the gate for the paying device via the valve,
//! and periodically forwards accumulated profit over Lightning.

pub mod bragging;
pub mod config;
pub mod errors;
pub mod lightning;
pub mod mac;
pub mod merchant;
pub mod mint;
pub mod retry;
pub mod valve;
pub mod wallet;

pub use config::Config;
pub use errors::{TollGateError, TollGateResult};
pub use mac::MacAddress;
pub use merchant::{Merchant, PurchaseSessionResult, PurchaseStatus};
pub use valve::Valve;
pub use wallet::TollWallet;
