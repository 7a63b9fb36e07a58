//! # Keywarden
//!
//! **Device-bound, quota-metered license keys for module gateways.**
//!
//! Keywarden keeps a ledger of license keys, each scoped to one module
//! (voice, image, music, ...), bound to at most one device, carrying an
//! expiry and an optional usage quota. A gateway asks it whether a request
//! may proceed, does its work, then charges the quota.
//!
//! ## Features
//!
//! - **Ordered validity check**: device exclusivity, existence, status,
//!   expiry, binding and quota, first failure wins
//! - **First-use device binding** inside the same transaction as the check
//! - **No overdraft**: charges re-verify quota atomically with the increment
//! - **Audit trail**: every gateway decision and every administrative
//!   change is logged, best effort, in SQLite
//!
//! ## Quickstart
//!
//! ```no_run
//! use keywarden::{KeyManager, KeywardenConfig, Module, NewKey};
//! use keywarden::audit::entries::AdminContext;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = KeyManager::new(KeywardenConfig::in_data_dir("my-gateway")?)?;
//!
//!     manager.add_key(
//!         NewKey::new("ABC-123", Module::Voice).expires("2030-12-31").max_usage(100),
//!         &AdminContext::default(),
//!     )?;
//!
//!     let decision = manager.check_validity("ABC-123", "device-1", Module::Voice)?;
//!     if decision.is_allowed() {
//!         // ... generate ...
//!         let remaining = manager.charge_one("ABC-123", "device-1", Module::Voice)?;
//!         println!("remaining: {}", remaining);
//!     } else {
//!         println!("denied: {}", decision.message());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Time
//!
//! Expiry dates are entered without a zone and compared against local
//! time at `utc_offset_seconds` (default UTC+7). A date without a time
//! expires at the start of that day.
//!
//! See [`KeywardenConfig`] for full documentation.

#![warn(missing_docs)]

// Core modules
pub mod clock;
pub mod config;
pub mod errors;
pub mod fingerprint;

// Storage layer
pub mod db;
pub mod ledger;

// Cache layer
pub mod cache;

// Policy layer
pub mod policy;

// Metering layer
pub mod meter;

// Audit layer
pub mod audit;

// Manager (main public API)
pub mod manager;

// Re-exports for public API
pub use clock::{Clock, SystemClock};
pub use config::KeywardenConfig;
pub use errors::KeywardenError;
pub use ledger::models::{KeyPatch, KeyRecord, KeyStatus, Module, NewKey, Remaining};
pub use manager::{GatewayRequest, KeyManager, KeyStatusView};
pub use meter::accountant::ChargeError;
pub use policy::validity::{Decision, DenyReason, OutcomeClass};

#[cfg(any(test, feature = "test-seams"))]
pub use clock::MockClock;
