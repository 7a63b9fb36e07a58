//! Key ledger: records, expiry parsing and the durable store.

pub mod expiry;
pub mod models;
pub mod store;
