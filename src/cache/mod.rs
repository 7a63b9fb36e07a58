//! Read-through caching of ledger rows.

pub mod rows;
