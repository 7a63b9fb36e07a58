//! Usage metering.

pub mod accountant;
