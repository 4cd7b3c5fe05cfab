//! Order-to-ticket materialization and redemption.
//!
//! Reserves scarce inventory at checkout, turns each confirmed payment into
//! tickets exactly once despite webhook redelivery, and lets any number of
//! scanners redeem a ticket with an at-most-once guarantee. All coordination
//! between concurrent callers happens in the stores' atomic operations.

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod interfaces;
