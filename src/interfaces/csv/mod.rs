//! Batch CSV adapters for the operator CLI: webhook deliveries and scanner
//! logs in, outcome rows out.

pub mod delivery_reader;
pub mod outcome_writer;
pub mod scan_reader;
