//! Application layer: the engine's components as services over the store ports.
//!
//! Each service is stateless apart from its store handles, so any number of
//! engine instances (threads, processes) can run side by side. All
//! cross-request coordination happens inside the stores' atomic operations.

pub mod dedup;
pub mod engine;
pub mod issuer;
pub mod ledger;
pub mod redemption;

use crate::error::{EngineError, ErrorClass};
use tracing::{error, warn};

/// Logs a failed operation at the level its error class calls for.
pub(crate) fn trace_failure(operation: &'static str, err: &EngineError) {
    match err.class() {
        ErrorClass::Infrastructure => error!(operation, error = %err, "Store failure"),
        ErrorClass::Capacity | ErrorClass::Redemption => {
            warn!(operation, error = %err, "Rejected")
        }
        ErrorClass::Validation => warn!(operation, error = %err, "Invalid request"),
    }
}
