use crate::domain::ids::{OrderId, ReservationId, TicketId, TierId};
use crate::domain::ticket::TicketStatus;
use thiserror::Error;

/// Convenience alias used throughout the engine.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Broad category of an [`EngineError`], used by callers to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The buyer has to pick something else. Never retried by the system.
    Capacity,
    /// The request itself is malformed or refers to state it cannot act on.
    Validation,
    /// A scan was refused. Terminal for that attempt.
    Redemption,
    /// The store could not be reached or returned garbage. Retryable for idempotent operations.
    Infrastructure,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Insufficient inventory on tier {tier}: requested {requested}, available {available}")]
    InsufficientInventory {
        tier: TierId,
        requested: u32,
        available: u32,
    },
    #[error("Buyer limit exceeded on tier {tier}: limit {limit}, already holding {held}, requested {requested}")]
    BuyerLimitExceeded {
        tier: TierId,
        limit: u32,
        held: u32,
        requested: u32,
    },

    #[error("Price tier not found: {0}")]
    TierNotFound(TierId),
    #[error("Entry window not registered for event {0}")]
    EventWindowNotFound(String),
    #[error("Reservation not found: {0}")]
    ReservationNotFound(ReservationId),
    #[error("Reservation expired: {0}")]
    ReservationExpired(ReservationId),
    #[error("Reservation was released: {0}")]
    ReservationReleased(ReservationId),
    #[error("Reservation already committed: {0}")]
    ReservationCommitted(ReservationId),
    #[error("Payment amount mismatch: expected {expected}, received {received}")]
    AmountMismatch { expected: i64, received: i64 },
    #[error("Payment event not found: {0}")]
    PaymentEventNotFound(String),
    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),
    #[error("Ticket {ticket} is {status}, expected unused")]
    TicketNotUnused { ticket: TicketId, status: TicketStatus },
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid token signature")]
    InvalidSignature,
    #[error("Token for ticket {ticket} is outside its entry window")]
    OutOfWindow { ticket: TicketId },
    #[error("Token for ticket {0} has been superseded")]
    StaleToken(TicketId),
    #[error("Ticket {ticket} already {status}")]
    AlreadyUsed { ticket: TicketId, status: TicketStatus },
    #[error("Ticket not found: {0}")]
    TicketNotFound(TicketId),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[cfg(feature = "storage-rocksdb")]
    #[error("Storage error: {0}")]
    StorageError(#[from] rocksdb::Error),
    #[error("Internal error: {0}")]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
}

impl EngineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InsufficientInventory { .. } | Self::BuyerLimitExceeded { .. } => {
                ErrorClass::Capacity
            }
            Self::InvalidSignature
            | Self::OutOfWindow { .. }
            | Self::StaleToken(_)
            | Self::AlreadyUsed { .. }
            | Self::TicketNotFound(_) => ErrorClass::Redemption,
            Self::CsvError(_)
            | Self::IoError(_)
            | Self::SerializationError(_)
            | Self::InternalError(_) => ErrorClass::Infrastructure,
            #[cfg(feature = "storage-rocksdb")]
            Self::StorageError(_) => ErrorClass::Infrastructure,
            _ => ErrorClass::Validation,
        }
    }

    /// Only infrastructure failures may be retried, and only by the caller.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Infrastructure
    }

    /// Text safe to show to buyers and venue staff.
    ///
    /// Infrastructure failures collapse into a generic message so store
    /// details never leak past the engine boundary.
    pub fn user_message(&self) -> String {
        match self.class() {
            ErrorClass::Infrastructure => {
                "Service temporarily unavailable, please try again".to_string()
            }
            _ => match self {
                Self::InsufficientInventory { available, .. } => {
                    format!("Only {available} ticket(s) left in this tier")
                }
                Self::BuyerLimitExceeded { limit, .. } => {
                    format!("Purchase limit of {limit} ticket(s) per buyer reached")
                }
                Self::InvalidSignature | Self::StaleToken(_) => {
                    "Invalid ticket code".to_string()
                }
                Self::OutOfWindow { .. } => "Ticket is not valid at this time".to_string(),
                Self::AlreadyUsed { status, .. } => format!("Ticket already {status}"),
                Self::TicketNotFound(_) => "Unknown ticket".to_string(),
                other => other.to_string(),
            },
        }
    }
}
