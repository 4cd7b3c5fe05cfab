use super::trace_failure;
use crate::domain::clock::Clock;
use crate::domain::payment::{PaymentDelivery, PaymentEvent};
use crate::domain::ports::PaymentEventStoreRef;
use crate::error::{EngineError, Result};
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of [`PaymentDeduplicator::admit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmitDecision {
    /// This caller won the insert and alone may go on to issue tickets.
    Admitted(PaymentEvent),
    /// The event was processed before. Nothing was written.
    Duplicate,
}

impl AdmitDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted(_))
    }

    pub fn reason(&self) -> Option<&'static str> {
        match self {
            Self::Admitted(_) => None,
            Self::Duplicate => Some("duplicate"),
        }
    }
}

/// Exactly-once gate in front of ticket issuance.
#[derive(Clone)]
pub struct PaymentDeduplicator {
    store: PaymentEventStoreRef,
    clock: Arc<dyn Clock>,
}

impl PaymentDeduplicator {
    pub fn new(store: PaymentEventStoreRef, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn admit(&self, delivery: &PaymentDelivery) -> Result<AdmitDecision> {
        delivery
            .validate()
            .inspect_err(|e| trace_failure("admit", e))?;

        let event = PaymentEvent::from_delivery(delivery, self.clock.now());
        let inserted = self
            .store
            .insert_if_absent(event.clone())
            .await
            .inspect_err(|e| trace_failure("admit", e))?;

        if inserted {
            info!(
                payment_event = %event.external_event_id,
                reservation = %event.reservation_id,
                amount = event.amount_minor_units,
                "Payment event admitted"
            );
            Ok(AdmitDecision::Admitted(event))
        } else {
            warn!(payment_event = %delivery.external_event_id, "Duplicate payment event ignored");
            Ok(AdmitDecision::Duplicate)
        }
    }

    pub async fn event(&self, external_event_id: &str) -> Result<PaymentEvent> {
        self.store
            .get(external_event_id)
            .await?
            .ok_or_else(|| EngineError::PaymentEventNotFound(external_event_id.to_string()))
    }
}
