use super::ids::{OrderId, ReservationId, TierId};
use super::inventory::{PriceTier, Reservation};
use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A payment confirmation as delivered by the processor's webhook.
///
/// Deliveries are at-least-once; `external_event_id` is the processor's own
/// id and is passed through verbatim as the dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentDelivery {
    pub external_event_id: String,
    pub reservation_id: ReservationId,
    pub amount_minor_units: i64,
}

impl PaymentDelivery {
    pub fn validate(&self) -> Result<()> {
        if self.external_event_id.trim().is_empty() {
            return Err(EngineError::ValidationError(
                "External event id must not be empty".to_string(),
            ));
        }
        if self.amount_minor_units < 0 {
            return Err(EngineError::ValidationError(
                "Payment amount must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// A processed payment confirmation. Unique on `external_event_id` for all time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentEvent {
    pub external_event_id: String,
    pub reservation_id: ReservationId,
    pub amount_minor_units: i64,
    pub processed_at: DateTime<Utc>,
}

impl PaymentEvent {
    pub fn from_delivery(delivery: &PaymentDelivery, processed_at: DateTime<Utc>) -> Self {
        Self {
            external_event_id: delivery.external_event_id.clone(),
            reservation_id: delivery.reservation_id,
            amount_minor_units: delivery.amount_minor_units,
            processed_at,
        }
    }
}

/// One order per admitted payment event, and at most one per reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub reservation_id: ReservationId,
    pub buyer_key: String,
    pub tier_id: TierId,
    pub quantity: u32,
    pub total_minor_units: i64,
    pub payment_event_id: String,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn for_payment(
        reservation: &Reservation,
        tier: &PriceTier,
        payment: &PaymentEvent,
        created_at: DateTime<Utc>,
    ) -> Result<Self> {
        Ok(Self {
            id: OrderId::new(),
            reservation_id: reservation.id,
            buyer_key: reservation.buyer_key.clone(),
            tier_id: reservation.tier_id.clone(),
            quantity: reservation.quantity,
            total_minor_units: tier.price_of(reservation.quantity)?,
            payment_event_id: payment.external_event_id.clone(),
            created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_delivery_validation() {
        let mut delivery = PaymentDelivery {
            external_event_id: "evt_123".to_string(),
            reservation_id: ReservationId::new(),
            amount_minor_units: 1500,
        };
        assert!(delivery.validate().is_ok());

        delivery.external_event_id = "  ".to_string();
        assert!(matches!(
            delivery.validate(),
            Err(EngineError::ValidationError(_))
        ));

        delivery.external_event_id = "evt_123".to_string();
        delivery.amount_minor_units = -1;
        assert!(delivery.validate().is_err());
    }

    #[test]
    fn test_order_totals_from_tier_price() {
        let now = Utc::now();
        let tier = PriceTier::new(TierId::from("ga"), "evt", 1500, "USD", 10, 4).unwrap();
        let reservation = Reservation::hold(
            tier.id.clone(),
            3,
            "ana@example.com",
            now,
            now + Duration::minutes(10),
        );
        let delivery = PaymentDelivery {
            external_event_id: "evt_9".to_string(),
            reservation_id: reservation.id,
            amount_minor_units: 4500,
        };
        let payment = PaymentEvent::from_delivery(&delivery, now);

        let order = Order::for_payment(&reservation, &tier, &payment, now).unwrap();
        assert_eq!(order.total_minor_units, 4500);
        assert_eq!(order.quantity, 3);
        assert_eq!(order.payment_event_id, "evt_9");
        assert_eq!(order.buyer_key, "ana@example.com");
        assert_eq!(order.reservation_id, reservation.id);
    }
}
