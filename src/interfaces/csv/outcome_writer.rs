use crate::application::engine::Confirmation;
use crate::application::issuer::IssuedTicket;
use crate::domain::ids::{OrderId, ReservationId, TicketId, TierId};
use crate::domain::inventory::{PriceTier, Reservation, ReservationState};
use crate::domain::redemption::{RedemptionAttempt, RedemptionOutcome};
use crate::domain::ticket::{Ticket, TicketStatus};
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;

#[derive(Debug, Serialize)]
pub struct TierRow {
    pub tier_id: TierId,
    pub event_id: String,
    pub unit_price: i64,
    pub currency: String,
    pub total: u32,
    pub reserved: u32,
    pub sold: u32,
    pub available: u32,
    pub per_buyer_limit: u32,
}

impl From<&PriceTier> for TierRow {
    fn from(tier: &PriceTier) -> Self {
        Self {
            tier_id: tier.id.clone(),
            event_id: tier.event_id.clone(),
            unit_price: tier.unit_price_minor_units,
            currency: tier.currency.clone(),
            total: tier.total_inventory,
            reserved: tier.reserved_count,
            sold: tier.sold_count,
            available: tier.available(),
            per_buyer_limit: tier.per_buyer_limit,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ReservationRow {
    pub reservation_id: ReservationId,
    pub tier_id: TierId,
    pub quantity: u32,
    pub buyer: String,
    pub state: ReservationState,
    pub expires_at: DateTime<Utc>,
}

impl From<&Reservation> for ReservationRow {
    fn from(reservation: &Reservation) -> Self {
        Self {
            reservation_id: reservation.id,
            tier_id: reservation.tier_id.clone(),
            quantity: reservation.quantity,
            buyer: reservation.buyer_key.clone(),
            state: reservation.state,
            expires_at: reservation.expires_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SweepRow {
    pub tier_id: TierId,
    pub lapsed: usize,
}

#[derive(Debug, Serialize)]
pub struct TicketRow {
    pub ticket_id: TicketId,
    pub order_id: OrderId,
    pub sequence: u32,
    pub status: TicketStatus,
    pub token: Option<String>,
}

impl From<&Ticket> for TicketRow {
    fn from(ticket: &Ticket) -> Self {
        Self {
            ticket_id: ticket.id,
            order_id: ticket.order_id,
            sequence: ticket.sequence,
            status: ticket.status,
            token: None,
        }
    }
}

impl From<&IssuedTicket> for TicketRow {
    fn from(issued: &IssuedTicket) -> Self {
        Self {
            token: Some(issued.token.clone()),
            ..Self::from(&issued.ticket)
        }
    }
}

/// One row per ticket a payment confirmation produced, or a single row
/// without ticket columns when there are none to show yet.
#[derive(Debug, Serialize)]
pub struct ConfirmationRow {
    pub event_id: String,
    pub admitted: bool,
    pub order_id: Option<OrderId>,
    pub ticket_id: Option<TicketId>,
    pub sequence: Option<u32>,
    pub token: Option<String>,
}

impl ConfirmationRow {
    pub fn rows(event_id: &str, confirmation: &Confirmation) -> Vec<Self> {
        let order_id = confirmation.order.as_ref().map(|order| order.id);
        if confirmation.tickets.is_empty() {
            return vec![Self {
                event_id: event_id.to_string(),
                admitted: confirmation.admitted,
                order_id,
                ticket_id: None,
                sequence: None,
                token: None,
            }];
        }
        confirmation
            .tickets
            .iter()
            .map(|issued| Self {
                event_id: event_id.to_string(),
                admitted: confirmation.admitted,
                order_id,
                ticket_id: Some(issued.ticket.id),
                sequence: Some(issued.ticket.sequence),
                token: Some(issued.token.clone()),
            })
            .collect()
    }
}

/// Result of one scan as shown to venue staff.
#[derive(Debug, Serialize)]
pub struct ScanRow {
    pub scanner: String,
    pub ticket_id: Option<TicketId>,
    pub outcome: RedemptionOutcome,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct AttemptRow {
    pub ticket_id: Option<TicketId>,
    pub attempted_at: DateTime<Utc>,
    pub scanner: String,
    pub outcome: RedemptionOutcome,
}

impl From<&RedemptionAttempt> for AttemptRow {
    fn from(attempt: &RedemptionAttempt) -> Self {
        Self {
            ticket_id: attempt.ticket_id,
            attempted_at: attempt.attempted_at,
            scanner: attempt.scanner_id.clone(),
            outcome: attempt.outcome,
        }
    }
}

/// Writes outcome rows as CSV. The header comes from the first row's fields.
pub struct OutcomeWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> OutcomeWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write<T: Serialize>(&mut self, row: &T) -> Result<()> {
        self.writer.serialize(row)?;
        Ok(())
    }

    pub fn write_all<T: Serialize>(&mut self, rows: impl IntoIterator<Item = T>) -> Result<()> {
        for row in rows {
            self.write(&row)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
