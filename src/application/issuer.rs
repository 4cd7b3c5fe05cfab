use super::trace_failure;
use crate::domain::clock::Clock;
use crate::domain::ids::{OrderId, TicketId};
use crate::domain::payment::Order;
use crate::domain::ports::{Insert, LedgerStoreRef, TicketStoreRef};
use crate::domain::ticket::{Ticket, TicketStatus, Transition};
use crate::domain::token::{TokenClaims, TokenSigner};
use crate::error::{EngineError, Result};
use chrono::{Duration, SubsecRound};
use std::sync::Arc;
use tracing::info;

/// A ticket together with its current redemption token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedTicket {
    pub ticket: Ticket,
    pub token: String,
}

/// Mints tickets for paid orders.
///
/// Issuance is idempotent per order: the batch is inserted under a
/// uniqueness constraint, and a repeated call gets the stored tickets back
/// with their tokens re-derived. Token bounds are stored on the ticket so the
/// same ticket always yields the same token for a given version.
#[derive(Clone)]
pub struct TicketIssuer {
    ledger: LedgerStoreRef,
    tickets: TicketStoreRef,
    signer: TokenSigner,
    clock: Arc<dyn Clock>,
    entry_grace: Duration,
}

impl TicketIssuer {
    pub fn new(
        ledger: LedgerStoreRef,
        tickets: TicketStoreRef,
        signer: TokenSigner,
        clock: Arc<dyn Clock>,
        entry_grace: Duration,
    ) -> Self {
        Self {
            ledger,
            tickets,
            signer,
            clock,
            entry_grace,
        }
    }

    pub async fn issue(&self, order: &Order) -> Result<Vec<IssuedTicket>> {
        let batch = self
            .mint(order)
            .await
            .inspect_err(|e| trace_failure("issue", e))?;
        let created = batch.was_created();
        let tickets = batch.into_inner();
        if created {
            info!(order = %order.id, count = tickets.len(), "Tickets issued");
        } else {
            info!(order = %order.id, count = tickets.len(), "Tickets already issued");
        }
        tickets.into_iter().map(|t| self.with_token(t)).collect()
    }

    async fn mint(&self, order: &Order) -> Result<Insert<Vec<Ticket>>> {
        let tier = self
            .ledger
            .tier(&order.tier_id)
            .await?
            .ok_or_else(|| EngineError::TierNotFound(order.tier_id.clone()))?;
        let window = self
            .ledger
            .event_window(&tier.event_id)
            .await?
            .ok_or_else(|| EngineError::EventWindowNotFound(tier.event_id.clone()))?;

        // Tokens carry whole seconds; keep the stored bounds identical.
        let (not_before, not_after) = window.token_bounds(self.entry_grace);
        let (not_before, not_after) = (not_before.trunc_subsecs(0), not_after.trunc_subsecs(0));
        let now = self.clock.now();

        let batch = (0..order.quantity)
            .map(|sequence| Ticket {
                id: TicketId::new(),
                order_id: order.id,
                event_id: tier.event_id.clone(),
                tier_id: tier.id.clone(),
                sequence,
                holder_email: order.buyer_key.clone(),
                status: TicketStatus::Unused,
                issued_at: now,
                used_at: None,
                voided_at: None,
                token_version: 1,
                not_before,
                not_after,
            })
            .collect();
        self.tickets.insert_batch_if_absent(order.id, batch).await
    }

    /// Current tokens for an order's tickets, without minting anything.
    pub async fn tokens_for(&self, order_id: OrderId) -> Result<Vec<IssuedTicket>> {
        self.tickets
            .tickets_for_order(order_id)
            .await?
            .into_iter()
            .map(|t| self.with_token(t))
            .collect()
    }

    pub fn token_for(&self, ticket: &Ticket) -> Result<String> {
        self.signer.sign(&TokenClaims::for_ticket(ticket))
    }

    /// Supersedes every outstanding token of an unused ticket.
    pub async fn rotate_token(&self, ticket_id: TicketId) -> Result<IssuedTicket> {
        let transition = match self.tickets.bump_token_version(ticket_id).await {
            Ok(transition) => transition,
            Err(e) => {
                trace_failure("rotate_token", &e);
                return Err(e);
            }
        };
        match transition {
            Transition::Applied(ticket) => {
                info!(ticket = %ticket.id, version = ticket.token_version, "Token rotated");
                self.with_token(ticket)
            }
            Transition::Rejected(ticket) => Err(EngineError::TicketNotUnused {
                ticket: ticket.id,
                status: ticket.status,
            }),
            Transition::Missing => Err(EngineError::TicketNotFound(ticket_id)),
        }
        .inspect_err(|e| trace_failure("rotate_token", e))
    }

    fn with_token(&self, ticket: Ticket) -> Result<IssuedTicket> {
        let token = self.token_for(&ticket)?;
        Ok(IssuedTicket { ticket, token })
    }
}
