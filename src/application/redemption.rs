use super::trace_failure;
use crate::domain::clock::Clock;
use crate::domain::ids::TicketId;
use crate::domain::ports::TicketStoreRef;
use crate::domain::redemption::{RedemptionAttempt, RedemptionOutcome};
use crate::domain::ticket::{Ticket, Transition};
use crate::domain::token::{TokenClaims, TokenSigner};
use crate::error::{EngineError, Result};
use std::sync::Arc;
use tracing::info;

/// A successful scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub ticket: Ticket,
    pub outcome: RedemptionOutcome,
}

/// Validates presented tokens and performs the one-way `unused -> used` step.
///
/// Exactly one of any number of concurrent scans of a ticket is accepted:
/// the transition is a conditional update in the store, and every loser sees
/// the state the winner left behind. The accepted audit row is written in the
/// same store step as the transition; every rejection is appended before the
/// caller hears about it.
#[derive(Clone)]
pub struct RedemptionAuthority {
    tickets: TicketStoreRef,
    signer: TokenSigner,
    clock: Arc<dyn Clock>,
}

impl RedemptionAuthority {
    pub fn new(tickets: TicketStoreRef, signer: TokenSigner, clock: Arc<dyn Clock>) -> Self {
        Self {
            tickets,
            signer,
            clock,
        }
    }

    pub async fn redeem(&self, token: &str, scanner_id: &str) -> Result<Admission> {
        let now = self.clock.now();
        let attempt = |ticket_id: Option<TicketId>, outcome: RedemptionOutcome| RedemptionAttempt {
            ticket_id,
            attempted_at: now,
            outcome,
            scanner_id: scanner_id.to_string(),
        };

        // A forged token gets no store lookup, and no ticket id in the audit row.
        let (ticket_id, verdict) = match self.signer.verify(token) {
            Ok(claims) => {
                let accepted = attempt(Some(claims.ticket_id), RedemptionOutcome::Accepted);
                (Some(claims.ticket_id), self.consume(&claims, accepted).await)
            }
            Err(e) => (None, Err(e)),
        };

        match verdict {
            Ok(ticket) => {
                info!(ticket = %ticket.id, scanner = scanner_id, "Ticket redeemed");
                Ok(Admission {
                    ticket,
                    outcome: RedemptionOutcome::Accepted,
                })
            }
            Err(e) => {
                // A store failure is not a verdict on the ticket and has no outcome.
                if let Some(outcome) = RedemptionOutcome::for_error(&e) {
                    self.tickets
                        .append_attempt(attempt(ticket_id, outcome))
                        .await
                        .inspect_err(|e| trace_failure("redeem", e))?;
                }
                trace_failure("redeem", &e);
                Err(e)
            }
        }
    }

    async fn consume(&self, claims: &TokenClaims, accepted: RedemptionAttempt) -> Result<Ticket> {
        if !claims.admits_at(accepted.attempted_at) {
            return Err(EngineError::OutOfWindow {
                ticket: claims.ticket_id,
            });
        }
        match self
            .tickets
            .mark_used(claims.ticket_id, claims.token_version, accepted)
            .await?
        {
            Transition::Applied(ticket) => Ok(ticket),
            Transition::Rejected(ticket) if ticket.is_unused() => {
                Err(EngineError::StaleToken(ticket.id))
            }
            Transition::Rejected(ticket) => Err(EngineError::AlreadyUsed {
                ticket: ticket.id,
                status: ticket.status,
            }),
            Transition::Missing => Err(EngineError::TicketNotFound(claims.ticket_id)),
        }
    }

    /// `unused -> void`. Used and void tickets are terminal.
    pub async fn void(&self, ticket_id: TicketId) -> Result<Ticket> {
        let transition = self
            .tickets
            .mark_void(ticket_id, self.clock.now())
            .await;
        match transition {
            Ok(Transition::Applied(ticket)) => {
                info!(ticket = %ticket.id, "Ticket voided");
                Ok(ticket)
            }
            Ok(Transition::Rejected(ticket)) => Err(EngineError::TicketNotUnused {
                ticket: ticket.id,
                status: ticket.status,
            }),
            Ok(Transition::Missing) => Err(EngineError::TicketNotFound(ticket_id)),
            Err(e) => Err(e),
        }
        .inspect_err(|e| trace_failure("void", e))
    }

    pub async fn attempts(&self, ticket_id: TicketId) -> Result<Vec<RedemptionAttempt>> {
        self.tickets.attempts_for(ticket_id).await
    }
}
