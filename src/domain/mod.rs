//! Core domain model: identifiers, inventory accounting, payments, tickets,
//! redemption audit, token signing, and the ports the engine needs from its
//! environment.

pub mod clock;
pub mod ids;
pub mod inventory;
pub mod payment;
pub mod ports;
pub mod redemption;
pub mod ticket;
pub mod token;
