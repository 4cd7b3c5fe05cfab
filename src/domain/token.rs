//! Signed redemption tokens.
//!
//! Wire format: `t1.<payload>.<signature>`, where `payload` is the
//! base64url-encoded JSON claims and `signature` is the base64url HMAC-SHA256
//! over `t1.<payload>`. The whole string is what ends up inside the QR code.

use super::ids::TicketId;
use super::ticket::Ticket;
use crate::error::{EngineError, Result};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_PREFIX: &str = "t1";

/// Server-held secret used to sign tokens. Never printed.
#[derive(Clone)]
pub struct SigningKey(Vec<u8>);

impl SigningKey {
    pub const MIN_LEN: usize = 32;

    pub fn new(secret: impl Into<Vec<u8>>) -> Result<Self> {
        let secret = secret.into();
        if secret.len() < Self::MIN_LEN {
            return Err(EngineError::ValidationError(format!(
                "Signing secret must be at least {} bytes",
                Self::MIN_LEN
            )));
        }
        Ok(Self(secret))
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningKey(********)")
    }
}

/// What a token asserts about the ticket it was minted for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    #[serde(rename = "tid")]
    pub ticket_id: TicketId,
    #[serde(rename = "eid")]
    pub event_id: String,
    #[serde(rename = "ver")]
    pub token_version: u32,
    #[serde(rename = "nbf", with = "chrono::serde::ts_seconds")]
    pub not_before: DateTime<Utc>,
    #[serde(rename = "naf", with = "chrono::serde::ts_seconds")]
    pub not_after: DateTime<Utc>,
}

impl TokenClaims {
    pub fn for_ticket(ticket: &Ticket) -> Self {
        Self {
            ticket_id: ticket.id,
            event_id: ticket.event_id.clone(),
            token_version: ticket.token_version,
            not_before: ticket.not_before,
            not_after: ticket.not_after,
        }
    }

    pub fn admits_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now <= self.not_after
    }
}

#[derive(Debug, Clone)]
pub struct TokenSigner {
    key: SigningKey,
}

impl TokenSigner {
    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.key.0)
            .map_err(|_| EngineError::InternalError("HMAC key rejected".into()))
    }

    pub fn sign(&self, claims: &TokenClaims) -> Result<String> {
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
        let signed = format!("{TOKEN_PREFIX}.{payload}");

        let mut mac = self.mac()?;
        mac.update(signed.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(format!("{signed}.{signature}"))
    }

    /// Authenticates a token and returns its claims.
    ///
    /// Any malformation, including a payload that fails to decode after the
    /// signature checks out, is reported as [`EngineError::InvalidSignature`].
    pub fn verify(&self, token: &str) -> Result<TokenClaims> {
        let token = token.trim();
        let (signed, signature) = token
            .rsplit_once('.')
            .ok_or(EngineError::InvalidSignature)?;
        let (prefix, payload) = signed
            .split_once('.')
            .ok_or(EngineError::InvalidSignature)?;
        if prefix != TOKEN_PREFIX {
            return Err(EngineError::InvalidSignature);
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| EngineError::InvalidSignature)?;
        let mut mac = self.mac()?;
        mac.update(signed.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| EngineError::InvalidSignature)?;

        let payload = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| EngineError::InvalidSignature)?;
        serde_json::from_slice(&payload).map_err(|_| EngineError::InvalidSignature)
    }
}
