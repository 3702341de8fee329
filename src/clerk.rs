//! Clerk session tokens and Svix-signed webhooks.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, error};

type HmacSha256 = Hmac<Sha256>;

pub const WEBHOOK_TOLERANCE_SECS: u64 = 300;
const JWT_LEEWAY_SECS: u64 = 5;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ClerkError {
    #[error("Invalid Clerk public key")]
    InvalidKey,
    #[error("Invalid session token")]
    InvalidToken,
    #[error("Unauthorized party: {0}")]
    UnauthorizedParty(String),
    #[error("Webhook secret not configured")]
    WebhookNotConfigured,
    #[error("Missing webhook header: {0}")]
    MissingHeader(&'static str),
    #[error("Webhook timestamp outside tolerance")]
    StaleTimestamp,
    #[error("Invalid webhook signature")]
    InvalidSignature,
}

/// Claims of a Clerk session token. Email is only present when the
/// session token template adds it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    pub exp: u64,
    #[serde(default)]
    pub nbf: Option<u64>,
    #[serde(default)]
    pub azp: Option<String>,
    #[serde(default)]
    pub sid: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Clone)]
pub struct ClerkVerifier {
    decoding_key: DecodingKey,
    authorized_parties: Vec<String>,
    webhook_secret: Option<Vec<u8>>,
}

impl std::fmt::Debug for ClerkVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClerkVerifier")
            .field("authorized_parties", &self.authorized_parties)
            .field("webhook_secret", &self.webhook_secret.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

impl ClerkVerifier {
    pub fn new(
        public_key_pem: &str,
        authorized_parties: Vec<String>,
        webhook_secret: Option<&str>,
    ) -> Result<Self, ClerkError> {
        let decoding_key = DecodingKey::from_rsa_pem(public_key_pem.as_bytes()).map_err(|e| {
            error!("Failed to parse Clerk public key: {:?}", e);
            ClerkError::InvalidKey
        })?;
        let webhook_secret = webhook_secret.map(decode_webhook_secret).transpose()?;

        Ok(Self {
            decoding_key,
            authorized_parties,
            webhook_secret,
        })
    }

    pub fn verify_session(&self, token: &str) -> Result<SessionClaims, ClerkError> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = JWT_LEEWAY_SECS;
        validation.validate_nbf = true;
        validation.set_required_spec_claims(&["exp", "sub"]);

        let data = decode::<SessionClaims>(token, &self.decoding_key, &validation).map_err(|e| {
            debug!("Session token rejected: {:?}", e);
            ClerkError::InvalidToken
        })?;
        let claims = data.claims;

        if !self.authorized_parties.is_empty() {
            match claims.azp.as_deref() {
                Some(azp) if self.authorized_parties.iter().any(|p| p == azp) => {}
                other => {
                    return Err(ClerkError::UnauthorizedParty(
                        other.unwrap_or_default().to_string(),
                    ))
                }
            }
        }

        Ok(claims)
    }

    /// Checks a Svix signature over `{id}.{timestamp}.{body}`. The
    /// signature header may carry several space separated `v1,<sig>` entries.
    pub fn verify_webhook(
        &self,
        svix_id: Option<&str>,
        svix_timestamp: Option<&str>,
        svix_signature: Option<&str>,
        body: &[u8],
        now: i64,
    ) -> Result<(), ClerkError> {
        let secret = self
            .webhook_secret
            .as_deref()
            .ok_or(ClerkError::WebhookNotConfigured)?;
        let id = svix_id.ok_or(ClerkError::MissingHeader("svix-id"))?;
        let timestamp = svix_timestamp.ok_or(ClerkError::MissingHeader("svix-timestamp"))?;
        let signatures = svix_signature.ok_or(ClerkError::MissingHeader("svix-signature"))?;

        let ts: i64 = timestamp.parse().map_err(|_| ClerkError::StaleTimestamp)?;
        if now.abs_diff(ts) > WEBHOOK_TOLERANCE_SECS {
            return Err(ClerkError::StaleTimestamp);
        }

        let expected = svix_signature_for(secret, id, timestamp, body)?;
        let matched = signatures
            .split_whitespace()
            .filter_map(|entry| entry.strip_prefix("v1,"))
            .any(|sig| bool::from(sig.as_bytes().ct_eq(expected.as_bytes())));

        if matched {
            Ok(())
        } else {
            Err(ClerkError::InvalidSignature)
        }
    }
}

fn decode_webhook_secret(secret: &str) -> Result<Vec<u8>, ClerkError> {
    let encoded = secret.strip_prefix("whsec_").unwrap_or(secret);
    BASE64.decode(encoded).map_err(|_| ClerkError::InvalidKey)
}

pub(crate) fn svix_signature_for(
    secret: &[u8],
    id: &str,
    timestamp: &str,
    body: &[u8],
) -> Result<String, ClerkError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| ClerkError::InvalidKey)?;
    mac.update(id.as_bytes());
    mac.update(b".");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// Clerk `user.*` webhook payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ClerkWebhookEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: ClerkUserData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClerkUserData {
    pub id: Option<String>,
    #[serde(default)]
    pub email_addresses: Vec<ClerkEmailAddress>,
    #[serde(default)]
    pub primary_email_address_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClerkEmailAddress {
    pub id: String,
    pub email_address: String,
}

impl ClerkUserData {
    pub fn primary_email(&self) -> Option<&str> {
        let primary = self.primary_email_address_id.as_deref();
        self.email_addresses
            .iter()
            .find(|e| Some(e.id.as_str()) == primary)
            .or_else(|| self.email_addresses.first())
            .map(|e| e.email_address.as_str())
    }
}
