//! Session tokens.
//!
//! A token binds a session id to its issue time with HMAC-SHA256:
//!
//! ```text
//! | session_id (16) | issued_at millis, big-endian (8) | hmac (32) |
//! ```

use crate::error::{PrimaryError, PrimaryResult};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const SIGNED_LEN: usize = 24;
const TOKEN_LEN: usize = SIGNED_LEN + 32;

/// Issues and checks session tokens.
#[derive(Clone)]
pub struct TokenIssuer {
    mac: HmacSha256,
    ttl: Duration,
}

impl TokenIssuer {
    /// Creates an issuer keyed by `secret`.
    ///
    /// # Errors
    ///
    /// [`PrimaryError::InvalidConfig`] for an empty secret.
    pub fn new(secret: &[u8], ttl: Duration) -> PrimaryResult<Self> {
        if secret.is_empty() {
            return Err(PrimaryError::InvalidConfig("token secret is empty".into()));
        }
        let mac = HmacSha256::new_from_slice(secret)
            .map_err(|e| PrimaryError::InvalidConfig(e.to_string()))?;
        Ok(Self { mac, ttl })
    }

    /// Issues a token for `session_id`.
    #[must_use]
    pub fn issue(&self, session_id: Uuid) -> Vec<u8> {
        let mut token = Vec::with_capacity(TOKEN_LEN);
        token.extend_from_slice(session_id.as_bytes());
        token.extend_from_slice(&now_millis().to_be_bytes());
        let mut mac = self.mac.clone();
        mac.update(&token);
        token.extend_from_slice(&mac.finalize().into_bytes());
        token
    }

    /// Checks a token and returns its session id.
    ///
    /// # Errors
    ///
    /// [`PrimaryError::NotAuthorized`] for a malformed, forged or expired token.
    pub fn verify(&self, token: &[u8]) -> PrimaryResult<Uuid> {
        if token.len() != TOKEN_LEN {
            return Err(PrimaryError::NotAuthorized("invalid token length".into()));
        }
        let (signed, signature) = token.split_at(SIGNED_LEN);

        let mut mac = self.mac.clone();
        mac.update(signed);
        mac.verify_slice(signature)
            .map_err(|_| PrimaryError::NotAuthorized("invalid token signature".into()))?;

        let mut issued = [0u8; 8];
        issued.copy_from_slice(&signed[16..24]);
        let age = now_millis().saturating_sub(u64::from_be_bytes(issued));
        if u128::from(age) > self.ttl.as_millis() {
            return Err(PrimaryError::NotAuthorized("token expired".into()));
        }

        let mut id = [0u8; 16];
        id.copy_from_slice(&signed[..16]);
        Ok(Uuid::from_bytes(id))
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer() -> TokenIssuer {
        TokenIssuer::new(b"primary-token-secret", Duration::from_secs(60)).unwrap()
    }

    #[test]
    fn issued_token_verifies() {
        let issuer = issuer();
        let session = Uuid::new_v4();
        let token = issuer.issue(session);
        assert_eq!(token.len(), TOKEN_LEN);
        assert_eq!(issuer.verify(&token).unwrap(), session);
    }

    #[test]
    fn tampered_token_is_rejected() {
        let issuer = issuer();
        let mut token = issuer.issue(Uuid::new_v4());
        token[3] ^= 0x01;
        assert!(matches!(issuer.verify(&token), Err(PrimaryError::NotAuthorized(_))));
    }

    #[test]
    fn other_key_is_rejected() {
        let token = issuer().issue(Uuid::new_v4());
        let other = TokenIssuer::new(b"another-secret", Duration::from_secs(60)).unwrap();
        assert!(other.verify(&token).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let issuer = TokenIssuer::new(b"k", Duration::ZERO).unwrap();
        let token = issuer.issue(Uuid::new_v4());
        std::thread::sleep(Duration::from_millis(10));
        assert!(issuer.verify(&token).is_err());
    }

    #[test]
    fn empty_secret_is_rejected() {
        assert!(TokenIssuer::new(b"", Duration::from_secs(1)).is_err());
    }
}
