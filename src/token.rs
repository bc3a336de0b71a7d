//! The signed inter-request token.
//!
//! The token replaces server-side session state for the binding between the
//! two phases of a login: it carries the endpoint selected during `begin`
//! through the user's browser to `complete`, authenticated with HMAC-SHA1
//! under the store's process-local auth key. The HMAC ensures the browser
//! cannot tamper with the endpoint; the embedded timestamp bounds replay.

use crate::crypto::{hmac_sha1, hmac_sha1_verify};
use crate::types::AuthKey;

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use thiserror::Error;

/// Length of the HMAC-SHA1 tag prefixing the token body.
const SIG_LEN: usize = 20;

/// Default number of seconds a token (and therefore a whole login flow)
/// remains valid.
pub const DEFAULT_TOKEN_LIFETIME: u64 = 300;

/// Error verifying an inter-request token.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum TokenError {
    /// The token was not valid base64.
    #[error("Token is not valid base64")]
    BadEncoding,
    /// The token's HMAC did not verify.
    #[error("Token signature mismatch")]
    BadSignature,
    /// The token body did not have the expected shape.
    #[error("Malformed token body")]
    Malformed,
    /// The token was issued too long ago.
    #[error("Token expired")]
    Expired,
}

/// The contents of a verified token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenPayload {
    /// Seconds since epoch at which the token was signed.
    pub timestamp: u64,
    /// The claimed identity URL from the selected endpoint.
    pub identity_url: String,
    /// The delegate identity from the selected endpoint.
    pub server_id: String,
    /// The provider endpoint URL.
    pub server_url: String,
}

/// Signs and verifies inter-request tokens under the store's auth key.
pub struct TokenCodec {
    auth_key: AuthKey,
    lifetime: u64,
}

impl TokenCodec {
    /// Create a codec from the store's auth key and a token lifetime in
    /// seconds.
    pub fn new(auth_key: AuthKey, lifetime: u64) -> Self {
        Self { auth_key, lifetime }
    }

    /// Build a signed token binding the given endpoint fields, timestamped
    /// `now`.
    pub fn sign(&self, now: u64, identity_url: &str, server_id: &str, server_url: &str) -> String {
        let joined = format!(
            "{}\x00{}\x00{}\x00{}",
            now, identity_url, server_id, server_url
        );
        let sig = hmac_sha1(self.auth_key.secret(), joined.as_bytes());
        let mut raw = sig;
        raw.extend_from_slice(joined.as_bytes());
        BASE64_STANDARD.encode(raw)
    }

    /// Verify a token and recover its payload.
    ///
    /// Fails if the token is not base64, is too short, carries a bad HMAC,
    /// does not split into exactly four fields, has a zero or unparseable
    /// timestamp, or was issued more than the configured lifetime before
    /// `now`. The HMAC comparison is constant-time.
    pub fn verify(&self, now: u64, token: &str) -> Result<TokenPayload, TokenError> {
        let raw = BASE64_STANDARD
            .decode(token)
            .map_err(|_| TokenError::BadEncoding)?;
        if raw.len() < SIG_LEN {
            return Err(TokenError::Malformed);
        }
        let (sig, body) = raw.split_at(SIG_LEN);
        if !hmac_sha1_verify(self.auth_key.secret(), body, sig) {
            return Err(TokenError::BadSignature);
        }

        let parts: Vec<&[u8]> = body.split(|byte| *byte == 0).collect();
        let [timestamp, identity_url, server_id, server_url]: [&[u8]; 4] =
            parts.try_into().map_err(|_| TokenError::Malformed)?;

        let timestamp = std::str::from_utf8(timestamp)
            .map_err(|_| TokenError::Malformed)?
            .parse::<u64>()
            .map_err(|_| TokenError::Malformed)?;
        if timestamp == 0 {
            return Err(TokenError::Malformed);
        }
        if timestamp + self.lifetime < now {
            return Err(TokenError::Expired);
        }

        let field = |bytes: &[u8]| {
            String::from_utf8(bytes.to_vec()).map_err(|_| TokenError::Malformed)
        };
        Ok(TokenPayload {
            timestamp,
            identity_url: field(identity_url)?,
            server_id: field(server_id)?,
            server_url: field(server_url)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AuthKey;
    use pretty_assertions::assert_eq;

    fn codec() -> TokenCodec {
        TokenCodec::new(AuthKey::new(vec![7u8; 20]), DEFAULT_TOKEN_LIFETIME)
    }

    #[test]
    fn round_trip_within_lifetime() {
        let codec = codec();
        let token = codec.sign(
            1000,
            "http://example.com/",
            "http://example.com/delegate",
            "https://op.example/",
        );
        let payload = codec.verify(1000 + DEFAULT_TOKEN_LIFETIME, &token).unwrap();
        assert_eq!(
            payload,
            TokenPayload {
                timestamp: 1000,
                identity_url: "http://example.com/".to_string(),
                server_id: "http://example.com/delegate".to_string(),
                server_url: "https://op.example/".to_string(),
            }
        );
    }

    #[test]
    fn expires_after_lifetime() {
        let codec = codec();
        let token = codec.sign(1000, "a", "b", "c");
        assert_eq!(
            codec.verify(1000 + DEFAULT_TOKEN_LIFETIME + 1, &token),
            Err(TokenError::Expired)
        );
    }

    #[test]
    fn any_flipped_bit_is_rejected() {
        let codec = codec();
        let token = codec.sign(1000, "http://example.com/", "b", "c");
        let raw = BASE64_STANDARD.decode(&token).unwrap();
        for index in 0..raw.len() {
            let mut tampered = raw.clone();
            tampered[index] ^= 0x01;
            let tampered = BASE64_STANDARD.encode(&tampered);
            assert!(
                codec.verify(1001, &tampered).is_err(),
                "bit flip at byte {} verified",
                index
            );
        }
    }

    #[test]
    fn rejects_wrong_key() {
        let codec = codec();
        let other = TokenCodec::new(AuthKey::new(vec![8u8; 20]), DEFAULT_TOKEN_LIFETIME);
        let token = codec.sign(1000, "a", "b", "c");
        assert_eq!(other.verify(1001, &token), Err(TokenError::BadSignature));
    }

    #[test]
    fn rejects_garbage() {
        let codec = codec();
        assert_eq!(codec.verify(1, "!!!"), Err(TokenError::BadEncoding));
        assert_eq!(
            codec.verify(1, &BASE64_STANDARD.encode(b"short")),
            Err(TokenError::Malformed)
        );
    }

    #[test]
    fn rejects_wrong_field_count() {
        let auth_key = AuthKey::new(vec![7u8; 20]);
        let joined = b"1000\x00only-two-fields".to_vec();
        let mut raw = crate::crypto::hmac_sha1(auth_key.secret(), &joined);
        raw.extend_from_slice(&joined);
        let token = BASE64_STANDARD.encode(raw);
        assert_eq!(codec().verify(1001, &token), Err(TokenError::Malformed));
    }

    #[test]
    fn rejects_zero_timestamp() {
        let auth_key = AuthKey::new(vec![7u8; 20]);
        let joined = b"0\x00a\x00b\x00c".to_vec();
        let mut raw = crate::crypto::hmac_sha1(auth_key.secret(), &joined);
        raw.extend_from_slice(&joined);
        let token = BASE64_STANDARD.encode(raw);
        assert_eq!(codec().verify(1001, &token), Err(TokenError::Malformed));
    }
}
