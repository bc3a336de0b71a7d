//! Associations: the shared HMAC keys negotiated with providers, and the
//! engine that establishes, caches, and retires them.
//!
//! A smart-mode consumer negotiates an association once per provider and
//! verifies assertion signatures locally for as long as it lives. The
//! negotiation is a Diffie-Hellman exchange carried over a key-value form
//! POST; a provider may instead return the MAC key in the clear by omitting
//! `session_type`. Any failure along the way is logged and yields no
//! association, which downgrades verification to the provider's
//! `check_authentication` endpoint.

use crate::crypto::{btwoc, btwoc_decode, DhError, DiffieHellman};
use crate::http::Fetcher;
use crate::kvform::{self, KvError};
use crate::store::ConsumerStore;
use crate::types::{AssociationHandle, MacKey, ServerUrl};

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use log::warn;
use num_bigint::BigUint;
use thiserror::Error;

/// The association type negotiated with providers. OpenID 1.1 defines only
/// HMAC-SHA1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum AssociationType {
    /// Assertions are signed with HMAC-SHA1.
    HmacSha1,
}

impl AssociationType {
    /// The protocol name of this association type.
    pub fn as_str(&self) -> &'static str {
        match self {
            AssociationType::HmacSha1 => "HMAC-SHA1",
        }
    }
}

/// A shared secret negotiated with a provider, identified by the provider's
/// opaque handle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Association {
    handle: AssociationHandle,
    secret: MacKey,
    assoc_type: AssociationType,
    issued_at: u64,
    lifetime: u64,
}

impl Association {
    /// Create an association from its parts. `issued_at` is seconds since
    /// epoch; `lifetime` is the provider-granted validity in seconds.
    pub fn new(
        handle: AssociationHandle,
        secret: MacKey,
        assoc_type: AssociationType,
        issued_at: u64,
        lifetime: u64,
    ) -> Self {
        Self {
            handle,
            secret,
            assoc_type,
            issued_at,
            lifetime,
        }
    }

    /// The provider-assigned handle.
    pub fn handle(&self) -> &AssociationHandle {
        &self.handle
    }

    /// The negotiated MAC key.
    pub fn secret(&self) -> &MacKey {
        &self.secret
    }

    /// The negotiated association type.
    pub fn assoc_type(&self) -> AssociationType {
        self.assoc_type
    }

    /// Seconds since epoch at which the association was issued.
    pub fn issued_at(&self) -> u64 {
        self.issued_at
    }

    /// The provider-granted validity in seconds.
    pub fn lifetime(&self) -> u64 {
        self.lifetime
    }

    /// Seconds of validity remaining at time `now`. Non-positive once the
    /// association has expired; an expired association must never be used.
    pub fn expires_in(&self, now: u64) -> i64 {
        (self.issued_at + self.lifetime) as i64 - now as i64
    }
}

/// Error negotiating an association. Never surfaced to callers: the engine
/// logs a diagnostic and falls back to dumb-mode verification.
#[derive(Debug, Error)]
#[non_exhaustive]
pub(crate) enum AssociateError {
    #[error("Transport failure: {0}")]
    Transport(Box<dyn std::error::Error>),
    #[error("Provider returned HTTP status {0}")]
    HttpStatus(http::StatusCode),
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error("Response missing required field `{0}`")]
    MissingField(&'static str),
    #[error("Unsupported assoc_type `{0}`")]
    UnsupportedAssocType(String),
    #[error("Unsupported session_type `{0}`")]
    UnsupportedSessionType(String),
    #[error("Unparseable expires_in `{0}`")]
    BadExpiresIn(String),
    #[error("Response field `{0}` is not valid base64")]
    BadBase64(&'static str),
    #[error(transparent)]
    Dh(#[from] DhError),
}

/// Establishes and caches associations for a store/fetcher pair.
pub(crate) struct AssociationEngine<'a, S: ?Sized, F: ?Sized> {
    store: &'a S,
    fetcher: &'a F,
    token_lifetime: u64,
    dh_params: Option<&'a (BigUint, BigUint)>,
}

impl<'a, S, F> AssociationEngine<'a, S, F>
where
    S: ConsumerStore + ?Sized,
    F: Fetcher + ?Sized,
{
    pub(crate) fn new(
        store: &'a S,
        fetcher: &'a F,
        token_lifetime: u64,
        dh_params: Option<&'a (BigUint, BigUint)>,
    ) -> Self {
        Self {
            store,
            fetcher,
            token_lifetime,
            dh_params,
        }
    }

    /// Return a usable association for `server_url`, negotiating a fresh one
    /// when necessary.
    ///
    /// Returns `None` in dumb mode. A cached association is reused unless
    /// `replace` is set and its remaining lifetime has fallen below the
    /// token lifetime, in which case it could expire mid-flow and a
    /// replacement is negotiated instead.
    pub(crate) fn get_association(
        &self,
        server_url: &ServerUrl,
        replace: bool,
        now: u64,
    ) -> Option<Association> {
        if self.store.is_dumb() {
            return None;
        }
        if let Some(association) = self.store.get_association(server_url, None) {
            if !replace || association.expires_in(now) > self.token_lifetime as i64 {
                return Some(association);
            }
        }
        match self.associate(server_url, now) {
            Ok(association) => {
                self.store.store_association(server_url, association.clone());
                Some(association)
            }
            Err(err) => {
                warn!("association with {} failed: {}", server_url.as_str(), err);
                None
            }
        }
    }

    /// Perform the associate round-trip: Diffie-Hellman offer, key-value
    /// form POST, secret derivation.
    fn associate(&self, server_url: &ServerUrl, now: u64) -> Result<Association, AssociateError> {
        let dh = match self.dh_params {
            Some((modulus, generator)) => DiffieHellman::new(modulus.clone(), generator.clone()),
            None => DiffieHellman::new_default(),
        };

        let request = [
            ("openid.mode", "associate".to_string()),
            ("openid.assoc_type", AssociationType::HmacSha1.as_str().to_string()),
            ("openid.session_type", "DH-SHA1".to_string()),
            ("openid.dh_modulus", BASE64_STANDARD.encode(btwoc(dh.modulus()))),
            ("openid.dh_gen", BASE64_STANDARD.encode(btwoc(dh.generator()))),
            (
                "openid.dh_consumer_public",
                BASE64_STANDARD.encode(btwoc(&dh.public())),
            ),
        ];
        let body = kvform::encode(&request)?;

        let response = self
            .fetcher
            .post(server_url.url(), &body)
            .map_err(|err| AssociateError::Transport(Box::new(err)))?;
        if response.status_code != http::StatusCode::OK {
            return Err(AssociateError::HttpStatus(response.status_code));
        }

        let results = kvform::parse_map(&response.body);
        let field = |name: &'static str| {
            results
                .get(name)
                .cloned()
                .ok_or(AssociateError::MissingField(name))
        };

        let assoc_type = field("assoc_type")?;
        if assoc_type != AssociationType::HmacSha1.as_str() {
            return Err(AssociateError::UnsupportedAssocType(assoc_type));
        }
        let handle = field("assoc_handle")?;
        let expires_in = field("expires_in")?;
        let lifetime = expires_in
            .parse::<u64>()
            .map_err(|_| AssociateError::BadExpiresIn(expires_in))?;

        let secret = match results.get("session_type").map(String::as_str) {
            // Plaintext session: the MAC key arrives in the clear.
            None | Some("") => {
                let mac_key = field("mac_key")?;
                MacKey::new(
                    BASE64_STANDARD
                        .decode(mac_key)
                        .map_err(|_| AssociateError::BadBase64("mac_key"))?,
                )
            }
            Some("DH-SHA1") => {
                let server_public = BASE64_STANDARD
                    .decode(field("dh_server_public")?)
                    .map_err(|_| AssociateError::BadBase64("dh_server_public"))?;
                let enc_mac_key = BASE64_STANDARD
                    .decode(field("enc_mac_key")?)
                    .map_err(|_| AssociateError::BadBase64("enc_mac_key"))?;
                dh.xor_secret(&btwoc_decode(&server_public), &enc_mac_key)?
            }
            Some(other) => {
                return Err(AssociateError::UnsupportedSessionType(other.to_string()));
            }
        };

        Ok(Association::new(
            AssociationHandle::new(handle),
            secret,
            AssociationType::HmacSha1,
            now,
            lifetime,
        ))
    }
}
