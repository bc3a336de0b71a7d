//! The consumer state machine: `begin` sends the user to their provider,
//! `complete` interprets what comes back.
//!
//! [`GenericConsumer`] holds no per-request state and may be shared across
//! requests; [`Consumer`] binds one to a per-request session and drives
//! discovery. The binding between the two phases travels through the
//! browser as a signed token, so the only server-side state a flow needs is
//! the store and one session slot.

use crate::association::AssociationEngine;
use crate::auth_request::AuthRequest;
use crate::discovery::{normalize_identifier, Discovery, DiscoveryManager, ServiceEndpoint};
use crate::http::Fetcher;
use crate::session::Session;
use crate::store::ConsumerStore;
use crate::token::{TokenCodec, DEFAULT_TOKEN_LIFETIME};
use crate::types::{IdentityUrl, Nonce};
use crate::verification::{check_nonce, ResponseVerifier};

use chrono::Utc;
use log::{debug, warn};
use num_bigint::BigUint;
use url::Url;

use std::collections::HashMap;

/// Status constant for [`ConsumerResponse::Success`].
pub const STATUS_SUCCESS: &str = "success";
/// Status constant for [`ConsumerResponse::Cancel`].
pub const STATUS_CANCEL: &str = "cancel";
/// Status constant for [`ConsumerResponse::Failure`].
pub const STATUS_FAILURE: &str = "failure";
/// Status constant for [`ConsumerResponse::SetupNeeded`].
pub const STATUS_SETUP_NEEDED: &str = "setup needed";

/// Default prefix for the session keys the facade manages.
pub const DEFAULT_SESSION_KEY_PREFIX: &str = "_openid_consumer_";

const TOKEN_KEY_SUFFIX: &str = "last_token";
const MANAGER_KEY_SUFFIX: &str = "manager";

/// The outcome of completing an authentication flow.
///
/// Callers dispatch on the variant; no field is meaningful across variants.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ConsumerResponse {
    /// Authentication verified. `identity_url` is the identity to log in.
    Success {
        /// The verified identity URL.
        identity_url: IdentityUrl,
        /// The signed subset of the assertion's arguments, keyed with their
        /// `openid.` prefix.
        signed_args: HashMap<String, String>,
    },
    /// The user declined to authenticate at the provider.
    Cancel {
        /// The identity the flow was attempting, when known.
        identity_url: Option<IdentityUrl>,
    },
    /// A protocol, transport, or verification error. The message is
    /// diagnostic and never carries secrets.
    Failure {
        /// The identity the flow was attempting, when known.
        identity_url: Option<IdentityUrl>,
        /// A human-readable description of what went wrong.
        message: Option<String>,
    },
    /// An immediate-mode provider needs user interaction; redirect the user
    /// to `setup_url` to continue.
    SetupNeeded {
        /// The identity the flow is attempting.
        identity_url: IdentityUrl,
        /// Where to send the user to complete setup.
        setup_url: Url,
    },
}

impl ConsumerResponse {
    /// The string status constant for this variant.
    pub fn status(&self) -> &'static str {
        match self {
            ConsumerResponse::Success { .. } => STATUS_SUCCESS,
            ConsumerResponse::Cancel { .. } => STATUS_CANCEL,
            ConsumerResponse::Failure { .. } => STATUS_FAILURE,
            ConsumerResponse::SetupNeeded { .. } => STATUS_SETUP_NEEDED,
        }
    }

    /// The identity URL attached to this response, when known.
    pub fn identity_url(&self) -> Option<&IdentityUrl> {
        match self {
            ConsumerResponse::Success { identity_url, .. }
            | ConsumerResponse::SetupNeeded { identity_url, .. } => Some(identity_url),
            ConsumerResponse::Cancel { identity_url }
            | ConsumerResponse::Failure { identity_url, .. } => identity_url.as_ref(),
        }
    }

    /// The failure message, for [`Failure`](Self::Failure) responses.
    pub fn message(&self) -> Option<&str> {
        match self {
            ConsumerResponse::Failure { message, .. } => message.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn failure(
        identity_url: Option<IdentityUrl>,
        message: impl Into<String>,
    ) -> Self {
        ConsumerResponse::Failure {
            identity_url,
            message: Some(message.into()),
        }
    }
}

/// The protocol engine: everything the consumer does that is not bound to a
/// particular request.
///
/// Holds the store, the HTTP fetcher, and tunables. Instances hold no
/// per-request state and may be shared across sequential requests. The
/// consumer operates in smart mode unless the store reports itself dumb; a
/// dumb consumer never caches associations and verifies every assertion via
/// `check_authentication`.
pub struct GenericConsumer<S, F> {
    store: S,
    fetcher: F,
    token_lifetime: u64,
    dh_params: Option<(BigUint, BigUint)>,
    time_fn: Box<dyn Fn() -> u64>,
}

impl<S, F> GenericConsumer<S, F>
where
    S: ConsumerStore,
    F: Fetcher,
{
    /// Create a consumer over the given store and fetcher.
    pub fn new(store: S, fetcher: F) -> Self {
        Self {
            store,
            fetcher,
            token_lifetime: DEFAULT_TOKEN_LIFETIME,
            dh_params: None,
            time_fn: Box::new(|| Utc::now().timestamp().max(0) as u64),
        }
    }

    /// Override how long issued tokens remain valid, in seconds.
    pub fn set_token_lifetime(mut self, seconds: u64) -> Self {
        self.token_lifetime = seconds;
        self
    }

    /// Override the Diffie-Hellman modulus and generator offered when
    /// associating.
    pub fn set_dh_params(mut self, modulus: BigUint, generator: BigUint) -> Self {
        self.dh_params = Some((modulus, generator));
        self
    }

    /// Override the clock. Intended for tests.
    pub fn set_time_fn(mut self, time_fn: Box<dyn Fn() -> u64>) -> Self {
        self.time_fn = time_fn;
        self
    }

    /// Whether this consumer runs in dumb mode.
    pub fn is_dumb(&self) -> bool {
        self.store.is_dumb()
    }

    /// The store backing this consumer.
    pub fn store(&self) -> &S {
        &self.store
    }

    fn now(&self) -> u64 {
        (self.time_fn)()
    }

    fn token_codec(&self) -> TokenCodec {
        TokenCodec::new(self.store.get_auth_key(), self.token_lifetime)
    }

    /// Start an authentication flow against an already-discovered endpoint.
    ///
    /// Generates and stores a fresh nonce, signs the inter-request token,
    /// and negotiates (or reuses) an association. The caller is responsible
    /// for persisting [`AuthRequest::token`] in the user's session.
    pub fn begin(&self, endpoint: &ServiceEndpoint) -> AuthRequest {
        let now = self.now();
        let nonce = Nonce::new_random();
        self.store.store_nonce(&nonce);

        let token = self.token_codec().sign(
            now,
            endpoint.identity_url().as_str(),
            endpoint.server_id().as_str(),
            endpoint.server_url().as_str(),
        );
        let association = AssociationEngine::new(
            &self.store,
            &self.fetcher,
            self.token_lifetime,
            self.dh_params.as_ref(),
        )
        .get_association(endpoint.server_url(), true, now);
        if association.is_none() {
            debug!(
                "no association with {}; proceeding in dumb mode",
                endpoint.server_url().as_str()
            );
        }

        AuthRequest::new(endpoint.clone(), association, token, nonce)
    }

    /// Interpret the query the provider sent back through the user's
    /// browser. `token` is the inter-request token issued by
    /// [`begin`](Self::begin), read back from the session.
    pub fn complete(
        &self,
        query: &HashMap<String, String>,
        token: Option<&str>,
    ) -> ConsumerResponse {
        let Some(token) = token else {
            return ConsumerResponse::failure(None, "No session state found");
        };
        let now = self.now();
        let payload = self.token_codec().verify(now, token);
        let identity_url = payload
            .as_ref()
            .ok()
            .and_then(|payload| IdentityUrl::new(payload.identity_url.clone()).ok());

        let mode = query.get("openid.mode").map(String::as_str).unwrap_or("");
        match mode {
            "cancel" => ConsumerResponse::Cancel { identity_url },
            "error" => ConsumerResponse::Failure {
                identity_url,
                message: query.get("openid.error").cloned(),
            },
            "id_res" => {
                let Ok(payload) = payload else {
                    return ConsumerResponse::failure(None, "No session state found");
                };
                let response = ResponseVerifier::new(&self.store, &self.fetcher, now)
                    .verify_id_res(query, &payload);
                if let ConsumerResponse::Success { .. } = &response {
                    let return_to = query
                        .get("openid.return_to")
                        .map(String::as_str)
                        .unwrap_or("");
                    if let Err(message) = check_nonce(&self.store, query, return_to) {
                        return ConsumerResponse::failure(identity_url, message);
                    }
                }
                response
            }
            other => ConsumerResponse::failure(
                identity_url,
                format!("Invalid openid.mode '{}'", other),
            ),
        }
    }
}

/// The per-request facade: one instance per HTTP request.
///
/// Binds a shared [`GenericConsumer`] to the request's session and a
/// discovery collaborator, and keeps exactly the most recent outstanding
/// token in the session under `"<prefix>last_token"`.
pub struct Consumer<'a, S, F, D> {
    consumer: &'a GenericConsumer<S, F>,
    session: &'a mut dyn Session,
    discovery: &'a mut D,
    session_key_prefix: String,
}

impl<'a, S, F, D> Consumer<'a, S, F, D>
where
    S: ConsumerStore,
    F: Fetcher,
    D: Discovery,
{
    /// Bind a consumer to this request's session and discovery driver.
    pub fn new(
        consumer: &'a GenericConsumer<S, F>,
        session: &'a mut dyn Session,
        discovery: &'a mut D,
    ) -> Self {
        Self {
            consumer,
            session,
            discovery,
            session_key_prefix: DEFAULT_SESSION_KEY_PREFIX.to_string(),
        }
    }

    /// Override the prefix for the session keys this facade manages.
    pub fn set_session_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.session_key_prefix = prefix.into();
        self
    }

    fn token_key(&self) -> String {
        format!("{}{}", self.session_key_prefix, TOKEN_KEY_SUFFIX)
    }

    fn manager_key(&self) -> String {
        format!("{}{}", self.session_key_prefix, MANAGER_KEY_SUFFIX)
    }

    fn read_manager(&self) -> Option<DiscoveryManager> {
        self.session
            .get(&self.manager_key())
            .and_then(|raw| serde_json::from_str(&raw).ok())
    }

    fn write_manager(&mut self, manager: &DiscoveryManager) {
        match serde_json::to_string(manager) {
            Ok(raw) => self.session.set(&self.manager_key(), raw),
            Err(err) => warn!("could not serialize discovery manager: {}", err),
        }
    }

    /// Start an authentication flow for a user-supplied identifier.
    ///
    /// Normalizes the identifier, drives discovery, and returns the
    /// [`AuthRequest`] to render as a redirect — or `None` when no provider
    /// endpoint could be found. The inter-request token is written into the
    /// session before returning.
    pub fn begin(&mut self, user_url: &str) -> Option<AuthRequest> {
        let identifier = match normalize_identifier(user_url) {
            Ok(identifier) => identifier,
            Err(err) => {
                warn!("rejecting identifier {:?}: {}", user_url, err);
                return None;
            }
        };

        // Discard any manager a crashed or abandoned begin left behind.
        if let Some(manager) = self.read_manager() {
            if manager.stale || manager.identifier != identifier.as_str() {
                self.discovery.cleanup(&manager.identifier);
                self.session.del(&self.manager_key());
            }
        }

        // Stale until an endpoint is in hand; a crash in between makes the
        // next begin discard this manager.
        self.write_manager(&DiscoveryManager {
            identifier: identifier.as_str().to_string(),
            stale: true,
        });

        let endpoint = match self.discovery.next_endpoint(identifier.as_str()) {
            Ok(Some(endpoint)) => endpoint,
            Ok(None) => {
                debug!("no provider endpoint found for {}", identifier.as_str());
                self.session.del(&self.manager_key());
                return None;
            }
            Err(err) => {
                warn!("discovery for {} failed: {}", identifier.as_str(), err);
                self.session.del(&self.manager_key());
                return None;
            }
        };

        self.write_manager(&DiscoveryManager {
            identifier: identifier.as_str().to_string(),
            stale: false,
        });

        let request = self.consumer.begin(&endpoint);
        self.session.set(&self.token_key(), request.token().to_string());
        Some(request)
    }

    /// Complete an authentication flow from the query the provider sent
    /// back through the user's browser.
    ///
    /// The session token is consumed regardless of outcome; a second
    /// `complete` against the same session reports missing state.
    pub fn complete(&mut self, query: &HashMap<String, String>) -> ConsumerResponse {
        let token = self.session.get(&self.token_key());
        let response = self.consumer.complete(query, token.as_deref());
        self.session.del(&self.token_key());

        let concluded = matches!(
            &response,
            ConsumerResponse::Success { .. }
                | ConsumerResponse::Cancel {
                    identity_url: Some(_)
                }
        );
        if concluded {
            if let Some(manager) = self.read_manager() {
                self.discovery.cleanup(&manager.identifier);
            }
            self.session.del(&self.manager_key());
        }

        response
    }
}
