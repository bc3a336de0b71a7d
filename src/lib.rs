#![warn(missing_docs)]
//!
//! [OpenID 1.1](http://openid.net/specs/openid-authentication-1_1.html) Relying Party
//! (consumer) library.
//!
//! This library implements the consumer side of the OpenID 1.1 protocol:
//! given a user-supplied identifier, it discovers the provider endpoint,
//! negotiates (or reuses) a shared secret with it, constructs the
//! browser-redirect authentication request, and later verifies the signed
//! assertion the provider returns via the user's browser.
//!
//! # Contents
//!  * [Collaborators](#collaborators)
//!  * [Getting started: the two-phase flow](#getting-started-the-two-phase-flow)
//!  * [Smart and dumb mode](#smart-and-dumb-mode)
//!  * [Comparing secrets securely](#comparing-secrets-securely)
//!
//! # Collaborators
//!
//! The core is transport- and storage-agnostic. Four pluggable
//! collaborators connect it to an application:
//!
//!  * **[`ConsumerStore`]** — associations, nonces, and the process-wide
//!    token key. [`MemoryStore`] is a baseline single-process
//!    implementation.
//!  * **[`Fetcher`]** — one blocking HTTP POST. Automatically implemented
//!    for closures of the form `Fn(&Url, &[u8]) -> Result<HttpResponse, E>`.
//!  * **[`Session`]** — a three-method string key/value store tied to the
//!    user's browser session. [`MemorySession`] is the baseline.
//!  * **[`Discovery`]** — resolves an identifier to [`ServiceEndpoint`]s.
//!    Yadis/HTML discovery is out of scope for the core; servers under test
//!    can implement this trait directly.
//!
//! ## Security Warning
//!
//! To prevent
//! [SSRF](https://cheatsheetseries.owasp.org/cheatsheets/Server_Side_Request_Forgery_Prevention_Cheat_Sheet.html)
//! vulnerabilities, configure the HTTP client behind your [`Fetcher`]
//! **not to follow redirects** when talking to untrusted provider
//! endpoints.
//!
//! # Getting started: the two-phase flow
//!
//! ```rust,no_run
//! use openid_consumer::{
//!     Consumer, ConsumerResponse, Discovery, DiscoveryError, GenericConsumer, HttpResponse,
//!     MemorySession, MemoryStore, ReturnTo, ServiceEndpoint, TrustRoot,
//! };
//! use url::Url;
//!
//! # struct MyDiscovery;
//! # impl Discovery for MyDiscovery {
//! #     fn next_endpoint(
//! #         &mut self,
//! #         _identifier: &str,
//! #     ) -> Result<Option<ServiceEndpoint>, DiscoveryError> {
//! #         Ok(None)
//! #     }
//! # }
//! # fn fetch(_url: &Url, _body: &[u8]) -> Result<HttpResponse, std::io::Error> {
//! #     unimplemented!()
//! # }
//! # fn main() {
//! let consumer = GenericConsumer::new(MemoryStore::new(), fetch);
//! let mut session = MemorySession::new();
//! let mut discovery = MyDiscovery;
//!
//! // Phase one: the user submitted their identifier. Redirect them to
//! // their provider.
//! let mut facade = Consumer::new(&consumer, &mut session, &mut discovery);
//! if let Some(request) = facade.begin("example.com") {
//!     let redirect = request.redirect_url(
//!         &TrustRoot::new("https://rp.example/".to_string()).unwrap(),
//!         &ReturnTo::new("https://rp.example/return".to_string()).unwrap(),
//!         false,
//!     );
//!     println!("redirect the browser to: {}", redirect);
//! }
//!
//! // Phase two: the provider redirected the browser back to the return-to
//! // URL. Hand the query parameters to `complete`.
//! let query = std::collections::HashMap::new(); // parsed from the request
//! let mut facade = Consumer::new(&consumer, &mut session, &mut discovery);
//! match facade.complete(&query) {
//!     ConsumerResponse::Success { identity_url, .. } => {
//!         println!("logged in as {}", identity_url);
//!     }
//!     ConsumerResponse::Cancel { .. } => println!("user declined"),
//!     ConsumerResponse::SetupNeeded { setup_url, .. } => {
//!         println!("redirect to {} to finish setup", setup_url);
//!     }
//!     response => println!("failed: {:?}", response.message()),
//! }
//! # }
//! ```
//!
//! # Smart and dumb mode
//!
//! A consumer backed by a persistent store runs in **smart** mode: it
//! negotiates an association (a shared HMAC-SHA1 key) with each provider
//! once, over a Diffie-Hellman exchange, and verifies assertion signatures
//! locally. A store that cannot retain state
//! ([`ConsumerStore::is_dumb`]) forces **dumb** mode: no association is
//! sent with the authentication request, and every assertion is verified by
//! asking the provider directly via `check_authentication`. Both modes
//! converge on the same [`ConsumerResponse`] contract, and both are closed
//! against replay by single-use nonces.
//!
//! # Comparing secrets securely
//!
//! Assertion signatures and inter-request token MACs are verified with
//! constant-time comparisons to avoid
//! [timing side-channels](https://en.wikipedia.org/wiki/Timing_attack); the
//! secret-bearing types in this crate redact their contents from `Debug`
//! output and deliberately gate access behind an explicit `secret()` call.

// Defined first since other modules need the macros, and definition order is
// significant for macros. This module is private.
#[macro_use]
mod macros;

mod association;
mod auth_request;
mod consumer;
mod crypto;
mod discovery;
mod http;
mod kvform;
mod session;
mod store;
mod token;
mod types;
mod verification;

/// The newline/colon key-value form codec used for direct provider
/// communication.
pub mod kv {
    pub use crate::kvform::{encode, parse, parse_map, KvError};
}

pub use crate::association::{Association, AssociationType};
pub use crate::auth_request::AuthRequest;
pub use crate::consumer::{
    Consumer, ConsumerResponse, GenericConsumer, DEFAULT_SESSION_KEY_PREFIX, STATUS_CANCEL,
    STATUS_FAILURE, STATUS_SETUP_NEEDED, STATUS_SUCCESS,
};
pub use crate::crypto::{btwoc, btwoc_decode, default_modulus, hmac_sha1, sha1, DhError, DiffieHellman};
pub use crate::discovery::{
    normalize_identifier, Discovery, DiscoveryError, DiscoveryManager, Identifier, ServiceEndpoint,
};
pub use crate::http::{Fetcher, HttpResponse};
pub use crate::session::{MemorySession, Session};
pub use crate::store::{ConsumerStore, MemoryStore};
pub use crate::token::{TokenCodec, TokenError, TokenPayload, DEFAULT_TOKEN_LIFETIME};
pub use crate::types::{
    AssociationHandle, AuthKey, IdentityUrl, MacKey, Nonce, ReturnTo, ServerUrl, TrustRoot,
};

/// Public re-export of the [`url`] crate used throughout the public
/// interface.
pub use url;
