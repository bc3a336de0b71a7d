//! The discovery contract.
//!
//! Resolving a user-supplied identifier to a provider endpoint (Yadis, HTML
//! link discovery, redirect chasing) lives behind the [`Discovery`] trait;
//! the consumer core only consumes the endpoints it yields. The core does
//! own identifier normalization and the session-persisted
//! [`DiscoveryManager`] bookkeeping that lets a retried `begin` move on to
//! the next candidate endpoint.

use crate::types::{IdentityUrl, ServerUrl};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Characters that introduce an XRI global context symbol.
const XRI_GLOBAL_SYMBOLS: &[char] = &['=', '@', '+', '$', '!', '('];

/// Error resolving an identifier to a provider endpoint.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum DiscoveryError {
    /// The identifier could not be parsed as a URL or XRI.
    #[error("Unparseable identifier: {0}")]
    UnparseableIdentifier(String),
    /// The identifier's document could not be fetched.
    #[error("Discovery transport failure: {0}")]
    Transport(String),
    /// The fetched document could not be interpreted.
    #[error("Other discovery error: {0}")]
    Other(String),
}

/// A discovered provider endpoint: the provider URL plus the identifiers it
/// will sign assertions for.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct ServiceEndpoint {
    identity_url: IdentityUrl,
    server_id: IdentityUrl,
    server_url: ServerUrl,
}

impl ServiceEndpoint {
    /// Create an endpoint from its three URLs.
    pub fn new(identity_url: IdentityUrl, server_id: IdentityUrl, server_url: ServerUrl) -> Self {
        Self {
            identity_url,
            server_id,
            server_url,
        }
    }

    /// The canonical URL the user claims, and the user-visible result of a
    /// successful login.
    pub fn identity_url(&self) -> &IdentityUrl {
        &self.identity_url
    }

    /// The identity the provider knows the user by (the "delegate"). Often
    /// equal to [`identity_url`](Self::identity_url).
    pub fn server_id(&self) -> &IdentityUrl {
        &self.server_id
    }

    /// The provider endpoint URL.
    pub fn server_url(&self) -> &ServerUrl {
        &self.server_url
    }
}

/// Yields candidate [`ServiceEndpoint`]s for an identifier, one per call.
pub trait Discovery {
    /// Resolve the next untried endpoint for `identifier`, or `None` when
    /// the candidates are exhausted.
    fn next_endpoint(&mut self, identifier: &str)
        -> Result<Option<ServiceEndpoint>, DiscoveryError>;

    /// Discard any state retained for `identifier`. Called when an
    /// authentication attempt concludes or is abandoned.
    fn cleanup(&mut self, identifier: &str) {
        let _ = identifier;
    }
}

/// Per-identifier discovery bookkeeping, serialized into the session by the
/// facade.
///
/// The facade marks the manager stale before driving discovery and clears
/// the flag once an endpoint is in hand; a crash between those two points
/// causes the next `begin` to discard the half-initialized manager.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DiscoveryManager {
    /// The normalized identifier discovery was started for.
    pub identifier: String,
    /// Whether this manager is mid-initialization and untrustworthy.
    pub stale: bool,
}

/// A user-supplied identifier, classified for discovery.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Identifier {
    /// A URL identifier, normalized.
    Url(String),
    /// An XRI identifier, passed through untouched.
    Xri(String),
}

impl Identifier {
    /// The identifier string handed to the discovery collaborator.
    pub fn as_str(&self) -> &str {
        match self {
            Identifier::Url(s) | Identifier::Xri(s) => s,
        }
    }
}

/// Classify and normalize a user-supplied identifier.
///
/// XRIs (an `xri://` prefix or a leading global context symbol) pass through
/// untouched. URL identifiers get a forced `http` scheme when none is
/// present and any fragment stripped; host normalization falls out of URL
/// parsing.
pub fn normalize_identifier(user_input: &str) -> Result<Identifier, DiscoveryError> {
    let trimmed = user_input.trim();
    if trimmed.is_empty() {
        return Err(DiscoveryError::UnparseableIdentifier(user_input.to_string()));
    }

    if let Some(rest) = trimmed.strip_prefix("xri://") {
        return Ok(Identifier::Xri(rest.to_string()));
    }
    if trimmed.starts_with(XRI_GLOBAL_SYMBOLS) {
        return Ok(Identifier::Xri(trimmed.to_string()));
    }

    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    };
    let mut url = Url::parse(&with_scheme)
        .map_err(|_| DiscoveryError::UnparseableIdentifier(user_input.to_string()))?;
    url.set_fragment(None);
    Ok(Identifier::Url(url.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn bare_host_gets_a_scheme_and_trailing_slash() {
        assert_eq!(
            normalize_identifier("example.com").unwrap(),
            Identifier::Url("http://example.com/".to_string())
        );
    }

    #[test]
    fn existing_scheme_is_preserved() {
        assert_eq!(
            normalize_identifier("https://example.com/user").unwrap(),
            Identifier::Url("https://example.com/user".to_string())
        );
    }

    #[test]
    fn fragment_is_stripped() {
        assert_eq!(
            normalize_identifier("http://example.com/user#profile").unwrap(),
            Identifier::Url("http://example.com/user".to_string())
        );
    }

    #[test]
    fn host_is_lowercased() {
        assert_eq!(
            normalize_identifier("Example.COM/User").unwrap(),
            Identifier::Url("http://example.com/User".to_string())
        );
    }

    #[test]
    fn xri_forms_pass_through() {
        assert_eq!(
            normalize_identifier("=example").unwrap(),
            Identifier::Xri("=example".to_string())
        );
        assert_eq!(
            normalize_identifier("xri://@example/unit").unwrap(),
            Identifier::Xri("@example/unit".to_string())
        );
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(matches!(
            normalize_identifier("   "),
            Err(DiscoveryError::UnparseableIdentifier(_))
        ));
    }

    #[test]
    fn manager_round_trips_through_json() {
        let manager = DiscoveryManager {
            identifier: "http://example.com/".to_string(),
            stale: true,
        };
        let encoded = serde_json::to_string(&manager).unwrap();
        assert_eq!(
            serde_json::from_str::<DiscoveryManager>(&encoded).unwrap(),
            manager
        );
    }
}
