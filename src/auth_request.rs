//! Assembling the browser redirect that sends the user to their provider.

use crate::association::Association;
use crate::discovery::ServiceEndpoint;
use crate::types::{Nonce, ReturnTo, TrustRoot};

use url::Url;

/// An in-progress authentication request, produced by `begin`.
///
/// Holds everything phase one decided: the selected endpoint, the
/// association to sign under (absent in dumb mode), the signed
/// inter-request token, and the nonce that will ride along on the
/// `return_to` URL. Callers may attach extension arguments before
/// rendering the redirect.
#[derive(Debug)]
pub struct AuthRequest {
    endpoint: ServiceEndpoint,
    association: Option<Association>,
    token: String,
    nonce: Nonce,
    extra_args: Vec<(String, String)>,
    return_to_args: Vec<(String, String)>,
}

impl AuthRequest {
    pub(crate) fn new(
        endpoint: ServiceEndpoint,
        association: Option<Association>,
        token: String,
        nonce: Nonce,
    ) -> Self {
        let return_to_args = vec![("nonce".to_string(), nonce.secret().clone())];
        Self {
            endpoint,
            association,
            token,
            nonce,
            extra_args: Vec::new(),
            return_to_args,
        }
    }

    /// The endpoint this request will authenticate against.
    pub fn endpoint(&self) -> &ServiceEndpoint {
        &self.endpoint
    }

    /// The signed inter-request token the facade stores in the session.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// The nonce embedded in the `return_to` URL.
    pub fn nonce(&self) -> &Nonce {
        &self.nonce
    }

    /// Whether an association backs this request. When `false`, the
    /// redirect omits `openid.assoc_handle` and verification will go
    /// through `check_authentication`.
    pub fn has_association(&self) -> bool {
        self.association.is_some()
    }

    /// Record an extension argument to send along with the request as
    /// `openid.<namespace>.<key>`. Namespaces and keys are opaque strings.
    pub fn add_extension_arg(
        mut self,
        namespace: impl AsRef<str>,
        key: impl AsRef<str>,
        value: impl Into<String>,
    ) -> Self {
        self.extra_args.push((
            format!("openid.{}.{}", namespace.as_ref(), key.as_ref()),
            value.into(),
        ));
        self
    }

    /// Render the provider redirect URL.
    ///
    /// `return_to` keeps any query string it already carries; the
    /// request's return-to arguments (the nonce) are appended to it.
    /// Extension arguments are merged in last.
    pub fn redirect_url(&self, trust_root: &TrustRoot, return_to: &ReturnTo, immediate: bool) -> Url {
        let mut return_to = return_to.url().clone();
        return_to
            .query_pairs_mut()
            .extend_pairs(self.return_to_args.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        let mode = if immediate {
            "checkid_immediate"
        } else {
            "checkid_setup"
        };

        let mut redirect = self.endpoint.server_url().url().clone();
        {
            let mut pairs = redirect.query_pairs_mut();
            pairs
                .append_pair("openid.mode", mode)
                .append_pair("openid.identity", self.endpoint.server_id().as_str())
                .append_pair("openid.return_to", return_to.as_str())
                .append_pair("openid.trust_root", trust_root.as_str());
            if let Some(association) = &self.association {
                pairs.append_pair("openid.assoc_handle", association.handle().as_str());
            }
            for (key, value) in &self.extra_args {
                pairs.append_pair(key, value);
            }
        }
        redirect
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::{Association, AssociationType};
    use crate::types::{AssociationHandle, IdentityUrl, MacKey, ServerUrl};

    use std::collections::HashMap;

    fn endpoint() -> ServiceEndpoint {
        ServiceEndpoint::new(
            IdentityUrl::new("http://example.com/".to_string()).unwrap(),
            IdentityUrl::new("http://example.com/delegate".to_string()).unwrap(),
            ServerUrl::new("https://op.example/".to_string()).unwrap(),
        )
    }

    fn request(association: Option<Association>) -> AuthRequest {
        AuthRequest::new(
            endpoint(),
            association,
            "token".to_string(),
            Nonce::new("abcdefgh".to_string()),
        )
    }

    fn query_map(url: &Url) -> HashMap<String, String> {
        url.query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    #[test]
    fn redirect_carries_the_core_parameters() {
        let association = Association::new(
            AssociationHandle::new("H".to_string()),
            MacKey::new(vec![0u8; 20]),
            AssociationType::HmacSha1,
            1000,
            3600,
        );
        let url = request(Some(association)).redirect_url(
            &TrustRoot::new("http://rp/".to_string()).unwrap(),
            &ReturnTo::new("http://rp/return".to_string()).unwrap(),
            false,
        );
        assert!(url.as_str().starts_with("https://op.example/?"));

        let args = query_map(&url);
        assert_eq!(args.get("openid.mode").unwrap(), "checkid_setup");
        assert_eq!(args.get("openid.identity").unwrap(), "http://example.com/delegate");
        assert_eq!(args.get("openid.trust_root").unwrap(), "http://rp/");
        assert_eq!(args.get("openid.assoc_handle").unwrap(), "H");
        assert_eq!(
            args.get("openid.return_to").unwrap(),
            "http://rp/return?nonce=abcdefgh"
        );
    }

    #[test]
    fn immediate_mode_switches_the_mode_parameter() {
        let url = request(None).redirect_url(
            &TrustRoot::new("http://rp/".to_string()).unwrap(),
            &ReturnTo::new("http://rp/return".to_string()).unwrap(),
            true,
        );
        let args = query_map(&url);
        assert_eq!(args.get("openid.mode").unwrap(), "checkid_immediate");
    }

    #[test]
    fn dumb_request_omits_the_association_handle() {
        let url = request(None).redirect_url(
            &TrustRoot::new("http://rp/".to_string()).unwrap(),
            &ReturnTo::new("http://rp/return".to_string()).unwrap(),
            false,
        );
        assert!(!query_map(&url).contains_key("openid.assoc_handle"));
    }

    #[test]
    fn existing_return_to_query_is_preserved() {
        let url = request(None).redirect_url(
            &TrustRoot::new("http://rp/".to_string()).unwrap(),
            &ReturnTo::new("http://rp/return?session=42".to_string()).unwrap(),
            false,
        );
        let args = query_map(&url);
        assert_eq!(
            args.get("openid.return_to").unwrap(),
            "http://rp/return?session=42&nonce=abcdefgh"
        );
    }

    #[test]
    fn extension_args_are_merged_last() {
        let url = request(None)
            .add_extension_arg("sreg", "required", "email")
            .redirect_url(
                &TrustRoot::new("http://rp/".to_string()).unwrap(),
                &ReturnTo::new("http://rp/return".to_string()).unwrap(),
                false,
            );
        let args = query_map(&url);
        assert_eq!(args.get("openid.sreg.required").unwrap(), "email");
    }
}
