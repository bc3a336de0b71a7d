//! Verification of the provider's `id_res` assertion.
//!
//! A smart-mode consumer checks the assertion's HMAC-SHA1 signature locally
//! against the association it negotiated earlier. When the asserted handle
//! is unknown (the association was never cached, has been evicted, or the
//! consumer is dumb), verification falls back to asking the provider
//! directly via `check_authentication`. Both paths converge on the same
//! response contract, followed by single-use nonce redemption.

use crate::consumer::ConsumerResponse;
use crate::crypto::hmac_sha1_verify;
use crate::http::Fetcher;
use crate::kvform;
use crate::store::ConsumerStore;
use crate::token::TokenPayload;
use crate::types::{AssociationHandle, IdentityUrl, Nonce, ServerUrl};

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use log::warn;
use url::Url;

use std::collections::{HashMap, HashSet};

/// Response fields mirrored into a `check_authentication` request whether or
/// not the provider listed them as signed.
const CHECK_AUTH_EXTRA_FIELDS: [&str; 4] = ["assoc_handle", "sig", "signed", "invalidate_handle"];

/// Verifies `id_res` assertions for a store/fetcher pair.
pub(crate) struct ResponseVerifier<'a, S: ?Sized, F: ?Sized> {
    store: &'a S,
    fetcher: &'a F,
    now: u64,
}

impl<'a, S, F> ResponseVerifier<'a, S, F>
where
    S: ConsumerStore + ?Sized,
    F: Fetcher + ?Sized,
{
    pub(crate) fn new(store: &'a S, fetcher: &'a F, now: u64) -> Self {
        Self { store, fetcher, now }
    }

    /// Verify an `id_res` response against the token payload issued in
    /// phase one. The token must already have verified.
    pub(crate) fn verify_id_res(
        &self,
        query: &HashMap<String, String>,
        payload: &TokenPayload,
    ) -> ConsumerResponse {
        let identity_url = match IdentityUrl::new(payload.identity_url.clone()) {
            Ok(url) => url,
            Err(_) => {
                return ConsumerResponse::failure(None, "Malformed identity URL in session token")
            }
        };

        // An immediate-mode provider that needs user interaction defers with
        // a setup URL instead of an assertion.
        if let Some(setup_url) = query.get("openid.user_setup_url") {
            return match Url::parse(setup_url) {
                Ok(setup_url) => ConsumerResponse::SetupNeeded {
                    identity_url,
                    setup_url,
                },
                Err(_) => ConsumerResponse::failure(
                    Some(identity_url),
                    "Malformed openid.user_setup_url",
                ),
            };
        }

        let required = ["openid.return_to", "openid.identity", "openid.assoc_handle"];
        if required.iter().any(|field| !query.contains_key(*field)) {
            return ConsumerResponse::failure(Some(identity_url), "Missing required field");
        }

        // A hostile provider must not be able to switch the asserted
        // identity away from the delegate selected in phase one.
        if query["openid.identity"] != payload.server_id {
            return ConsumerResponse::failure(
                Some(identity_url),
                "Server ID (delegate) mismatch",
            );
        }

        let server_url = match ServerUrl::new(payload.server_url.clone()) {
            Ok(url) => url,
            Err(_) => {
                return ConsumerResponse::failure(
                    Some(identity_url),
                    "Malformed server URL in session token",
                )
            }
        };
        let handle = AssociationHandle::new(query["openid.assoc_handle"].clone());

        let association = match self.store.get_association(&server_url, Some(&handle)) {
            None => {
                // Unknown handle: either we never held it (dumb mode) or it
                // was evicted. Ask the provider directly.
                return if self.check_authentication(query, &server_url) {
                    ConsumerResponse::Success {
                        identity_url,
                        signed_args: signed_args(query),
                    }
                } else {
                    ConsumerResponse::failure(
                        Some(identity_url),
                        "Server denied check_authentication",
                    )
                };
            }
            Some(association) => association,
        };

        if association.expires_in(self.now) <= 0 {
            return ConsumerResponse::failure(
                Some(identity_url),
                format!("Association with {} expired", server_url.as_str()),
            );
        }

        let (sig, signed) = match (query.get("openid.sig"), query.get("openid.signed")) {
            (Some(sig), Some(signed)) => (sig, signed),
            _ => {
                return ConsumerResponse::failure(
                    Some(identity_url),
                    "Missing argument signature",
                )
            }
        };

        // Reconstruct the signed payload in exactly the order the provider
        // listed; any other order silently breaks verification.
        let pairs: Vec<(String, String)> = signed
            .trim()
            .split(',')
            .map(|name| {
                let value = query
                    .get(&format!("openid.{}", name))
                    .cloned()
                    .unwrap_or_default();
                (name.to_string(), value)
            })
            .collect();
        let kv_bytes = match kvform::encode(&pairs) {
            Ok(bytes) => bytes,
            Err(_) => return ConsumerResponse::failure(Some(identity_url), "Bad signature"),
        };
        let provided_sig = match BASE64_STANDARD.decode(sig) {
            Ok(bytes) => bytes,
            Err(_) => return ConsumerResponse::failure(Some(identity_url), "Bad signature"),
        };
        if !hmac_sha1_verify(association.secret().secret(), &kv_bytes, &provided_sig) {
            return ConsumerResponse::failure(Some(identity_url), "Bad signature");
        }

        ConsumerResponse::Success {
            identity_url,
            signed_args: signed_args(query),
        }
    }

    /// Ask the provider to verify its own assertion (dumb-mode recovery).
    ///
    /// Mirrors back every parameter whose unprefixed name the provider
    /// listed as signed, plus the verification bookkeeping fields, with the
    /// mode rewritten to `check_authentication`. Returns whether the
    /// provider answered `is_valid:true`; an `invalidate_handle` in the
    /// answer evicts the named association.
    pub(crate) fn check_authentication(
        &self,
        query: &HashMap<String, String>,
        server_url: &ServerUrl,
    ) -> bool {
        let mut mirrored: HashSet<&str> = query
            .get("openid.signed")
            .map(|signed| signed.trim().split(',').collect())
            .unwrap_or_default();
        mirrored.extend(CHECK_AUTH_EXTRA_FIELDS);

        let mut params: Vec<(String, String)> = query
            .iter()
            .filter(|(key, _)| {
                key.strip_prefix("openid.")
                    .is_some_and(|name| name != "mode" && mirrored.contains(name))
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        params.sort();
        params.push((
            "openid.mode".to_string(),
            "check_authentication".to_string(),
        ));

        let body = match kvform::encode(&params) {
            Ok(body) => body,
            Err(err) => {
                warn!("could not encode check_authentication request: {}", err);
                return false;
            }
        };
        let response = match self.fetcher.post(server_url.url(), &body) {
            Ok(response) => response,
            Err(err) => {
                warn!(
                    "check_authentication transport failure for {}: {}",
                    server_url.as_str(),
                    err
                );
                return false;
            }
        };
        if response.status_code != http::StatusCode::OK {
            warn!(
                "check_authentication returned HTTP status {} from {}",
                response.status_code,
                server_url.as_str()
            );
            return false;
        }

        let results = kvform::parse_map(&response.body);
        if let Some(handle) = results.get("invalidate_handle") {
            // The provider says its own cached handle is dead.
            self.store
                .remove_association(server_url, &AssociationHandle::new(handle.clone()));
        }
        results.get("is_valid").map(String::as_str) == Some("true")
    }
}

/// Extract the signed subset of an assertion's arguments, keyed with their
/// `openid.` prefix.
fn signed_args(query: &HashMap<String, String>) -> HashMap<String, String> {
    query
        .get("openid.signed")
        .map(|signed| {
            signed
                .trim()
                .split(',')
                .filter_map(|name| {
                    let key = format!("openid.{}", name);
                    query.get(&key).map(|value| (key, value.clone()))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Validate the return-to nonce on a prospective success and redeem it.
///
/// `return_to` is the `openid.return_to` the provider asserted; `query` is
/// the full set of arguments the browser delivered, which carries the nonce
/// the provider echoed back. The store redemption is an atomic
/// check-and-remove, so a replayed assertion fails here even though its
/// signature still verifies.
pub(crate) fn check_nonce<S: ConsumerStore + ?Sized>(
    store: &S,
    query: &HashMap<String, String>,
    return_to: &str,
) -> Result<(), &'static str> {
    let url = Url::parse(return_to).map_err(|_| "Nonce missing from return_to")?;
    let nonce = url
        .query_pairs()
        .find(|(key, _)| key == "nonce")
        .map(|(_, value)| value.into_owned())
        .ok_or("Nonce missing from return_to")?;

    if query.get("nonce") != Some(&nonce) {
        return Err("Nonce mismatch");
    }

    if !store.use_nonce(&Nonce::new(nonce)) {
        return Err("Nonce missing from store");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::{Association, AssociationType};
    use crate::crypto::hmac_sha1;
    use crate::http::HttpResponse;
    use crate::store::MemoryStore;
    use crate::types::MacKey;

    use std::convert::Infallible;

    const NOW: u64 = 10_000;

    fn server_url() -> ServerUrl {
        ServerUrl::new("https://op.example/".to_string()).unwrap()
    }

    fn payload() -> TokenPayload {
        TokenPayload {
            timestamp: NOW - 10,
            identity_url: "http://example.com/".to_string(),
            server_id: "http://example.com/".to_string(),
            server_url: "https://op.example/".to_string(),
        }
    }

    fn mac_key() -> Vec<u8> {
        vec![0u8; 20]
    }

    fn store_with_association() -> MemoryStore {
        let store = MemoryStore::new();
        store.store_association(
            &server_url(),
            Association::new(
                AssociationHandle::new("H".to_string()),
                MacKey::new(mac_key()),
                AssociationType::HmacSha1,
                NOW - 100,
                3600,
            ),
        );
        store
    }

    fn no_fetcher() -> impl Fn(&Url, &[u8]) -> Result<HttpResponse, Infallible> {
        |_url, _body| panic!("no HTTP round trip expected")
    }

    /// A correctly signed `id_res` query for the association above.
    fn signed_query() -> HashMap<String, String> {
        let mut query: HashMap<String, String> = [
            ("openid.mode", "id_res"),
            ("openid.identity", "http://example.com/"),
            ("openid.return_to", "http://rp/return?nonce=abcdefgh"),
            ("openid.assoc_handle", "H"),
            ("openid.signed", "mode,identity,return_to"),
            ("nonce", "abcdefgh"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let kv = kvform::encode(&[
            ("mode", query["openid.mode"].as_str()),
            ("identity", query["openid.identity"].as_str()),
            ("return_to", query["openid.return_to"].as_str()),
        ])
        .unwrap();
        let sig = BASE64_STANDARD.encode(hmac_sha1(&mac_key(), &kv));
        query.insert("openid.sig".to_string(), sig);
        query
    }

    #[test]
    fn valid_signature_is_accepted() {
        let store = store_with_association();
        let fetcher = no_fetcher();
        let verifier = ResponseVerifier::new(&store, &fetcher, NOW);
        let response = verifier.verify_id_res(&signed_query(), &payload());
        match response {
            ConsumerResponse::Success {
                identity_url,
                signed_args,
            } => {
                assert_eq!(identity_url.as_str(), "http://example.com/");
                assert_eq!(
                    signed_args.get("openid.identity").map(String::as_str),
                    Some("http://example.com/")
                );
                assert!(!signed_args.contains_key("openid.sig"));
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[test]
    fn mutating_any_signed_field_rejects() {
        let store = store_with_association();
        let fetcher = no_fetcher();
        let verifier = ResponseVerifier::new(&store, &fetcher, NOW);

        for field in ["openid.return_to", "openid.sig"] {
            let mut query = signed_query();
            query.insert(field.to_string(), format!("{}x", query[field]));
            let response = verifier.verify_id_res(&query, &payload());
            assert_eq!(
                response.message(),
                Some("Bad signature"),
                "mutated {}",
                field
            );
        }

        // Reordering the signed list changes the payload and must also fail.
        let mut query = signed_query();
        query.insert(
            "openid.signed".to_string(),
            "identity,mode,return_to".to_string(),
        );
        let response = verifier.verify_id_res(&query, &payload());
        assert_eq!(response.message(), Some("Bad signature"));
    }

    #[test]
    fn identity_mismatch_rejects_even_with_a_valid_signature() {
        let store = store_with_association();
        let fetcher = no_fetcher();
        let verifier = ResponseVerifier::new(&store, &fetcher, NOW);

        let mut tampered = payload();
        tampered.server_id = "http://attacker.example/".to_string();
        let response = verifier.verify_id_res(&signed_query(), &tampered);
        assert_eq!(response.message(), Some("Server ID (delegate) mismatch"));
    }

    #[test]
    fn expired_association_is_never_used() {
        let store = MemoryStore::new();
        store.store_association(
            &server_url(),
            Association::new(
                AssociationHandle::new("H".to_string()),
                MacKey::new(mac_key()),
                AssociationType::HmacSha1,
                NOW - 7200,
                3600,
            ),
        );
        let fetcher = no_fetcher();
        let verifier = ResponseVerifier::new(&store, &fetcher, NOW);
        let response = verifier.verify_id_res(&signed_query(), &payload());
        assert_eq!(
            response.message(),
            Some("Association with https://op.example/ expired")
        );
    }

    #[test]
    fn missing_required_field_rejects() {
        let store = store_with_association();
        let fetcher = no_fetcher();
        let verifier = ResponseVerifier::new(&store, &fetcher, NOW);
        let mut query = signed_query();
        query.remove("openid.return_to");
        let response = verifier.verify_id_res(&query, &payload());
        assert_eq!(response.message(), Some("Missing required field"));
    }

    #[test]
    fn missing_signature_rejects() {
        let store = store_with_association();
        let fetcher = no_fetcher();
        let verifier = ResponseVerifier::new(&store, &fetcher, NOW);
        let mut query = signed_query();
        query.remove("openid.sig");
        let response = verifier.verify_id_res(&query, &payload());
        assert_eq!(response.message(), Some("Missing argument signature"));
    }

    #[test]
    fn setup_url_short_circuits() {
        let store = store_with_association();
        let fetcher = no_fetcher();
        let verifier = ResponseVerifier::new(&store, &fetcher, NOW);
        let mut query = signed_query();
        query.insert(
            "openid.user_setup_url".to_string(),
            "https://op.example/setup?x=1".to_string(),
        );
        match verifier.verify_id_res(&query, &payload()) {
            ConsumerResponse::SetupNeeded {
                identity_url,
                setup_url,
            } => {
                assert_eq!(identity_url.as_str(), "http://example.com/");
                assert_eq!(setup_url.as_str(), "https://op.example/setup?x=1");
            }
            other => panic!("expected setup needed, got {:?}", other),
        }
    }

    #[test]
    fn unknown_handle_falls_back_to_check_authentication() {
        let store = MemoryStore::new();
        let fetcher = |url: &Url, body: &[u8]| -> Result<HttpResponse, Infallible> {
            assert_eq!(url.as_str(), "https://op.example/");
            let request = kvform::parse_map(body);
            assert_eq!(
                request.get("openid.mode").map(String::as_str),
                Some("check_authentication")
            );
            assert_eq!(
                request.get("openid.assoc_handle").map(String::as_str),
                Some("H")
            );
            // The original mode is rewritten, not mirrored.
            assert_eq!(
                request.get("openid.signed").map(String::as_str),
                Some("mode,identity,return_to")
            );
            Ok(HttpResponse {
                status_code: http::StatusCode::OK,
                body: b"is_valid:true\n".to_vec(),
            })
        };
        let verifier = ResponseVerifier::new(&store, &fetcher, NOW);
        let response = verifier.verify_id_res(&signed_query(), &payload());
        assert_eq!(response.status(), "success");
    }

    #[test]
    fn check_authentication_denial_rejects() {
        let store = MemoryStore::new();
        let fetcher = |_url: &Url, _body: &[u8]| -> Result<HttpResponse, Infallible> {
            Ok(HttpResponse {
                status_code: http::StatusCode::OK,
                body: b"is_valid:false\n".to_vec(),
            })
        };
        let verifier = ResponseVerifier::new(&store, &fetcher, NOW);
        let response = verifier.verify_id_res(&signed_query(), &payload());
        assert_eq!(
            response.message(),
            Some("Server denied check_authentication")
        );
    }

    #[test]
    fn invalidate_handle_evicts_the_association() {
        let store = store_with_association();
        // Use an assertion handle the store does not know, so verification
        // consults the provider, which also invalidates the stored handle.
        let fetcher = |_url: &Url, _body: &[u8]| -> Result<HttpResponse, Infallible> {
            Ok(HttpResponse {
                status_code: http::StatusCode::OK,
                body: b"is_valid:true\ninvalidate_handle:H\n".to_vec(),
            })
        };
        let verifier = ResponseVerifier::new(&store, &fetcher, NOW);
        let mut query = signed_query();
        query.insert("openid.assoc_handle".to_string(), "stale".to_string());
        let response = verifier.verify_id_res(&query, &payload());
        assert_eq!(response.status(), "success");
        assert!(store
            .get_association(&server_url(), Some(&AssociationHandle::new("H".to_string())))
            .is_none());
    }

    #[test]
    fn nonce_redemption_is_single_use() {
        let store = MemoryStore::new();
        let nonce = Nonce::new("abcdefgh".to_string());
        store.store_nonce(&nonce);
        let query = signed_query();
        let return_to = query["openid.return_to"].clone();

        assert_eq!(check_nonce(&store, &query, &return_to), Ok(()));
        assert_eq!(
            check_nonce(&store, &query, &return_to),
            Err("Nonce missing from store")
        );
    }

    #[test]
    fn nonce_absent_from_return_to_rejects() {
        let store = MemoryStore::new();
        let query = signed_query();
        assert_eq!(
            check_nonce(&store, &query, "http://rp/return"),
            Err("Nonce missing from return_to")
        );
    }

    #[test]
    fn echoed_nonce_mismatch_rejects() {
        let store = MemoryStore::new();
        store.store_nonce(&Nonce::new("abcdefgh".to_string()));
        let mut query = signed_query();
        query.insert("nonce".to_string(), "zzzzzzzz".to_string());
        let return_to = query["openid.return_to"].clone();
        assert_eq!(
            check_nonce(&store, &query, &return_to),
            Err("Nonce mismatch")
        );
    }
}
