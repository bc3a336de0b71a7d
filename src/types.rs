use crate::crypto;

use serde::{Deserialize, Serialize};

/// Number of characters in a freshly generated [`Nonce`].
pub(crate) const NONCE_LEN: usize = 8;

new_url_type![
    /// The canonical URL a user claims as their identity.
    ///
    /// This is the user-visible result of a successful login and the value
    /// relying parties should key accounts on.
    IdentityUrl
];

new_url_type![
    /// An OpenID provider (identity server) endpoint URL.
    ServerUrl
];

new_url_type![
    /// The URL pattern shown to the user at the provider, describing the
    /// site requesting authentication.
    TrustRoot
];

new_url_type![
    /// The URL at the relying party that the provider redirects the user's
    /// browser back to.
    ReturnTo
];

new_type![
    /// Opaque handle identifying an association, assigned by the provider.
    #[derive(Deserialize, Hash, Ord, PartialOrd, Serialize)]
    AssociationHandle(String)
];

impl AssociationHandle {
    /// Return the handle as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

new_secret_type![
    /// A single-use random token binding one `begin` call to one `complete`
    /// call.
    ///
    /// The nonce is stored before the user's browser ever sees it and is
    /// redeemed exactly once when the provider's assertion returns.
    #[derive(Deserialize, Hash, Ord, PartialOrd, Serialize)]
    Nonce(String)
    impl {
        /// Generate a new random nonce of eight alphanumeric characters.
        pub fn new_random() -> Self {
            Nonce::new(crypto::random_alnum(NONCE_LEN))
        }
    }
];

new_secret_type![
    /// The process-local key used to authenticate inter-request tokens.
    ///
    /// Obtained from the store, which guarantees it is stable for the
    /// lifetime of the process. Typically 20 random bytes.
    AuthKey(Vec<u8>)
];

new_secret_type![
    /// The shared HMAC-SHA1 key negotiated with a provider.
    MacKey(Vec<u8>)
];
