//! The association/nonce store contract and a baseline in-memory
//! implementation.
//!
//! The store is the only state shared across requests. Smart-mode consumers
//! require a persistent store; a store that answers `true` from
//! [`is_dumb`](ConsumerStore::is_dumb) forces every verification through the
//! provider's `check_authentication` endpoint instead.

use crate::association::Association;
use crate::types::{AssociationHandle, AuthKey, Nonce, ServerUrl};

use rand::{thread_rng, Rng};

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

/// Number of bytes in a generated auth key.
const AUTH_KEY_LEN: usize = 20;

/// Persistent state required by the consumer: associations keyed by server
/// URL, outstanding nonces, and the process-wide token-signing key.
///
/// No cross-process locking is assumed. The one concurrency contract an
/// implementation must honor is that [`use_nonce`](Self::use_nonce) is an
/// atomic check-and-remove.
pub trait ConsumerStore {
    /// Store an association for `server_url`, overwriting any prior
    /// association with the same handle.
    fn store_association(&self, server_url: &ServerUrl, association: Association);

    /// Look up an association for `server_url`.
    ///
    /// With a handle, returns the association with exactly that handle.
    /// Without one, returns the most useful current association; this
    /// implementation-defined choice is typically the one with the most
    /// remaining lifetime.
    fn get_association(
        &self,
        server_url: &ServerUrl,
        handle: Option<&AssociationHandle>,
    ) -> Option<Association>;

    /// Remove the association with the given handle, returning whether it
    /// was present.
    fn remove_association(&self, server_url: &ServerUrl, handle: &AssociationHandle) -> bool;

    /// Record a freshly generated nonce as outstanding.
    fn store_nonce(&self, nonce: &Nonce);

    /// Atomically check for and consume a nonce. Returns `true` if the nonce
    /// was outstanding (it no longer is), `false` otherwise.
    fn use_nonce(&self, nonce: &Nonce) -> bool;

    /// The key used to authenticate inter-request tokens. Must be stable for
    /// the lifetime of the process.
    fn get_auth_key(&self) -> AuthKey;

    /// Whether this store is unable to retain associations, forcing dumb
    /// mode.
    fn is_dumb(&self) -> bool {
        false
    }
}

/// A baseline in-memory [`ConsumerStore`].
///
/// State lives for the lifetime of the value and is not shared across
/// processes, which is sufficient for single-process deployments and for
/// tests. The auth key is generated once at construction.
pub struct MemoryStore {
    auth_key: AuthKey,
    associations: RefCell<HashMap<String, Vec<Association>>>,
    nonces: RefCell<HashSet<String>>,
    dumb: bool,
}

impl MemoryStore {
    /// Create an empty smart-mode store with a fresh auth key.
    pub fn new() -> Self {
        let mut key = vec![0u8; AUTH_KEY_LEN];
        thread_rng().fill(&mut key[..]);
        Self {
            auth_key: AuthKey::new(key),
            associations: RefCell::new(HashMap::new()),
            nonces: RefCell::new(HashSet::new()),
            dumb: false,
        }
    }

    /// Create a store that reports itself unable to retain associations,
    /// forcing the consumer into dumb mode.
    pub fn new_dumb() -> Self {
        Self {
            dumb: true,
            ..Self::new()
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerStore for MemoryStore {
    fn store_association(&self, server_url: &ServerUrl, association: Association) {
        let mut associations = self.associations.borrow_mut();
        let entries = associations.entry(server_url.as_str().to_string()).or_default();
        entries.retain(|existing| existing.handle() != association.handle());
        entries.push(association);
    }

    fn get_association(
        &self,
        server_url: &ServerUrl,
        handle: Option<&AssociationHandle>,
    ) -> Option<Association> {
        let associations = self.associations.borrow();
        let entries = associations.get(server_url.as_str())?;
        match handle {
            Some(handle) => entries
                .iter()
                .find(|association| association.handle() == handle)
                .cloned(),
            None => entries
                .iter()
                .max_by_key(|association| association.issued_at() + association.lifetime())
                .cloned(),
        }
    }

    fn remove_association(&self, server_url: &ServerUrl, handle: &AssociationHandle) -> bool {
        let mut associations = self.associations.borrow_mut();
        match associations.get_mut(server_url.as_str()) {
            Some(entries) => {
                let before = entries.len();
                entries.retain(|association| association.handle() != handle);
                entries.len() != before
            }
            None => false,
        }
    }

    fn store_nonce(&self, nonce: &Nonce) {
        self.nonces.borrow_mut().insert(nonce.secret().clone());
    }

    fn use_nonce(&self, nonce: &Nonce) -> bool {
        self.nonces.borrow_mut().remove(nonce.secret())
    }

    fn get_auth_key(&self) -> AuthKey {
        self.auth_key.clone()
    }

    fn is_dumb(&self) -> bool {
        self.dumb
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::{Association, AssociationType};
    use crate::types::MacKey;

    fn server_url() -> ServerUrl {
        ServerUrl::new("https://op.example/".to_string()).unwrap()
    }

    fn association(handle: &str, issued_at: u64, lifetime: u64) -> Association {
        Association::new(
            AssociationHandle::new(handle.to_string()),
            MacKey::new(vec![0u8; 20]),
            AssociationType::HmacSha1,
            issued_at,
            lifetime,
        )
    }

    #[test]
    fn nonce_single_use() {
        let store = MemoryStore::new();
        let nonce = Nonce::new("abcdefgh".to_string());
        store.store_nonce(&nonce);
        assert!(store.use_nonce(&nonce));
        assert!(!store.use_nonce(&nonce));
    }

    #[test]
    fn unknown_nonce_is_rejected() {
        let store = MemoryStore::new();
        assert!(!store.use_nonce(&Nonce::new("unknown1".to_string())));
    }

    #[test]
    fn auth_key_is_stable() {
        let store = MemoryStore::new();
        assert_eq!(store.get_auth_key(), store.get_auth_key());
        assert_eq!(store.get_auth_key().secret().len(), AUTH_KEY_LEN);
    }

    #[test]
    fn handleless_lookup_prefers_longest_lived() {
        let store = MemoryStore::new();
        store.store_association(&server_url(), association("short", 1000, 60));
        store.store_association(&server_url(), association("long", 1000, 3600));
        let found = store.get_association(&server_url(), None).unwrap();
        assert_eq!(found.handle().as_str(), "long");
    }

    #[test]
    fn lookup_by_handle_is_exact() {
        let store = MemoryStore::new();
        store.store_association(&server_url(), association("h1", 1000, 60));
        store.store_association(&server_url(), association("h2", 1000, 3600));
        let handle = AssociationHandle::new("h1".to_string());
        let found = store.get_association(&server_url(), Some(&handle)).unwrap();
        assert_eq!(found.handle().as_str(), "h1");
        let missing = AssociationHandle::new("h3".to_string());
        assert!(store.get_association(&server_url(), Some(&missing)).is_none());
    }

    #[test]
    fn storing_the_same_handle_overwrites() {
        let store = MemoryStore::new();
        store.store_association(&server_url(), association("h", 1000, 60));
        store.store_association(&server_url(), association("h", 2000, 3600));
        let found = store.get_association(&server_url(), None).unwrap();
        assert_eq!(found.issued_at(), 2000);
        assert_eq!(
            store.associations.borrow().get("https://op.example/").unwrap().len(),
            1
        );
    }

    #[test]
    fn remove_association_reports_presence() {
        let store = MemoryStore::new();
        store.store_association(&server_url(), association("h", 1000, 60));
        let handle = AssociationHandle::new("h".to_string());
        assert!(store.remove_association(&server_url(), &handle));
        assert!(!store.remove_association(&server_url(), &handle));
    }
}
