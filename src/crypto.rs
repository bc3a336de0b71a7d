//! Cryptographic primitives for the consumer: HMAC-SHA1 signing and
//! constant-time verification, the Diffie-Hellman exchange used during
//! association, and the random sources backing nonces and keys.

use crate::types::MacKey;

use num_bigint::{BigUint, RandBigInt};
use num_traits::{Num, One};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use ring::digest;
use ring::hmac;
use thiserror::Error;

/// The default Diffie-Hellman modulus from the OpenID 1.1 specification,
/// a 1024-bit safe prime.
const DEFAULT_DH_MODULUS_HEX: &str = "dcf93a0b883972ec0e19989ac5a2ce310e1d37717e8d9571bb7623731866e61e\
     f75a2e27898b057f9891c2e27a639c3f29b60814581cd3b2ca3986d2683705577d45c2e7e52dc81c7a171876e5cea7\
     4b1448bfdfaf18828efd2519f14e45e3826634af1949e5b535cc829a483b8a76223e5d490a257f05bdff16f2fb22c5\
     83ab";

/// The default Diffie-Hellman generator from the OpenID 1.1 specification.
const DEFAULT_DH_GEN: u32 = 2;

/// Error completing a Diffie-Hellman secret derivation.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum DhError {
    /// The provider's encrypted MAC key does not match the digest length.
    #[error("Encrypted MAC key has wrong length: expected {expected}, got {actual}")]
    KeyLengthMismatch {
        /// Length of the hashed shared secret.
        expected: usize,
        /// Length of the `enc_mac_key` sent by the provider.
        actual: usize,
    },
}

/// Compute the HMAC-SHA1 of `data` under `key`. Returns the 20-byte tag.
pub fn hmac_sha1(key: &[u8], data: &[u8]) -> Vec<u8> {
    let signing_key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, key);
    hmac::sign(&signing_key, data).as_ref().to_vec()
}

/// Verify an HMAC-SHA1 tag in constant time.
pub fn hmac_sha1_verify(key: &[u8], data: &[u8], tag: &[u8]) -> bool {
    let verification_key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, key);
    hmac::verify(&verification_key, data, tag).is_ok()
}

/// Compute the SHA-1 digest of `data`.
pub fn sha1(data: &[u8]) -> Vec<u8> {
    digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, data)
        .as_ref()
        .to_vec()
}

/// Generate a random string of `len` characters drawn uniformly from
/// `[A-Za-z0-9]`.
pub fn random_alnum(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Encode a non-negative big integer as big-endian two's-complement bytes:
/// the minimal representation, with a leading zero byte when the high bit of
/// the top byte would otherwise be set.
pub fn btwoc(n: &BigUint) -> Vec<u8> {
    let mut bytes = n.to_bytes_be();
    if bytes[0] & 0x80 != 0 {
        bytes.insert(0, 0x00);
    }
    bytes
}

/// Decode a big-endian two's-complement byte string into a non-negative big
/// integer. The inverse of [`btwoc`].
pub fn btwoc_decode(bytes: &[u8]) -> BigUint {
    BigUint::from_bytes_be(bytes)
}

/// One side of the Diffie-Hellman key agreement performed while associating
/// with a provider.
///
/// Constructing a `DiffieHellman` samples a fresh private exponent; the
/// public value is sent to the provider as `openid.dh_consumer_public` and
/// the provider's reply feeds [`xor_secret`](Self::xor_secret) to recover
/// the MAC key.
pub struct DiffieHellman {
    modulus: BigUint,
    generator: BigUint,
    private: BigUint,
}

impl DiffieHellman {
    /// Create an exchange over the given modulus and generator, sampling a
    /// private exponent uniformly from `[1, p-2]`.
    pub fn new(modulus: BigUint, generator: BigUint) -> Self {
        let private = thread_rng().gen_biguint_range(&BigUint::one(), &(&modulus - 1u32));
        Self::with_private(modulus, generator, private)
    }

    /// Create an exchange over the default OpenID modulus and generator.
    pub fn new_default() -> Self {
        Self::new(default_modulus(), BigUint::from(DEFAULT_DH_GEN))
    }

    pub(crate) fn with_private(modulus: BigUint, generator: BigUint, private: BigUint) -> Self {
        Self {
            modulus,
            generator,
            private,
        }
    }

    /// The modulus `p` for this exchange.
    pub fn modulus(&self) -> &BigUint {
        &self.modulus
    }

    /// The generator `g` for this exchange.
    pub fn generator(&self) -> &BigUint {
        &self.generator
    }

    /// The public value `g^x mod p` to send to the provider.
    pub fn public(&self) -> BigUint {
        self.generator.modpow(&self.private, &self.modulus)
    }

    /// The shared secret `Y^x mod p` given the provider's public value `Y`.
    pub fn shared_secret(&self, server_public: &BigUint) -> BigUint {
        server_public.modpow(&self.private, &self.modulus)
    }

    /// Recover the provider's MAC key from its public value and the
    /// `enc_mac_key` it returned: `enc_mac_key XOR SHA1(btwoc(Y^x mod p))`.
    pub fn xor_secret(
        &self,
        server_public: &BigUint,
        enc_mac_key: &[u8],
    ) -> Result<MacKey, DhError> {
        let hashed = sha1(&btwoc(&self.shared_secret(server_public)));
        if hashed.len() != enc_mac_key.len() {
            return Err(DhError::KeyLengthMismatch {
                expected: hashed.len(),
                actual: enc_mac_key.len(),
            });
        }
        Ok(MacKey::new(
            hashed
                .iter()
                .zip(enc_mac_key.iter())
                .map(|(h, e)| h ^ e)
                .collect(),
        ))
    }
}

/// The default OpenID 1.1 Diffie-Hellman modulus.
pub fn default_modulus() -> BigUint {
    BigUint::from_str_radix(DEFAULT_DH_MODULUS_HEX, 16).expect("default modulus is valid hex")
}
