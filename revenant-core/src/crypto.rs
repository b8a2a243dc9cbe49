//! Room crypto: room tag, password-derived key (cached), AES-256-GCM wire encryption.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Fixed application salt for key derivation. Shared by every Revenant build.
const SALT: &[u8] = b"revenant-stealth-messenger-salt";
/// PBKDF2-SHA256 iteration count.
pub const PBKDF2_ITERATIONS: u32 = 100_000;
pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Room tag: lowercase hex SHA-256 of the room secret. Sent in clear on every envelope.
pub fn room_tag(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Derive the 32-byte room key from the secret (PBKDF2-HMAC-SHA256, fixed salt).
pub fn derive_room_key(secret: &str) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(secret.as_bytes(), SALT, PBKDF2_ITERATIONS, &mut key);
    key
}

/// Key material for one room secret.
#[derive(Clone)]
pub struct RoomKey {
    tag: String,
    key: [u8; KEY_LEN],
}

impl RoomKey {
    pub fn derive(secret: &str) -> Self {
        Self {
            tag: room_tag(secret),
            key: derive_room_key(secret),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn key(&self) -> &[u8; KEY_LEN] {
        &self.key
    }
}

impl std::fmt::Debug for RoomKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomKey").field("tag", &self.tag).finish_non_exhaustive()
    }
}

/// Single-slot key cache keyed by the raw secret string.
/// Asking for a different secret evicts the previous key and derives again.
#[derive(Debug, Default)]
pub struct KeyCache {
    slot: Option<(String, RoomKey)>,
    derivations: u64,
}

impl KeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, secret: &str) -> &RoomKey {
        if self.slot.as_ref().map_or(true, |(cached, _)| cached != secret) {
            self.slot = None;
            self.derivations += 1;
            tracing::debug!("deriving room key");
        }
        let (_, key) = self
            .slot
            .get_or_insert_with(|| (secret.to_owned(), RoomKey::derive(secret)));
        key
    }

    pub fn holds(&self, secret: &str) -> bool {
        self.slot.as_ref().is_some_and(|(cached, _)| cached == secret)
    }

    /// Store a key derived elsewhere, e.g. on a blocking thread. Not counted as a derivation.
    pub fn install(&mut self, secret: &str, key: RoomKey) {
        self.slot = Some((secret.to_owned(), key));
    }

    /// Number of PBKDF2 runs so far.
    pub fn derivations(&self) -> u64 {
        self.derivations
    }
}

/// Output of one AEAD seal: random nonce, ciphertext, detached tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

/// Wire encryption: AES-256-GCM with a fresh OS-random 96-bit nonce per call.
pub fn encrypt_wire(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Sealed, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Key)?;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let mut out = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Encrypt)?;
    // aes-gcm appends the tag; the wire format carries it separately.
    let split = out.len().checked_sub(TAG_LEN).ok_or(CryptoError::Encrypt)?;
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&out[split..]);
    out.truncate(split);
    Ok(Sealed {
        nonce,
        ciphertext: out,
        tag,
    })
}

/// Wire decryption. Fails on wrong key, corrupted ciphertext or tag.
pub fn decrypt_wire(key: &[u8; KEY_LEN], sealed: &Sealed) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Key)?;
    let mut joined = Vec::with_capacity(sealed.ciphertext.len() + TAG_LEN);
    joined.extend_from_slice(&sealed.ciphertext);
    joined.extend_from_slice(&sealed.tag);
    cipher
        .decrypt(Nonce::from_slice(&sealed.nonce), joined.as_slice())
        .map_err(|_| CryptoError::Decrypt)
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_tag_is_sha256_hex() {
        // sha256("default")
        assert_eq!(
            room_tag("default"),
            "37a8eec1ce19687d132fe29051dca629d164e2c4958ba141d5f4133a33f0688f"
        );
        assert_ne!(room_tag("default"), "default");
    }

    #[test]
    fn room_tag_is_stable() {
        assert_eq!(room_tag("secret"), room_tag("secret"));
        assert_ne!(room_tag("secret"), room_tag("Secret"));
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        let plain = b"hello room";
        let sealed = encrypt_wire(&key, plain).unwrap();
        assert_eq!(sealed.ciphertext.len(), plain.len());
        let dec = decrypt_wire(&key, &sealed).unwrap();
        assert_eq!(dec.as_slice(), plain);
    }

    #[test]
    fn nonces_are_fresh() {
        let key = [7u8; KEY_LEN];
        let a = encrypt_wire(&key, b"same").unwrap();
        let b = encrypt_wire(&key, b"same").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = encrypt_wire(&[1u8; KEY_LEN], b"payload").unwrap();
        assert!(matches!(
            decrypt_wire(&[2u8; KEY_LEN], &sealed),
            Err(CryptoError::Decrypt)
        ));
    }

    #[test]
    fn tampered_tag_fails() {
        let key = [3u8; KEY_LEN];
        let mut sealed = encrypt_wire(&key, b"payload").unwrap();
        sealed.tag[0] ^= 0x01;
        assert!(decrypt_wire(&key, &sealed).is_err());
    }

    #[test]
    fn key_cache_reuses_and_invalidates() {
        let mut cache = KeyCache::new();
        let first = cache.get("alpha").key().to_owned();
        let again = cache.get("alpha").key().to_owned();
        assert_eq!(first, again);
        assert_eq!(cache.derivations(), 1);

        let other = cache.get("beta").key().to_owned();
        assert_ne!(first, other);
        assert_eq!(cache.derivations(), 2);

        cache.get("alpha");
        assert_eq!(cache.derivations(), 3);
    }

    #[test]
    fn installed_key_is_used_without_deriving() {
        let mut cache = KeyCache::new();
        assert!(!cache.holds("gamma"));
        let key = RoomKey::derive("gamma");
        cache.install("gamma", key.clone());
        assert!(cache.holds("gamma"));
        assert_eq!(cache.get("gamma").key(), key.key());
        assert_eq!(cache.derivations(), 0);
    }
}
