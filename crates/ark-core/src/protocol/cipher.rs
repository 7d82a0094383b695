//! Passphrase-keyed authenticated encryption for secure channel payloads.
//!
//! # Token layout
//!
//! ```text
//! [0x80:1][timestamp_secs:8][iv:16][AES-128-CBC ciphertext:N*16][HMAC-SHA256:32]
//! ```
//!
//! The whole token is URL-safe base64 encoded before it is framed, which is
//! the Fernet token format the remote service speaks.
//!
//! # Key derivation
//!
//! A 32-byte key is derived once with PBKDF2-HMAC-SHA256 (100 000 rounds).
//! The salt is the first 16 bytes of `SHA-256(passphrase)`, so both ends
//! derive the same key from the shared passphrase alone.  The first half of
//! the key signs, the second half encrypts.
//!
//! Decryption verifies the MAC (in constant time) before touching the
//! ciphertext, so a tampered token or a wrong key is always an error.

use std::time::{SystemTime, UNIX_EPOCH};

use aes::Aes128;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;
type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// PBKDF2 iteration count shared with the remote service.
pub const KDF_ROUNDS: u32 = 100_000;

const TOKEN_VERSION: u8 = 0x80;
const IV_LEN: usize = 16;
const MAC_LEN: usize = 32;
const BLOCK_LEN: usize = 16;
/// version + timestamp + iv
const PREFIX_LEN: usize = 1 + 8 + IV_LEN;

/// Errors produced when a token cannot be decrypted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    /// The token is not valid URL-safe base64.
    #[error("token is not valid base64")]
    Encoding,

    /// The token is too short or its ciphertext is not block aligned.
    #[error("token has invalid length {0}")]
    InvalidLength(usize),

    /// The leading version byte is not `0x80`.
    #[error("unsupported token version 0x{0:02X}")]
    UnsupportedVersion(u8),

    /// The HMAC does not match: the token was altered or the key is wrong.
    #[error("token authentication failed")]
    Authentication,

    /// PKCS#7 padding was invalid after decryption.
    #[error("token padding is invalid")]
    Padding,
}

/// Symmetric cipher bound to one derived key.
#[derive(Clone)]
pub struct TokenCipher {
    signing_key: [u8; 16],
    encryption_key: [u8; 16],
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher").finish_non_exhaustive()
    }
}

impl TokenCipher {
    /// Derives the key from `passphrase`.
    ///
    /// This runs the full key derivation and is intentionally slow; build the
    /// cipher once per channel and reuse it.
    pub fn from_passphrase(passphrase: &str) -> Self {
        Self::from_key(derive_key(passphrase))
    }

    /// Builds a cipher from an already-derived 32-byte key.
    pub fn from_key(key: [u8; 32]) -> Self {
        let mut signing_key = [0u8; 16];
        let mut encryption_key = [0u8; 16];
        signing_key.copy_from_slice(&key[..16]);
        encryption_key.copy_from_slice(&key[16..]);
        Self {
            signing_key,
            encryption_key,
        }
    }

    /// Encrypts `plaintext` into a base64 token using a fresh random IV.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.encrypt_with(plaintext, iv, now)
    }

    /// Encrypts with an explicit IV and timestamp.
    pub fn encrypt_with(&self, plaintext: &[u8], iv: [u8; IV_LEN], timestamp_secs: u64) -> Vec<u8> {
        let ciphertext = Aes128CbcEnc::new(&self.encryption_key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut token = Vec::with_capacity(PREFIX_LEN + ciphertext.len() + MAC_LEN);
        token.push(TOKEN_VERSION);
        token.extend_from_slice(&timestamp_secs.to_be_bytes());
        token.extend_from_slice(&iv);
        token.extend_from_slice(&ciphertext);

        let tag = self.mac().chain_update(&token).finalize().into_bytes();
        token.extend_from_slice(&tag);

        URL_SAFE.encode(token).into_bytes()
    }

    /// Verifies and decrypts a base64 token.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError`] for malformed tokens, wrong keys, or tampering.
    /// Plaintext is only ever returned after the MAC has been verified.
    pub fn decrypt(&self, token: &[u8]) -> Result<Vec<u8>, CipherError> {
        let raw = URL_SAFE.decode(token).map_err(|_| CipherError::Encoding)?;

        if raw.len() < PREFIX_LEN + BLOCK_LEN + MAC_LEN {
            return Err(CipherError::InvalidLength(raw.len()));
        }
        if raw[0] != TOKEN_VERSION {
            return Err(CipherError::UnsupportedVersion(raw[0]));
        }

        let (signed, tag) = raw.split_at(raw.len() - MAC_LEN);
        self.mac()
            .chain_update(signed)
            .verify_slice(tag)
            .map_err(|_| CipherError::Authentication)?;

        let ciphertext = &signed[PREFIX_LEN..];
        if ciphertext.len() % BLOCK_LEN != 0 {
            return Err(CipherError::InvalidLength(raw.len()));
        }
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&signed[9..PREFIX_LEN]);

        Aes128CbcDec::new(&self.encryption_key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CipherError::Padding)
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length.
        <HmacSha256 as Mac>::new_from_slice(&self.signing_key)
            .unwrap_or_else(|_| unreachable!("HMAC-SHA256 accepts any key length"))
    }
}

/// Runs the passphrase key derivation.
pub fn derive_key(passphrase: &str) -> [u8; 32] {
    let digest = Sha256::digest(passphrase.as_bytes());
    let salt = &digest[..16];
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, KDF_ROUNDS, &mut key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher(seed: u8) -> TokenCipher {
        TokenCipher::from_key([seed; 32])
    }

    #[test]
    fn test_encrypt_then_decrypt_returns_plaintext() {
        // Arrange
        let c = cipher(1);
        let message = br#"{"endpoint":"login","data":{}}"#;

        // Act
        let token = c.encrypt(message);
        let plain = c.decrypt(&token).unwrap();

        // Assert
        assert_eq!(plain, message);
    }

    #[test]
    fn test_token_is_url_safe_base64_starting_with_version() {
        let token = cipher(1).encrypt_with(b"x", [0u8; 16], 0);

        let raw = URL_SAFE.decode(&token).unwrap();

        assert_eq!(raw[0], 0x80);
        assert_eq!(&raw[1..9], &0u64.to_be_bytes());
        assert_eq!(raw.len(), PREFIX_LEN + BLOCK_LEN + MAC_LEN);
        assert!(token.iter().all(|b| b.is_ascii_alphanumeric() || b"-_=".contains(b)));
    }

    #[test]
    fn test_empty_plaintext_round_trips() {
        let c = cipher(3);

        assert_eq!(c.decrypt(&c.encrypt(b"")).unwrap(), b"");
    }

    #[test]
    fn test_decrypt_with_wrong_key_fails_authentication() {
        let token = cipher(1).encrypt(b"secret");

        assert_eq!(cipher(2).decrypt(&token), Err(CipherError::Authentication));
    }

    #[test]
    fn test_decrypt_rejects_any_flipped_byte() {
        // Arrange
        let c = cipher(7);
        let raw = URL_SAFE.decode(c.encrypt(b"attack at dawn")).unwrap();

        for i in 0..raw.len() {
            let mut tampered = raw.clone();
            tampered[i] ^= 0x01;
            let token = URL_SAFE.encode(&tampered);

            // Act
            let result = c.decrypt(token.as_bytes());

            // Assert
            assert!(result.is_err(), "flipping byte {i} must not decrypt");
        }
    }

    #[test]
    fn test_decrypt_rejects_garbage_input() {
        let c = cipher(1);

        assert_eq!(c.decrypt(b"not base64 !!"), Err(CipherError::Encoding));
        assert!(matches!(
            c.decrypt(URL_SAFE.encode([0x80u8; 20]).as_bytes()),
            Err(CipherError::InvalidLength(20))
        ));
    }

    #[test]
    fn test_derive_key_is_deterministic_and_passphrase_specific() {
        let a = derive_key("default_password");
        let b = derive_key("default_password");
        let c = derive_key("another_password");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_passphrase_ciphers_interoperate() {
        let sender = TokenCipher::from_passphrase("shared");
        let receiver = TokenCipher::from_passphrase("shared");
        let stranger = TokenCipher::from_passphrase("other");

        let token = sender.encrypt(b"hello");

        assert_eq!(receiver.decrypt(&token).unwrap(), b"hello");
        assert!(stranger.decrypt(&token).is_err());
    }
}
