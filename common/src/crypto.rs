// Copyright (C) 2024 Nicola Dardanis <nicdard@gmail.com>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::fmt;

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes256Gcm, KeyInit};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

/// The secret used when the deployment doesn't configure one. Anybody can decrypt cookies sealed with it.
pub const INSECURE_DEFAULT_SECRET: &str = "dev-insecure-secret-change-me";
/// Fixed PBKDF2 salt, so that every process sharing the secret derives the same key.
pub const KDF_SALT: &[u8] = b"copyparty-cookie-salt";
/// PBKDF2-HMAC-SHA256 rounds.
pub const KDF_ROUNDS: u32 = 100_000;
/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;
/// AES-GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("the plaintext could not be sealed")]
    Seal,
    #[error("the token is not valid base64: `{0}`")]
    Encoding(#[from] base64::DecodeError),
    #[error("the token is too short to hold a nonce and a tag ({0} bytes)")]
    Truncated(usize),
    #[error("the token failed authentication")]
    Authentication,
    #[error("the decrypted credential is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Seals credentials into opaque cookie tokens with AES-256-GCM.
///
/// A token is `base64(nonce || tag || ciphertext)`, the nonce being freshly drawn for every call.
/// The key is derived once, from the configured secret, with PBKDF2-HMAC-SHA256.
#[derive(Clone)]
pub struct CredentialCipher {
    key: [u8; 32],
}

impl fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialCipher")
            .field("key", &"<redacted>")
            .finish()
    }
}

impl CredentialCipher {
    /// Derive the cookie key from the configured secret.
    pub fn new(secret: &str) -> Self {
        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(secret.as_bytes(), KDF_SALT, KDF_ROUNDS, &mut key);
        CredentialCipher { key }
    }

    /// Encrypt a credential into a token.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let cipher = Aes256Gcm::new(GenericArray::from_slice(&self.key));
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let mut buffer = plaintext.as_bytes().to_vec();
        let tag = cipher
            .encrypt_in_place_detached(GenericArray::from_slice(&nonce), b"", &mut buffer)
            .map_err(|_| CipherError::Seal)?;
        let mut payload = Vec::with_capacity(NONCE_LEN + TAG_LEN + buffer.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&tag);
        payload.extend_from_slice(&buffer);
        Ok(STANDARD.encode(payload))
    }

    /// Recover the credential sealed in a token.
    /// Any malformed, truncated or tampered token yields `None`.
    pub fn decrypt(&self, token: &str) -> Option<String> {
        self.open(token)
            .inspect_err(|e| log::debug!("Rejected session token: `{}`", e))
            .ok()
    }

    fn open(&self, token: &str) -> Result<String, CipherError> {
        let payload = STANDARD.decode(token.trim())?;
        if payload.len() < NONCE_LEN + TAG_LEN {
            return Err(CipherError::Truncated(payload.len()));
        }
        let (nonce, rest) = payload.split_at(NONCE_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);
        let cipher = Aes256Gcm::new(GenericArray::from_slice(&self.key));
        let mut buffer = ciphertext.to_vec();
        cipher
            .decrypt_in_place_detached(
                GenericArray::from_slice(nonce),
                b"",
                &mut buffer,
                GenericArray::from_slice(tag),
            )
            .map_err(|_| CipherError::Authentication)?;
        Ok(String::from_utf8(buffer)?)
    }
}
