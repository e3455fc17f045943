// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Wireguard key material: x25519 keypairs with the base64 encoding used on
//! the wire and in the store.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::rngs::OsRng;
use x25519_dalek::StaticSecret;

/// Length of a raw wireguard key in bytes.
pub const KEY_LEN: usize = 32;

/// Errors decoding key material from its base64 form.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// The input was not valid base64.
    #[error("failed to decode key: {0}")]
    Decode(#[from] base64::DecodeError),
    /// The decoded input was not exactly [`KEY_LEN`] bytes.
    #[error("invalid key length {0}, expected {KEY_LEN}")]
    InvalidLength(usize),
}

fn decode_key(encoded: &str) -> Result<[u8; KEY_LEN], KeyError> {
    let bytes = BASE64.decode(encoded)?;
    let len = bytes.len();
    <[u8; KEY_LEN]>::try_from(bytes).map_err(|_| KeyError::InvalidLength(len))
}

/// An x25519 private key.
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey([u8; KEY_LEN]);

impl PrivateKey {
    /// Generate a fresh random private key.
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(&mut OsRng).to_bytes())
    }

    /// Parse a key from its base64 encoding.
    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        decode_key(encoded).map(Self)
    }

    /// The base64 encoding of this key.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Derive the matching public key.
    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(self.0);
        PublicKey(x25519_dalek::PublicKey::from(&secret).to_bytes())
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Whether this is the all-zero value the kernel reports for a device
    /// that has never been given a key.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; KEY_LEN]
    }
}

impl From<[u8; KEY_LEN]> for PrivateKey {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

// Key material must not end up in logs.
impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

/// An x25519 public key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    /// Parse a key from its base64 encoding.
    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        decode_key(encoded).map(Self)
    }

    /// The base64 encoding of this key.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl From<[u8; KEY_LEN]> for PublicKey {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", self.to_base64())
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_base64())
    }
}
