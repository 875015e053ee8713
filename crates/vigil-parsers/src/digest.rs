//! Encrypted content digest for generic files.
//!
//! The stored fingerprint is `nonce(12) || AES-128-GCM(key, nonce,
//! BLAKE2b-256(contents))`: 12 + 32 + 16 bytes. The random per-parse
//! nonce keeps the on-disk state useless for offline content guessing;
//! it also means two digests of the same content never share bytes, so
//! byte inequality is the (deliberately coarse) change signal for
//! generic files.

use std::{fs::File, io, path::Path};

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes128Gcm,
};
use blake2::{digest::consts::U32, Blake2b, Digest};
use serde::{Deserialize, Serialize};

use crate::ParseError;

type Blake2b256 = Blake2b<U32>;

pub const KEY_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// Sealed content hash of a generic file. Empty means "no content seen"
/// (file absent or the path is a directory).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedDigest {
    #[serde(default, with = "serde_bytes_hex")]
    pub sealed: Vec<u8>,
}

impl EncryptedDigest {
    pub fn is_empty(&self) -> bool {
        self.sealed.is_empty()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.sealed)
    }
}

/// Hash a file's contents and seal the hash under the process key.
pub fn digest_file(path: &Path, key: &[u8; KEY_LEN]) -> Result<EncryptedDigest, ParseError> {
    let mut file = File::open(path).map_err(|e| ParseError::io(path, e))?;
    let mut hasher = Blake2b256::new();
    io::copy(&mut file, &mut hasher).map_err(|e| ParseError::io(path, e))?;
    seal(&hasher.finalize(), key)
}

fn seal(hash: &[u8], key: &[u8; KEY_LEN]) -> Result<EncryptedDigest, ParseError> {
    let cipher =
        Aes128Gcm::new_from_slice(key).map_err(|e| ParseError::Crypto(e.to_string()))?;
    let nonce = Aes128Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, hash)
        .map_err(|_| ParseError::Crypto("sealing content hash failed".to_string()))?;
    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(EncryptedDigest { sealed })
}

/// Digests are stored as hex strings so the state blobs stay printable.
mod serde_bytes_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use aes_gcm::Nonce;

    use super::*;

    const KEY: [u8; KEY_LEN] = [7u8; KEY_LEN];

    fn write_fixture(content: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content).unwrap();
        f
    }

    fn unseal(digest: &EncryptedDigest, key: &[u8; KEY_LEN]) -> Vec<u8> {
        let (nonce, ciphertext) = digest.sealed.split_at(NONCE_LEN);
        Aes128Gcm::new_from_slice(key)
            .unwrap()
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .unwrap()
    }

    #[test]
    fn digest_has_fixed_length() {
        let f = write_fixture(b"hello world");
        let digest = digest_file(f.path(), &KEY).unwrap();
        assert_eq!(digest.sealed.len(), 12 + 32 + 16);
    }

    #[test]
    fn distinct_nonces_give_distinct_bytes_for_same_content() {
        let f = write_fixture(b"hello world");
        let a = digest_file(f.path(), &KEY).unwrap();
        let b = digest_file(f.path(), &KEY).unwrap();
        assert_ne!(a.sealed, b.sealed);
        // The inner hash is still the same content hash.
        assert_eq!(unseal(&a, &KEY), unseal(&b, &KEY));
        assert_eq!(unseal(&a, &KEY).len(), 32);
    }

    #[test]
    fn different_content_hashes_differ() {
        let a = digest_file(write_fixture(b"one").path(), &KEY).unwrap();
        let b = digest_file(write_fixture(b"two").path(), &KEY).unwrap();
        assert_ne!(unseal(&a, &KEY), unseal(&b, &KEY));
    }

    #[test]
    fn empty_digest_round_trips_through_json() {
        let digest = EncryptedDigest::default();
        let json = serde_json::to_string(&digest).unwrap();
        let back: EncryptedDigest = serde_json::from_str(&json).unwrap();
        assert!(back.is_empty());
    }
}
