//! Chunked AES-256-GCM and zeroizing key material

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const GCM_NONCE_SIZE: usize = 12;
pub const GCM_TAG_SIZE: usize = 16;
pub const KEY_SIZE: usize = 32;

#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("AEAD operation failed")]
    AeadError(aes_gcm::Error),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Ciphertext too short: {len} bytes")]
    Truncated { len: usize },

    #[error("Cannot combine zero key shares")]
    NoShares,
}

impl EncryptionError {
    pub fn error_code(&self) -> &'static str {
        match self {
            EncryptionError::AeadError(_) => "CTDF_E_CRYPTO_AEAD",
            EncryptionError::InvalidKeyLength { .. } => "CTDF_E_CRYPTO_KEY_LENGTH",
            EncryptionError::Truncated { .. } => "CTDF_E_CRYPTO_TRUNCATED",
            EncryptionError::NoShares => "CTDF_E_CRYPTO_NO_SHARES",
        }
    }
}

/// 256-bit symmetric key that zeroizes on drop
///
/// Used both for data-encryption keys and for custodian key-encryption keys.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AesKey([u8; KEY_SIZE]);

impl AesKey {
    /// Fresh random key from the OS RNG
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        AesKey(key)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, EncryptionError> {
        if bytes.len() != KEY_SIZE {
            return Err(EncryptionError::InvalidKeyLength {
                expected: KEY_SIZE,
                got: bytes.len(),
            });
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(AesKey(key))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Split into `n` shares whose XOR is this key
    ///
    /// `n == 1` yields a single share equal to the key.
    pub fn xor_split(&self, n: usize) -> Vec<AesKey> {
        let mut shares: Vec<AesKey> = (1..n).map(|_| AesKey::generate()).collect();
        let mut last = self.0;
        for share in &shares {
            for (b, s) in last.iter_mut().zip(share.0.iter()) {
                *b ^= s;
            }
        }
        shares.push(AesKey(last));
        last.zeroize();
        shares
    }

    /// Inverse of [`Self::xor_split`]
    pub fn xor_combine(shares: &[AesKey]) -> Result<AesKey, EncryptionError> {
        if shares.is_empty() {
            return Err(EncryptionError::NoShares);
        }
        let mut out = [0u8; KEY_SIZE];
        for share in shares {
            for (b, s) in out.iter_mut().zip(share.0.iter()) {
                *b ^= s;
            }
        }
        Ok(AesKey(out))
    }
}

impl std::fmt::Debug for AesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AesKey(<redacted>)")
    }
}

/// One encrypted chunk: nonce plus ciphertext with the GCM tag appended
#[derive(Debug, Clone)]
pub struct SealedChunk {
    pub nonce: [u8; GCM_NONCE_SIZE],
    pub ciphertext: Vec<u8>,
}

impl SealedChunk {
    /// The GCM authentication tag (last 16 bytes of the ciphertext)
    pub fn tag(&self) -> &[u8] {
        tag_of(&self.ciphertext)
    }
}

/// Trailing GCM tag of `ciphertext`; empty when the input is shorter than a tag
pub fn tag_of(ciphertext: &[u8]) -> &[u8] {
    if ciphertext.len() < GCM_TAG_SIZE {
        &[]
    } else {
        &ciphertext[ciphertext.len() - GCM_TAG_SIZE..]
    }
}

/// Encrypt one chunk under a fresh random nonce
pub fn seal_chunk(key: &AesKey, plaintext: &[u8]) -> Result<SealedChunk, EncryptionError> {
    let mut nonce = [0u8; GCM_NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_slice()));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(EncryptionError::AeadError)?;
    Ok(SealedChunk { nonce, ciphertext })
}

pub fn open_chunk(
    key: &AesKey,
    nonce: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, EncryptionError> {
    if nonce.len() != GCM_NONCE_SIZE {
        return Err(EncryptionError::Truncated { len: nonce.len() });
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_slice()));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(EncryptionError::AeadError)
}

/// Encrypt into the self-contained `nonce || ciphertext || tag` layout
pub fn seal(key: &AesKey, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    let chunk = seal_chunk(key, plaintext)?;
    let mut out = Vec::with_capacity(GCM_NONCE_SIZE + chunk.ciphertext.len());
    out.extend_from_slice(&chunk.nonce);
    out.extend_from_slice(&chunk.ciphertext);
    Ok(out)
}

/// Inverse of [`seal`]
pub fn open(key: &AesKey, sealed: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    if sealed.len() < GCM_NONCE_SIZE + GCM_TAG_SIZE {
        return Err(EncryptionError::Truncated { len: sealed.len() });
    }
    let (nonce, ciphertext) = sealed.split_at(GCM_NONCE_SIZE);
    open_chunk(key, nonce, ciphertext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_round_trip_and_tag() {
        let key = AesKey::generate();
        let sealed = seal_chunk(&key, b"coalition payload").unwrap();
        assert_eq!(sealed.ciphertext.len(), 17 + GCM_TAG_SIZE);
        assert_eq!(sealed.tag().len(), GCM_TAG_SIZE);
        let plain = open_chunk(&key, &sealed.nonce, &sealed.ciphertext).unwrap();
        assert_eq!(plain, b"coalition payload");
    }

    #[test]
    fn test_open_rejects_wrong_key_and_truncation() {
        let key = AesKey::generate();
        let sealed = seal(&key, b"dek").unwrap();
        assert!(matches!(
            open(&AesKey::generate(), &sealed),
            Err(EncryptionError::AeadError(_))
        ));
        assert!(matches!(
            open(&key, &sealed[..10]),
            Err(EncryptionError::Truncated { len: 10 })
        ));
    }

    #[test]
    fn test_xor_split_combines_back() {
        let key = AesKey::generate();
        for n in 1..=4 {
            let shares = key.xor_split(n);
            assert_eq!(shares.len(), n);
            assert_eq!(AesKey::xor_combine(&shares).unwrap(), key);
        }
        let shares = key.xor_split(3);
        assert_ne!(AesKey::xor_combine(&shares[..2]).unwrap(), key);
        assert!(matches!(AesKey::xor_combine(&[]), Err(EncryptionError::NoShares)));
    }

    #[test]
    fn test_key_length_checked() {
        assert!(matches!(
            AesKey::from_slice(&[0u8; 16]),
            Err(EncryptionError::InvalidKeyLength {
                expected: 32,
                got: 16
            })
        ));
    }

    #[test]
    fn test_debug_redacts() {
        assert_eq!(format!("{:?}", AesKey::generate()), "AesKey(<redacted>)");
    }
}
