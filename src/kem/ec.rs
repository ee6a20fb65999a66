//! Elliptic-curve key wrapping (P-256 ECDH-ES + HKDF-SHA256 + AES-256-GCM)
//!
//! # Protocol Flow
//!
//! 1. Generate an ephemeral P-256 key pair
//! 2. ECDH with the recipient's public key; the x-coordinate is the shared secret
//! 3. Derive the wrapping key with HKDF-SHA256 (fixed salt, purpose-specific info)
//! 4. Wrap the key with AES-256-GCM
//! 5. Output `ephemeral_public(33, compressed) || nonce(12) || ciphertext || tag(16)`

use super::{KemError, KeyEncapsulation};
use crate::crypto::{self, AesKey};
use hkdf::Hkdf;
use p256::elliptic_curve::point::AffineCoordinates;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use sha2::Sha256;
use zeroize::Zeroizing;

const HKDF_SALT: &[u8] = b"coalition-tdf/v1";
const COMPRESSED_POINT_SIZE: usize = 33;

/// Raw ECDH: x-coordinate of `private * public`
pub fn ecdh_x_coordinate(private_key: &SecretKey, public_key: &PublicKey) -> Zeroizing<Vec<u8>> {
    let scalar = private_key.to_nonzero_scalar();
    let shared_point = (public_key.to_projective() * *scalar).to_affine();
    Zeroizing::new(shared_point.x().to_vec())
}

/// Compressed SEC1 encoding of a public key
pub fn public_key_bytes(public_key: &PublicKey) -> Vec<u8> {
    public_key.to_encoded_point(true).as_bytes().to_vec()
}

pub fn parse_public_key(bytes: &[u8]) -> Result<PublicKey, KemError> {
    PublicKey::from_sec1_bytes(bytes).map_err(|_| KemError::InvalidPublicKey)
}

#[derive(Debug, Clone, Copy)]
pub struct EcdhKem {
    info: &'static [u8],
}

impl EcdhKem {
    /// Wrapping a data key for a custodian
    pub const fn for_key_access() -> Self {
        Self {
            info: b"coalition-tdf/key-access",
        }
    }

    /// Rewrapping a released key for a client session
    pub const fn for_session() -> Self {
        Self {
            info: b"coalition-tdf/session",
        }
    }

    fn derive(&self, shared_secret: &[u8]) -> Result<AesKey, KemError> {
        let hkdf = Hkdf::<Sha256>::new(Some(HKDF_SALT), shared_secret);
        let mut okm = Zeroizing::new([0u8; 32]);
        hkdf.expand(self.info, &mut okm[..])
            .map_err(|_| KemError::KeyDerivationFailed)?;
        Ok(AesKey::from_slice(&okm[..])?)
    }
}

impl Default for EcdhKem {
    fn default() -> Self {
        Self::for_key_access()
    }
}

impl KeyEncapsulation for EcdhKem {
    type PublicKey = PublicKey;
    type PrivateKey = SecretKey;

    fn wrap(&self, key: &[u8], recipient: &PublicKey) -> Result<Vec<u8>, KemError> {
        let ephemeral = SecretKey::random(&mut OsRng);
        let shared = ecdh_x_coordinate(&ephemeral, recipient);
        let wrapping_key = self.derive(&shared)?;
        let sealed =
            crypto::seal(&wrapping_key, key).map_err(|e| KemError::WrapError(e.to_string()))?;

        let mut out = public_key_bytes(&ephemeral.public_key());
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn unwrap(&self, wrapped: &[u8], private_key: &SecretKey) -> Result<Vec<u8>, KemError> {
        if wrapped.len() <= COMPRESSED_POINT_SIZE {
            return Err(KemError::UnwrapError(format!(
                "wrapped key too short: {} bytes",
                wrapped.len()
            )));
        }
        let (ephemeral_bytes, sealed) = wrapped.split_at(COMPRESSED_POINT_SIZE);
        let ephemeral = parse_public_key(ephemeral_bytes)?;
        let shared = ecdh_x_coordinate(private_key, &ephemeral);
        let wrapping_key = self.derive(&shared)?;
        crypto::open(&wrapping_key, sealed).map_err(|e| KemError::UnwrapError(e.to_string()))
    }
}
