use super::{KemError, KeyEncapsulation};
use crate::crypto::{self, AesKey};

/// AES-256-GCM key wrap under a symmetric key-encryption key
///
/// Output layout: `nonce(12) || ciphertext || tag(16)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct AesGcmKeyWrap;

impl KeyEncapsulation for AesGcmKeyWrap {
    type PublicKey = AesKey;
    type PrivateKey = AesKey;

    fn wrap(&self, key: &[u8], kek: &AesKey) -> Result<Vec<u8>, KemError> {
        crypto::seal(kek, key).map_err(|e| KemError::WrapError(e.to_string()))
    }

    fn unwrap(&self, wrapped: &[u8], kek: &AesKey) -> Result<Vec<u8>, KemError> {
        crypto::open(kek, wrapped).map_err(|e| KemError::UnwrapError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_unwrap() {
        let kek = AesKey::generate();
        let dek = AesKey::generate();
        let wrapped = AesGcmKeyWrap.wrap(dek.as_slice(), &kek).unwrap();
        assert_eq!(wrapped.len(), 12 + 32 + 16);
        let unwrapped = AesGcmKeyWrap.unwrap(&wrapped, &kek).unwrap();
        assert_eq!(unwrapped, dek.as_slice());
    }

    #[test]
    fn test_unwrap_with_other_kek_fails() {
        let wrapped = AesGcmKeyWrap
            .wrap(AesKey::generate().as_slice(), &AesKey::generate())
            .unwrap();
        assert!(matches!(
            AesGcmKeyWrap.unwrap(&wrapped, &AesKey::generate()),
            Err(KemError::UnwrapError(_))
        ));
    }
}
