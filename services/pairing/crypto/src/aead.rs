//! AES-128 AEAD with a 13-byte nonce and 16-byte tag.
//!
//! Ciphertexts are `ciphertext || tag`.

use crate::{CryptoError, Result, AEAD_MIC_LEN, AEAD_NONCE_LEN, SYMMETRIC_KEY_LEN};
use aes_gcm::aead::consts::U13;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::aes::Aes128;
use aes_gcm::AesGcm;
use zeroize::Zeroizing;

type Cipher = AesGcm<Aes128, U13>;

fn cipher(key: &[u8]) -> Result<Cipher> {
    if key.len() != SYMMETRIC_KEY_LEN {
        return Err(CryptoError::InvalidLength {
            expected: SYMMETRIC_KEY_LEN,
            actual: key.len(),
        });
    }
    Cipher::new_from_slice(key).map_err(|_| CryptoError::Encryption)
}

fn check_nonce(nonce: &[u8]) -> Result<()> {
    if nonce.len() != AEAD_NONCE_LEN {
        return Err(CryptoError::InvalidLength {
            expected: AEAD_NONCE_LEN,
            actual: nonce.len(),
        });
    }
    Ok(())
}

/// Encrypt and authenticate `plaintext`, binding `aad`
pub fn encrypt(key: &[u8], nonce: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    check_nonce(nonce)?;
    cipher(key)?
        .encrypt(
            GenericArray::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Encryption)
}

/// Verify and decrypt `ciphertext || tag`
pub fn decrypt(
    key: &[u8],
    nonce: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    check_nonce(nonce)?;
    if ciphertext.len() < AEAD_MIC_LEN {
        return Err(CryptoError::Decryption);
    }
    let plaintext = cipher(key)?
        .decrypt(
            GenericArray::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Decryption)?;
    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 16] = [0x11; 16];
    const NONCE: &[u8; 13] = b"NCASE_Sigma2N";

    #[test]
    fn test_encrypt_decrypt() {
        let ct = encrypt(&KEY, NONCE, b"payload", b"aad").unwrap();
        assert_eq!(ct.len(), 7 + AEAD_MIC_LEN);
        let pt = decrypt(&KEY, NONCE, &ct, b"aad").unwrap();
        assert_eq!(&pt[..], b"payload");
    }

    #[test]
    fn test_empty_plaintext_yields_tag_only() {
        let ct = encrypt(&KEY, NONCE, &[], &[]).unwrap();
        assert_eq!(ct.len(), AEAD_MIC_LEN);
        assert!(decrypt(&KEY, NONCE, &ct, &[]).unwrap().is_empty());
    }

    #[test]
    fn test_tamper_detected() {
        let mut ct = encrypt(&KEY, NONCE, b"payload", b"aad").unwrap();
        ct[0] ^= 1;
        assert_eq!(decrypt(&KEY, NONCE, &ct, b"aad").unwrap_err(), CryptoError::Decryption);

        let ct = encrypt(&KEY, NONCE, b"payload", b"aad").unwrap();
        assert_eq!(decrypt(&KEY, NONCE, &ct, b"other").unwrap_err(), CryptoError::Decryption);
    }

    #[test]
    fn test_rejects_bad_sizes() {
        assert!(matches!(
            encrypt(&[0; 32], NONCE, b"x", &[]),
            Err(CryptoError::InvalidLength { expected: 16, .. })
        ));
        assert!(matches!(
            encrypt(&KEY, &[0; 12], b"x", &[]),
            Err(CryptoError::InvalidLength { expected: 13, .. })
        ));
        assert_eq!(decrypt(&KEY, NONCE, &[0; 4], &[]).unwrap_err(), CryptoError::Decryption);
    }
}
