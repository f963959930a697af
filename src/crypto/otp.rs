//! One-time-pad codec
//!
//! Pure XOR over a key segment of exactly the plaintext's length. Provides
//! confidentiality only: an active adversary with write access to the shared
//! store can flip ciphertext bits undetected. No MAC is added because it
//! would either spend extra pad bytes per message or require a second shared
//! secret.

use crate::error::{Error, Result};

fn xor(data: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    if data.len() != key.len() {
        return Err(Error::Crypto(format!(
            "key length {} does not match data length {}",
            key.len(),
            data.len()
        )));
    }
    Ok(data.iter().zip(key.iter()).map(|(d, k)| d ^ k).collect())
}

/// Encrypt an envelope with an equal-length key segment
pub fn encrypt(plaintext: &[u8], key_bytes: &[u8]) -> Result<Vec<u8>> {
    xor(plaintext, key_bytes)
}

/// Decrypt a ciphertext with an equal-length key segment
pub fn decrypt(ciphertext: &[u8], key_bytes: &[u8]) -> Result<Vec<u8>> {
    xor(ciphertext, key_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    #[test]
    fn test_roundtrip() {
        let mut key = vec![0u8; 256];
        rand::rngs::OsRng.fill_bytes(&mut key);
        let plaintext: Vec<u8> = (0..=255).collect();

        let ciphertext = encrypt(&plaintext, &key).unwrap();
        assert_eq!(ciphertext.len(), plaintext.len());
        assert_ne!(ciphertext, plaintext);
        assert_eq!(decrypt(&ciphertext, &key).unwrap(), plaintext);
    }

    #[test]
    fn test_zero_key_is_identity() {
        let key = vec![0u8; 5];
        assert_eq!(encrypt(b"hello", &key).unwrap(), b"hello");
    }

    #[test]
    fn test_length_mismatch() {
        assert!(encrypt(b"hello", &[0u8; 4]).is_err());
        assert!(decrypt(b"hello", &[0u8; 6]).is_err());
    }

    #[test]
    fn test_empty() {
        assert_eq!(encrypt(&[], &[]).unwrap(), Vec::<u8>::new());
    }
}
