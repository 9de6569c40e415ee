use std::sync::Arc;

use crate::{
    connection::error::CipherError,
    types::{HostType, SequenceNumber},
};

pub const NONCE_BYTES: usize = 12;

/// Authenticated encryption applied to the body of every sequenced packet
pub trait PacketCipher: Send + Sync {
    /// Bytes added to each encrypted payload
    fn overhead(&self) -> usize;

    /// Encrypts `buffer` in place, appending the tag. `aad` is authenticated
    /// but left in clear.
    fn encrypt(
        &self,
        nonce: &[u8; NONCE_BYTES],
        aad: &[u8],
        buffer: &mut Vec<u8>,
    ) -> Result<(), CipherError>;

    /// Verifies and strips the tag, decrypting `buffer` in place
    fn decrypt(
        &self,
        nonce: &[u8; NONCE_BYTES],
        aad: &[u8],
        buffer: &mut Vec<u8>,
    ) -> Result<(), CipherError>;
}

/// Nonce for one packet. Each direction uses its own sender byte, so both
/// peers can share a key without ever reusing a nonce.
pub fn packet_nonce(sender: HostType, seq: SequenceNumber) -> [u8; NONCE_BYTES] {
    let mut nonce = [0u8; NONCE_BYTES];
    nonce[0] = sender.to_byte();
    nonce[4..].copy_from_slice(&u64::from(seq).to_be_bytes());
    nonce
}

cfg_if! {
    if #[cfg(feature = "encryption")] {
        use aes_gcm::{
            aead::{AeadInPlace, KeyInit},
            Aes256Gcm, Nonce,
        };

        pub const KEY_BYTES: usize = 32;
        const TAG_BYTES: usize = 16;

        /// AES-256-GCM with a 16 byte tag
        pub struct AesGcmCipher {
            cipher: Aes256Gcm,
        }

        impl AesGcmCipher {
            pub fn try_new(key: &[u8]) -> Result<Self, CipherError> {
                let cipher =
                    Aes256Gcm::new_from_slice(key).map_err(|_| CipherError::InvalidKeyLength {
                        expected: KEY_BYTES,
                        actual: key.len(),
                    })?;
                Ok(Self { cipher })
            }

            /// # Panics
            ///
            /// Panics if `key` is not 32 bytes long
            pub fn new(key: &[u8]) -> Self {
                match Self::try_new(key) {
                    Ok(cipher) => cipher,
                    Err(error) => panic!("{}", error),
                }
            }
        }

        impl PacketCipher for AesGcmCipher {
            fn overhead(&self) -> usize {
                TAG_BYTES
            }

            fn encrypt(
                &self,
                nonce: &[u8; NONCE_BYTES],
                aad: &[u8],
                buffer: &mut Vec<u8>,
            ) -> Result<(), CipherError> {
                let length = buffer.len();
                self.cipher
                    .encrypt_in_place(Nonce::from_slice(nonce), aad, buffer)
                    .map_err(|_| CipherError::EncryptFailed { length })
            }

            fn decrypt(
                &self,
                nonce: &[u8; NONCE_BYTES],
                aad: &[u8],
                buffer: &mut Vec<u8>,
            ) -> Result<(), CipherError> {
                let length = buffer.len();
                self.cipher
                    .decrypt_in_place(Nonce::from_slice(nonce), aad, buffer)
                    .map_err(|_| CipherError::DecryptFailed { length })
            }
        }

        /// Builds the cipher for a configured key
        pub fn cipher_for_key(key: &[u8]) -> Result<Arc<dyn PacketCipher>, CipherError> {
            Ok(Arc::new(AesGcmCipher::try_new(key)?))
        }
    } else {
        /// Builds the cipher for a configured key
        pub fn cipher_for_key(_key: &[u8]) -> Result<Arc<dyn PacketCipher>, CipherError> {
            Err(CipherError::Unavailable)
        }
    }
}
