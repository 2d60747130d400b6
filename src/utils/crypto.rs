//! Batch encryption.
//!
//! ChaCha20-Poly1305 with an implicit nonce: the 96-bit nonce is the batch
//! counter, little-endian, zero padded. Both peers advance their counters once
//! per batch in delivery order, so a dropped, replayed or reordered batch opens
//! under the wrong nonce and fails authentication. Each direction has its own
//! key, which keeps a (key, nonce) pair from ever being used twice.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{ProtocolError, Result};

/// Authentication tag appended to every sealed batch
pub const TAG_LEN: usize = 16;

/// 256-bit key for one direction of a session
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Keys for both directions, as seen from one side of the session
#[derive(Debug, Clone)]
pub struct SessionKeys {
    pub inbound: SessionKey,
    pub outbound: SessionKey,
}

fn counter_nonce(counter: u64) -> Nonce {
    let mut nonce = [0u8; 12];
    nonce[..8].copy_from_slice(&counter.to_le_bytes());
    Nonce::from(nonce)
}

/// Encrypt one batch under `key` at position `counter`
pub fn seal(plaintext: &[u8], key: &SessionKey, counter: u64) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .encrypt(&counter_nonce(counter), plaintext)
        .map_err(|_| ProtocolError::EncryptionFailure)
}

/// Decrypt one batch; a wrong counter or any tampering is `DecryptionError`
pub fn open(ciphertext: &[u8], key: &SessionKey, counter: u64) -> Result<Vec<u8>> {
    if ciphertext.len() < TAG_LEN {
        return Err(ProtocolError::DecryptionError);
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(&counter_nonce(counter), ciphertext)
        .map_err(|_| ProtocolError::DecryptionError)
}

/// Stateful cipher for one session: keys plus the two rolling counters
pub struct BatchCipher {
    keys: SessionKeys,
    send_counter: u64,
    recv_counter: u64,
}

impl BatchCipher {
    pub fn new(keys: SessionKeys) -> Self {
        Self {
            keys,
            send_counter: 0,
            recv_counter: 0,
        }
    }

    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let sealed = seal(plaintext, &self.keys.outbound, self.send_counter)?;
        self.send_counter += 1;
        Ok(sealed)
    }

    /// The counter only advances on success; a failure is fatal to the
    /// session anyway.
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let plain = open(ciphertext, &self.keys.inbound, self.recv_counter)?;
        self.recv_counter += 1;
        Ok(plain)
    }

    pub fn counters(&self) -> (u64, u64) {
        (self.send_counter, self.recv_counter)
    }
}

impl std::fmt::Debug for BatchCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchCipher")
            .field("send_counter", &self.send_counter)
            .field("recv_counter", &self.recv_counter)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn key(byte: u8) -> SessionKey {
        SessionKey::from_bytes([byte; 32])
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let sealed = seal(b"chunk data", &key(1), 5).unwrap();
        assert_eq!(sealed.len(), b"chunk data".len() + TAG_LEN);
        assert_eq!(open(&sealed, &key(1), 5).unwrap(), b"chunk data");
    }

    #[test]
    fn test_counter_mismatch_fails() {
        let sealed = seal(b"payload", &key(1), 5).unwrap();
        assert!(matches!(
            open(&sealed, &key(1), 6),
            Err(ProtocolError::DecryptionError)
        ));
    }

    #[test]
    fn test_tampering_detected() {
        let mut sealed = seal(b"payload", &key(1), 0).unwrap();
        sealed[0] ^= 0x01;
        assert!(matches!(
            open(&sealed, &key(1), 0),
            Err(ProtocolError::DecryptionError)
        ));
        assert!(open(&[0u8; 4], &key(1), 0).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = seal(b"payload", &key(1), 0).unwrap();
        assert!(open(&sealed, &key(2), 0).is_err());
    }

    #[test]
    fn test_batch_cipher_pair() {
        let mut server = BatchCipher::new(SessionKeys {
            inbound: key(1),
            outbound: key(2),
        });
        let mut client = BatchCipher::new(SessionKeys {
            inbound: key(2),
            outbound: key(1),
        });

        for i in 0..5u8 {
            let sealed = client.seal(&[i; 10]).unwrap();
            assert_eq!(server.open(&sealed).unwrap(), vec![i; 10]);
        }
        let sealed = server.seal(b"pong").unwrap();
        assert_eq!(client.open(&sealed).unwrap(), b"pong");
        assert_eq!(server.counters(), (1, 5));
    }

    #[test]
    fn test_replayed_batch_rejected() {
        let mut sender = BatchCipher::new(SessionKeys {
            inbound: key(3),
            outbound: key(4),
        });
        let mut receiver = BatchCipher::new(SessionKeys {
            inbound: key(4),
            outbound: key(3),
        });
        let first = sender.seal(b"once").unwrap();
        receiver.open(&first).unwrap();
        assert!(receiver.open(&first).is_err());
    }
}
