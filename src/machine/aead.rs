use chacha20::cipher::{NewCipher, StreamCipher};
use chacha20::ChaCha20Legacy;
use poly1305::universal_hash::KeyInit;
use poly1305::Poly1305;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// Length in bytes of the tags generated by poly1305.
pub const TAG_SIZE: usize = 16;

/// ChaCha20-Poly1305 in the ssh arrangement: the first keystream block
/// yields the one-time Poly1305 key, payload bytes start at block one,
/// and the tag is the plain Poly1305 of the ciphertext. Encryption and
/// authentication are separate steps so a receiver can check the tag
/// before touching the cipher.
pub struct Aead {
    cipher: ChaCha20Legacy,
    poly_key: [u8; 32],
    // ciphertext accumulated for the mac since the last finalize
    pending: Vec<u8>,
    tag: [u8; TAG_SIZE],
}

impl Aead {
    pub fn new(key: &[u8; 32], iv: &[u8; 8]) -> Self {
        let mut cipher = ChaCha20Legacy::new(key.into(), iv.into());

        // consume the whole first block, the mac key is its first half
        let mut block = [0u8; 64];
        cipher.apply_keystream(&mut block);
        let mut poly_key = [0u8; 32];
        poly_key.copy_from_slice(&block[..32]);
        block.zeroize();

        Aead {
            cipher: cipher,
            poly_key: poly_key,
            pending: Vec::new(),
            tag: [0; TAG_SIZE],
        }
    }

    /// Enciphers `data` in place and feeds the ciphertext to the mac.
    pub fn encrypt(&mut self, data: &mut [u8]) {
        self.cipher.apply_keystream(data);
        self.pending.extend_from_slice(data);
    }

    /// Deciphers `data` in place. The ciphertext must have been passed
    /// through `auth` beforehand.
    pub fn decrypt(&mut self, data: &mut [u8]) {
        self.cipher.apply_keystream(data);
    }

    /// Feeds ciphertext to the mac without touching the cipher.
    pub fn auth(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
    }

    /// Computes the tag over everything fed since the last finalize.
    pub fn finalize(&mut self) -> [u8; TAG_SIZE] {
        let mac = Poly1305::new((&self.poly_key).into()).compute_unpadded(&self.pending);
        self.tag.copy_from_slice(mac.as_slice());
        self.pending.clear();
        self.tag
    }

    /// Constant-time comparison against the last computed tag.
    pub fn verify(&self, tag: &[u8; TAG_SIZE]) -> bool {
        self.tag[..].ct_eq(&tag[..]).unwrap_u8() == 1
    }
}

impl Drop for Aead {
    fn drop(&mut self) {
        self.poly_key.zeroize();
    }
}
