use std::fmt;
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use chacha20::cipher::{NewCipher, StreamCipher};
use chacha20::ChaCha20Legacy;
use hkdf::Hkdf;
use secp256k1::{ecdh, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::aead::{Aead, TAG_SIZE};
use super::Error;

// Key-schedule parameters fixed by the protocol. Both sides must agree
// on these bytewise or every derived key diverges.
const HKDF_SALT: &[u8] = b"bitcoinecdh";
const INFO_K1: &[u8] = b"BitcoinK1";
const INFO_K2: &[u8] = b"BitcoinK2";
const INFO_SID: &[u8] = b"BitcoinSessionID";

// A direction re-keys after this many processed bytes or after this
// much time, whichever comes first.
const REKEY_BYTES: u64 = 1024 * (1 << 20);
const REKEY_TIMEOUT: Duration = Duration::from_secs(10);

/// Cipher suite carried in encinit. Only chacha20-poly1305 is defined.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CipherId {
    ChaChaPoly = 0,
}

impl CipherId {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CipherId::ChaChaPoly),
            _ => None,
        }
    }
}

#[derive(Zeroize, ZeroizeOnDrop)]
pub(super) struct StreamKeys {
    pub(super) k1: [u8; 32],
    pub(super) k2: [u8; 32],
    pub(super) sid: [u8; 32],
}

/// One direction of an encrypted link: an ephemeral key pair, the keys
/// derived from the ECDH with the peer, and the pair of cipher states
/// that encode frames. The low four bytes of the iv mirror the sequence
/// counter, the high four stay zero.
pub struct CipherStream {
    secret: SecretKey,
    public: PublicKey,
    cipher: CipherId,
    keys: Option<StreamKeys>,
    iv: [u8; 8],
    seq: u32,
    size_cipher: Option<ChaCha20Legacy>,
    aead: Option<Aead>,
    processed: u64,
    last_rekey: Instant,
}

impl fmt::Debug for CipherStream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            r#"
        cipher: {:?}
        seq:    {:?}
        sid:    {:?}
        "#,
            self.cipher,
            self.seq,
            self.keys.as_ref().map(|keys| hex::encode(keys.sid)),
        )
    }
}

// from_slice only refuses zero and values past the group order
pub(super) fn random_secret_key() -> SecretKey {
    loop {
        let bytes: [u8; 32] = rand::random();
        if let Ok(secret) = SecretKey::from_slice(&bytes) {
            return secret;
        }
    }
}

// next_key = SHA256(SHA256(sid || key))
fn rotate_key(sid: &[u8; 32], key: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(sid);
    hasher.update(key);
    let once = hasher.finalize();
    let twice = Sha256::digest(&once);

    let mut next = [0u8; 32];
    next.copy_from_slice(&twice);
    next
}

impl CipherStream {
    pub fn new(cipher: CipherId) -> Self {
        CipherStream::with_secret(random_secret_key(), cipher)
    }

    /// Builds a stream around an existing ephemeral key. The two
    /// directions of a session share one keypair so that both derive
    /// the same session id.
    pub(super) fn with_secret(secret: SecretKey, cipher: CipherId) -> Self {
        let public = PublicKey::from_secret_key(&Secp256k1::new(), &secret);
        CipherStream {
            secret: secret,
            public: public,
            cipher: cipher,
            keys: None,
            iv: [0; 8],
            seq: 0,
            size_cipher: None,
            aead: None,
            processed: 0,
            last_rekey: Instant::now(),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    pub fn cipher(&self) -> CipherId {
        self.cipher
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// True once `init` has derived the session keys.
    pub fn is_ready(&self) -> bool {
        self.keys.is_some()
    }

    pub fn session_id(&self) -> Option<[u8; 32]> {
        self.keys.as_ref().map(|keys| keys.sid)
    }

    #[cfg(test)]
    pub(crate) fn cipher_keys(&self) -> Option<([u8; 32], [u8; 32])> {
        self.keys.as_ref().map(|keys| (keys.k1, keys.k2))
    }

    /// Derives K1, K2 and the session id from the ECDH with the peer's
    /// ephemeral key, then keys both cipher states at sequence zero.
    pub fn init(&mut self, peer_public: &[u8; 33]) -> Result<(), Error> {
        let peer = PublicKey::from_slice(&peer_public[..]).map_err(Error::Crypto)?;

        // the shared secret is the x coordinate of the shared point
        let mut point = ecdh::shared_secret_point(&peer, &self.secret);
        let mut ikm = [0u8; 33];
        ikm[..32].copy_from_slice(&point[..32]);
        ikm[32] = self.cipher as u8;
        point.zeroize();

        let hkdf = Hkdf::<Sha256>::new(Some(HKDF_SALT), &ikm);
        ikm.zeroize();
        let mut keys = StreamKeys {
            k1: [0; 32],
            k2: [0; 32],
            sid: [0; 32],
        };
        hkdf.expand(INFO_K1, &mut keys.k1)
            .map_err(|_| Error::KeyDerivation)?;
        hkdf.expand(INFO_K2, &mut keys.k2)
            .map_err(|_| Error::KeyDerivation)?;
        hkdf.expand(INFO_SID, &mut keys.sid)
            .map_err(|_| Error::KeyDerivation)?;

        self.keys = Some(keys);
        self.seq = 0;
        self.iv = [0; 8];
        self.reset_ciphers();
        self.processed = 0;
        self.last_rekey = Instant::now();
        Ok(())
    }

    /// Counts `frame` against the re-key thresholds. A `true` return
    /// resets both counters; the caller is expected to re-key.
    pub fn should_rekey(&mut self, frame: &[u8]) -> bool {
        self.processed += frame.len() as u64;
        if self.processed >= REKEY_BYTES || self.last_rekey.elapsed() >= REKEY_TIMEOUT {
            self.processed = 0;
            self.last_rekey = Instant::now();
            return true;
        }
        false
    }

    /// Moves the encryption keys forward. Without explicit replacements
    /// both keys ratchet through SHA256d(sid || key). The sequence and
    /// iv survive a re-key, only the keys change.
    pub fn rekey(&mut self, k1: Option<[u8; 32]>, k2: Option<[u8; 32]>) -> Result<(), Error> {
        let keys = self.keys.as_mut().ok_or(Error::NotInitialized)?;
        let next_k1 = match k1 {
            Some(key) => key,
            None => rotate_key(&keys.sid, &keys.k1),
        };
        let next_k2 = match k2 {
            Some(key) => key,
            None => rotate_key(&keys.sid, &keys.k2),
        };
        keys.k1 = next_k1;
        keys.k2 = next_k2;
        self.reset_ciphers();
        Ok(())
    }

    /// Advances the sequence counter and re-keys both cipher states
    /// with the updated iv. Called exactly once per frame; stray calls
    /// desynchronize the link.
    pub fn sequence(&mut self) -> Result<(), Error> {
        if self.keys.is_none() {
            return Err(Error::NotInitialized);
        }
        self.seq = self.seq.wrapping_add(1);
        LittleEndian::write_u32(&mut self.iv[..4], self.seq);
        self.reset_ciphers();
        Ok(())
    }

    pub fn encrypt_size(&mut self, size: &mut [u8]) -> Result<(), Error> {
        let cipher = self.size_cipher.as_mut().ok_or(Error::NotInitialized)?;
        cipher.apply_keystream(size);
        Ok(())
    }

    pub fn decrypt_size(&mut self, size: &mut [u8]) -> Result<u32, Error> {
        let cipher = self.size_cipher.as_mut().ok_or(Error::NotInitialized)?;
        cipher.apply_keystream(size);
        Ok(LittleEndian::read_u32(size))
    }

    pub fn encrypt(&mut self, data: &mut [u8]) -> Result<(), Error> {
        self.aead.as_mut().ok_or(Error::NotInitialized)?.encrypt(data);
        Ok(())
    }

    pub fn decrypt(&mut self, data: &mut [u8]) -> Result<(), Error> {
        self.aead.as_mut().ok_or(Error::NotInitialized)?.decrypt(data);
        Ok(())
    }

    pub fn auth(&mut self, data: &[u8]) -> Result<(), Error> {
        self.aead.as_mut().ok_or(Error::NotInitialized)?.auth(data);
        Ok(())
    }

    pub fn finalize(&mut self) -> Result<[u8; TAG_SIZE], Error> {
        Ok(self.aead.as_mut().ok_or(Error::NotInitialized)?.finalize())
    }

    pub fn verify(&self, tag: &[u8; TAG_SIZE]) -> Result<bool, Error> {
        Ok(self.aead.as_ref().ok_or(Error::NotInitialized)?.verify(tag))
    }

    fn reset_ciphers(&mut self) {
        if let Some(keys) = &self.keys {
            self.size_cipher = Some(ChaCha20Legacy::new((&keys.k1).into(), (&self.iv).into()));
            self.aead = Some(Aead::new(&keys.k2, &self.iv));
        }
    }
}

impl Drop for CipherStream {
    fn drop(&mut self) {
        self.secret.non_secure_erase();
        self.iv.zeroize();
    }
}
