//! Payload encryption and compression.
//!
//! The client generates an RSA key pair and sends its public key in a `Handshake`. The server
//! answers with a random AES-128 key encrypted under that public key. From then on each
//! payload-bearing message may independently be gzip-compressed and/or AES-128/CBC encrypted;
//! the frame flags record which transformations were applied.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use aes::Aes128;
use bytes::Bytes;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use parking_lot::RwLock;
use rand::RngCore;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};

use crate::protocol::{Flags, Frame, ProtoMsg, MAX_FRAME_LENGTH};
use crate::{Error, Result};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Payloads larger than this are considered for gzip.
pub const COMPRESS_THRESHOLD: usize = 1024;

pub const AES_KEY_LEN: usize = 16;

pub const RSA_KEY_BITS: usize = 1024;

/// Both peers use the same IV; the key is what is negotiated per connection.
const FIXED_IV: [u8; 16] = *b"LightTunnel-IV00";

/// Per-connection AES-128 key.
#[derive(Clone, PartialEq, Eq)]
pub struct CipherKey([u8; AES_KEY_LEN]);

impl CipherKey {
    pub fn generate() -> Self {
        let mut key = [0u8; AES_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; AES_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| Error::crypto(format!("AES key must be {AES_KEY_LEN} bytes, got {}", bytes.len())))?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes128CbcEnc::new_from_slices(&self.0, &FIXED_IV)
            .map_err(|e| Error::crypto(e.to_string()))?;
        Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plain))
    }

    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes128CbcDec::new_from_slices(&self.0, &FIXED_IV)
            .map_err(|e| Error::crypto(e.to_string()))?;
        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(sealed)
            .map_err(|_| Error::crypto("bad padding"))
    }
}

impl std::fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CipherKey(..)")
    }
}

/// The client's half of the key exchange.
///
/// Generating a key pair takes tens of milliseconds; call [`RsaKeyPair::generate`] from
/// `spawn_blocking`.
pub struct RsaKeyPair {
    private: RsaPrivateKey,
    public_der: Bytes,
}

impl RsaKeyPair {
    pub fn generate() -> Result<Self> {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_KEY_BITS)
            .map_err(|e| Error::crypto(format!("RSA key generation failed: {e}")))?;
        let public_der = RsaPublicKey::from(&private)
            .to_public_key_der()
            .map_err(|e| Error::crypto(format!("RSA public key encoding failed: {e}")))?;
        Ok(Self {
            private,
            public_der: Bytes::copy_from_slice(public_der.as_bytes()),
        })
    }

    /// PKCS#8 SubjectPublicKeyInfo DER.
    pub fn public_der(&self) -> Bytes {
        self.public_der.clone()
    }

    /// Recover the AES key the server sent back.
    pub fn open_cipher_key(&self, sealed: &[u8]) -> Result<CipherKey> {
        let plain = self
            .private
            .decrypt(Pkcs1v15Encrypt, sealed)
            .map_err(|e| Error::crypto(format!("RSA decrypt failed: {e}")))?;
        CipherKey::from_slice(&plain)
    }
}

/// Server side: encrypt `key` for the client whose public key is `public_der`.
pub fn seal_cipher_key(public_der: &[u8], key: &CipherKey) -> Result<Vec<u8>> {
    let public = RsaPublicKey::from_public_key_der(public_der)
        .map_err(|e| Error::crypto(format!("invalid RSA public key: {e}")))?;
    public
        .encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, key.as_bytes())
        .map_err(|e| Error::crypto(format!("RSA encrypt failed: {e}")))
}

pub fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Inflate at most `limit` bytes; anything larger is an error.
pub fn gunzip(data: &[u8], limit: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| Error::protocol(format!("corrupt gzip payload: {e}")))?;
    if out.len() > limit {
        return Err(Error::protocol(format!("gzip payload inflates past {limit} bytes")));
    }
    Ok(out)
}

/// Compression/encryption state of one control connection.
///
/// Shared by the link's reader and writer halves, so the key lives behind a lock.
#[derive(Debug)]
pub struct PayloadCrypto {
    key: RwLock<Option<CipherKey>>,
    encrypt: AtomicBool,
}

impl PayloadCrypto {
    pub fn new() -> Self {
        Self {
            key: RwLock::new(None),
            encrypt: AtomicBool::new(true),
        }
    }

    pub fn install_key(&self, key: CipherKey) {
        *self.key.write() = Some(key);
    }

    pub fn has_key(&self) -> bool {
        self.key.read().is_some()
    }

    /// Toggle outbound encryption. Inbound messages flagged ENCRYPTED are still opened.
    pub fn set_encrypt(&self, enabled: bool) {
        self.encrypt.store(enabled, Ordering::Relaxed);
    }

    /// Compress, then encrypt, the payload of `msg`.
    pub fn seal(&self, msg: ProtoMsg) -> Result<Frame> {
        let Some(payload) = msg.payload() else {
            return Ok(Frame::plain(msg));
        };

        let mut flags = Flags::NONE;
        let mut data = payload.clone();

        if data.len() > COMPRESS_THRESHOLD {
            let packed = gzip(&data)?;
            if packed.len() < data.len() {
                data = Bytes::from(packed);
                flags.insert(Flags::GZIP);
            }
        }

        if msg.is_encryptable() && self.encrypt.load(Ordering::Relaxed) {
            if let Some(key) = self.key.read().as_ref() {
                data = Bytes::from(key.encrypt(&data)?);
                flags.insert(Flags::ENCRYPTED);
            }
        }

        if flags == Flags::NONE {
            return Ok(Frame::plain(msg));
        }
        Ok(Frame::new(flags, msg.with_payload(data)))
    }

    /// Decrypt, then decompress, according to the frame flags.
    pub fn open(&self, frame: Frame) -> Result<ProtoMsg> {
        let Frame { flags, msg } = frame;
        if flags == Flags::NONE {
            return Ok(msg);
        }
        let Some(payload) = msg.payload() else {
            return Err(Error::protocol(format!("{} must not carry flags", msg.name())));
        };

        let mut data = payload.clone();
        if flags.contains(Flags::ENCRYPTED) {
            let guard = self.key.read();
            let key = guard
                .as_ref()
                .ok_or_else(|| Error::crypto("encrypted message before key exchange"))?;
            data = Bytes::from(key.decrypt(&data)?);
        }
        if flags.contains(Flags::GZIP) {
            data = Bytes::from(gunzip(&data, MAX_FRAME_LENGTH)?);
        }
        Ok(msg.with_payload(data))
    }
}

impl Default for PayloadCrypto {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(data: Vec<u8>) -> ProtoMsg {
        ProtoMsg::Transfer {
            tunnel_id: 1,
            session_id: 1,
            data: Bytes::from(data),
        }
    }

    fn keyed() -> PayloadCrypto {
        let crypto = PayloadCrypto::new();
        crypto.install_key(CipherKey::generate());
        crypto
    }

    #[test]
    fn test_aes_roundtrip() {
        let key = CipherKey::generate();
        let sealed = key.encrypt(b"attack at dawn").unwrap();
        assert_eq!(sealed.len() % 16, 0);
        assert_ne!(&sealed[..], b"attack at dawn");
        assert_eq!(key.decrypt(&sealed).unwrap(), b"attack at dawn");
    }

    #[test]
    fn test_aes_wrong_key_fails_cleanly() {
        let sealed = CipherKey::generate().encrypt(&[7u8; 40]).unwrap();
        // A wrong key almost always yields bad padding; either way it must not panic
        if let Ok(plain) = CipherKey::generate().decrypt(&sealed) {
            assert_ne!(plain, vec![7u8; 40]);
        }
        assert!(CipherKey::generate().decrypt(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_rsa_key_exchange() {
        let pair = RsaKeyPair::generate().unwrap();
        let key = CipherKey::generate();
        let sealed = seal_cipher_key(&pair.public_der(), &key).unwrap();
        assert_eq!(pair.open_cipher_key(&sealed).unwrap(), key);
        assert!(seal_cipher_key(b"not a key", &key).is_err());
    }

    #[test]
    fn test_gunzip_limit() {
        let packed = gzip(&vec![0u8; 10_000]).unwrap();
        assert_eq!(gunzip(&packed, 10_000).unwrap().len(), 10_000);
        assert!(gunzip(&packed, 9_999).is_err());
        assert!(gunzip(b"definitely not gzip", 100).is_err());
    }

    #[test]
    fn test_small_payload_left_alone() {
        let frame = keyed_without_encrypt().seal(transfer(vec![1; 100])).unwrap();
        assert_eq!(frame.flags, Flags::NONE);
    }

    fn keyed_without_encrypt() -> PayloadCrypto {
        let crypto = keyed();
        crypto.set_encrypt(false);
        crypto
    }

    #[test]
    fn test_gzip_only_opens_without_key() {
        let msg = transfer(vec![b'a'; 8192]);
        let frame = PayloadCrypto::new().seal(msg.clone()).unwrap();
        assert_eq!(frame.flags, Flags::GZIP);
        assert!(frame.msg.payload().unwrap().len() < 8192);

        assert_eq!(PayloadCrypto::new().open(frame).unwrap(), msg);
    }

    #[test]
    fn test_gzip_and_encrypted_needs_key() {
        let sender = keyed();
        let msg = transfer(vec![b'z'; 4096]);
        let frame = sender.seal(msg.clone()).unwrap();
        assert_eq!(frame.flags, Flags::GZIP | Flags::ENCRYPTED);

        let err = PayloadCrypto::new().open(frame.clone()).unwrap_err();
        assert!(matches!(err, Error::Crypto(_)));

        assert_eq!(sender.open(frame).unwrap(), msg);
    }

    #[test]
    fn test_incompressible_payload_only_encrypted() {
        let mut noise = vec![0u8; 4096];
        rand::thread_rng().fill_bytes(&mut noise);
        let sender = keyed();
        let frame = sender.seal(transfer(noise.clone())).unwrap();
        assert_eq!(frame.flags, Flags::ENCRYPTED);
        assert_eq!(sender.open(frame).unwrap(), transfer(noise));
    }

    #[test]
    fn test_handshake_never_encrypted() {
        let frame = keyed()
            .seal(ProtoMsg::Handshake {
                data: Bytes::from_static(b"public key"),
            })
            .unwrap();
        assert_eq!(frame.flags, Flags::NONE);
    }

    #[test]
    fn test_flagged_control_message_rejected() {
        let frame = Frame::new(Flags::GZIP, ProtoMsg::Ping);
        assert!(PayloadCrypto::new().open(frame).is_err());
    }
}
