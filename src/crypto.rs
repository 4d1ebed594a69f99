//! Crypto Engine (C1): RSA-OAEP-SHA256 handshake keys plus the AES-256-CBC/SHA-256
//! frame pipeline shared by the control and data planes after handshake.
//!
//! # Guarantees
//! * A fresh [`CryptoEngine`] always carries its own 4096-bit RSA keypair.
//! * A server-role engine also carries session key material from construction;
//!   a client-role engine only gets session material via [`CryptoEngine::install_session`].
//! * [`CryptoEngine::seal`] and [`CryptoEngine::open`] are exact inverses for a matching
//!   `(key, iv, encrypt_on, integrity_on)` tuple (R2).

use aes::Aes256;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::error::CryptoError;

/// Asymmetric key size mandated by SPEC_FULL.md §9: large enough that the
/// authentication-success record (base64 key + iv + telemetry) fits in a single
/// OAEP-SHA256 block.
const RSA_KEY_BITS: usize = 4096;
const AES_KEY_LEN: usize = 32;
const AES_IV_LEN: usize = 16;
const HASH_LEN: usize = 32;
/// Largest plaintext OAEP-SHA256 can wrap for a 4096-bit (512-byte) modulus:
/// `k - 2*hLen - 2` = `512 - 64 - 2`. Matches SPEC_FULL.md §9's requirement that the
/// authentication-success record (key + iv + telemetry, base64-encoded) fit one block.
const OAEP_SHA256_4096_MAX_PLAINTEXT: usize = 446;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Owns a session's asymmetric identity and, once installed, its symmetric session
/// material. Mirrors `echowarp.services.crypto_manager.CryptoManager`.
pub struct CryptoEngine {
    is_server: bool,
    is_encrypt: bool,
    is_integrity_control: bool,
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
    peer_public_key: Option<RsaPublicKey>,
    aes_key: Option<[u8; AES_KEY_LEN]>,
    // A single IV is generated per session and reused for every `seal` call. This
    // mirrors the source's behavior exactly (`crypto_manager.py` generates the IV
    // once and never rotates it) and is a documented weakness, not an oversight:
    // CBC with a fixed IV leaks equality of frame prefixes across a session.
    aes_iv: Option<[u8; AES_IV_LEN]>,
}

impl CryptoEngine {
    /// Builds a fresh engine with its own RSA keypair. Server-role engines also
    /// generate session key material immediately; client-role engines must call
    /// [`CryptoEngine::install_session`] once the handshake delivers it.
    pub fn new(is_server: bool, is_encrypt: bool, is_integrity_control: bool) -> Self {
        let private_key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
            .expect("RSA keypair generation must not fail for a fixed, valid key size");
        let public_key = RsaPublicKey::from(&private_key);

        let (aes_key, aes_iv) = if is_server {
            let mut key = [0u8; AES_KEY_LEN];
            let mut iv = [0u8; AES_IV_LEN];
            rand::RngCore::fill_bytes(&mut OsRng, &mut key);
            rand::RngCore::fill_bytes(&mut OsRng, &mut iv);
            (Some(key), Some(iv))
        } else {
            (None, None)
        };

        Self {
            is_server,
            is_encrypt,
            is_integrity_control,
            private_key,
            public_key,
            peer_public_key: None,
            aes_key,
            aes_iv,
        }
    }

    pub fn is_encrypt(&self) -> bool {
        self.is_encrypt
    }

    pub fn is_integrity_control(&self) -> bool {
        self.is_integrity_control
    }

    /// Returns this engine's public key in PEM SubjectPublicKeyInfo form, the
    /// self-describing byte blob sent plaintext at the start of the handshake.
    pub fn serialized_public_key(&self) -> Result<String, CryptoError> {
        self.public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|_| CryptoError::BadKey)
    }

    /// Loads the peer's public key from the same PEM form.
    pub fn load_peer_public_key(&mut self, pem: &str) -> Result<(), CryptoError> {
        let key = RsaPublicKey::from_public_key_pem(pem).map_err(|_| CryptoError::BadKey)?;
        self.peer_public_key = Some(key);
        Ok(())
    }

    /// RSA-OAEP-SHA256 encrypts `data` to the loaded peer public key.
    pub fn encrypt_asym(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() > OAEP_SHA256_4096_MAX_PLAINTEXT {
            return Err(CryptoError::AsymSize);
        }
        let peer = self.peer_public_key.as_ref().ok_or(CryptoError::State)?;
        peer.encrypt(&mut OsRng, Oaep::new::<Sha256>(), data)
            .map_err(|_| CryptoError::AsymSize)
    }

    /// RSA-OAEP-SHA256 decrypts `data` with this engine's own private key.
    pub fn decrypt_asym(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.private_key
            .decrypt(Oaep::new::<Sha256>(), data)
            .map_err(|_| CryptoError::Decrypt)
    }

    /// Base64 encoding of the session AES key, sent by the server in the
    /// authentication-success record.
    pub fn aes_key_base64(&self) -> Option<String> {
        self.aes_key.map(|k| BASE64.encode(k))
    }

    /// Base64 encoding of the session AES IV.
    pub fn aes_iv_base64(&self) -> Option<String> {
        self.aes_iv.map(|v| BASE64.encode(v))
    }

    /// Installs session key material received from the server during the
    /// handshake. Only valid on a client-role engine.
    ///
    /// # Errors
    /// Returns [`CryptoError::State`] if called on a server-role engine.
    pub fn install_session(
        &mut self,
        key_b64: &str,
        iv_b64: &str,
        encrypt_on: bool,
        integrity_on: bool,
    ) -> Result<(), CryptoError> {
        if self.is_server {
            return Err(CryptoError::State);
        }
        let key_bytes = BASE64.decode(key_b64).map_err(|_| CryptoError::BadKey)?;
        let iv_bytes = BASE64.decode(iv_b64).map_err(|_| CryptoError::BadKey)?;
        let key: [u8; AES_KEY_LEN] = key_bytes.try_into().map_err(|_| CryptoError::BadKey)?;
        let iv: [u8; AES_IV_LEN] = iv_bytes.try_into().map_err(|_| CryptoError::BadKey)?;

        self.aes_key = Some(key);
        self.aes_iv = Some(iv);
        self.is_encrypt = encrypt_on;
        self.is_integrity_control = integrity_on;
        Ok(())
    }

    /// Applies the per-frame pipeline: integrity hash prefix, then symmetric
    /// encryption, in that order. Both steps are individually optional per the
    /// flags negotiated during handshake.
    pub fn seal(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let with_hash = if self.is_integrity_control {
            let mut hashed = Vec::with_capacity(HASH_LEN + data.len());
            hashed.extend_from_slice(&Sha256::digest(data));
            hashed.extend_from_slice(data);
            hashed
        } else {
            data.to_vec()
        };

        if self.is_encrypt {
            self.encrypt_aes(&with_hash)
        } else {
            Ok(with_hash)
        }
    }

    /// Inverse of [`CryptoEngine::seal`]: decrypts (if encryption is on) then
    /// verifies and strips the integrity hash (if integrity control is on).
    pub fn open(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let decrypted = if self.is_encrypt {
            self.decrypt_aes(data)?
        } else {
            data.to_vec()
        };

        if self.is_integrity_control {
            if decrypted.len() < HASH_LEN {
                return Err(CryptoError::Integrity);
            }
            let (hash, payload) = decrypted.split_at(HASH_LEN);
            if hash != Sha256::digest(payload).as_slice() {
                return Err(CryptoError::Integrity);
            }
            Ok(payload.to_vec())
        } else {
            Ok(decrypted)
        }
    }

    fn encrypt_aes(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self.aes_key.ok_or(CryptoError::State)?;
        let iv = self.aes_iv.ok_or(CryptoError::State)?;
        let encryptor = Aes256CbcEnc::new(&key.into(), &iv.into());
        Ok(encryptor.encrypt_padded_vec_mut::<Pkcs7>(data))
    }

    fn decrypt_aes(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self.aes_key.ok_or(CryptoError::State)?;
        let iv = self.aes_iv.ok_or(CryptoError::State)?;
        let decryptor = Aes256CbcDec::new(&key.into(), &iv.into());
        decryptor
            .decrypt_padded_vec_mut::<Pkcs7>(data)
            .map_err(|e| CryptoError::Symmetric(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip_null_pipeline() {
        let engine = CryptoEngine::new(true, false, false);
        let frame = b"stereo pcm block".to_vec();
        let sealed = engine.seal(&frame).unwrap();
        assert_eq!(sealed, frame);
        let opened = engine.open(&sealed).unwrap();
        assert_eq!(opened, frame);
    }

    #[test]
    fn seal_open_round_trip_integrity_only() {
        let engine = CryptoEngine::new(true, false, true);
        let frame = b"some pcm bytes".to_vec();
        let sealed = engine.seal(&frame).unwrap();
        assert_eq!(sealed.len(), HASH_LEN + frame.len());
        assert_eq!(&sealed[HASH_LEN..], &frame[..]);
        let opened = engine.open(&sealed).unwrap();
        assert_eq!(opened, frame);
    }

    #[test]
    fn seal_open_round_trip_encrypt_and_integrity() {
        let engine = CryptoEngine::new(true, true, true);
        let frame = b"a longer pcm block of audio samples".to_vec();
        let sealed = engine.seal(&frame).unwrap();
        let opened = engine.open(&sealed).unwrap();
        assert_eq!(opened, frame);
    }

    #[test]
    fn flipped_byte_fails_integrity_check() {
        let engine = CryptoEngine::new(true, true, true);
        let frame = b"audio".to_vec();
        let mut sealed = engine.seal(&frame).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        let result = engine.open(&sealed);
        assert!(matches!(result, Err(CryptoError::Symmetric(_)) | Err(CryptoError::Integrity)));
    }

    #[test]
    fn client_install_session_then_round_trip_matches_server() {
        let server = CryptoEngine::new(true, true, true);
        let mut client = CryptoEngine::new(false, false, false);
        client
            .install_session(
                &server.aes_key_base64().unwrap(),
                &server.aes_iv_base64().unwrap(),
                true,
                true,
            )
            .unwrap();

        let frame = b"frame from server to client".to_vec();
        let sealed = server.seal(&frame).unwrap();
        let opened = client.open(&sealed).unwrap();
        assert_eq!(opened, frame);
    }

    #[test]
    fn install_session_rejected_on_server_engine() {
        let mut server = CryptoEngine::new(true, true, true);
        let err = server
            .install_session("AAAA", "AAAA", true, true)
            .unwrap_err();
        assert!(matches!(err, CryptoError::State));
    }

    #[test]
    fn asym_round_trip() {
        let mut alice = CryptoEngine::new(true, false, false);
        let bob = CryptoEngine::new(false, false, false);
        alice
            .load_peer_public_key(&bob.serialized_public_key().unwrap())
            .unwrap();
        let msg = b"handshake token";
        let ciphertext = alice.encrypt_asym(msg).unwrap();
        let plaintext = bob.decrypt_asym(&ciphertext).unwrap();
        assert_eq!(plaintext, msg);
    }

    #[test]
    fn encrypt_asym_rejects_oversized_plaintext() {
        let mut alice = CryptoEngine::new(true, false, false);
        let bob = CryptoEngine::new(false, false, false);
        alice
            .load_peer_public_key(&bob.serialized_public_key().unwrap())
            .unwrap();
        let too_big = vec![0u8; OAEP_SHA256_4096_MAX_PLAINTEXT + 1];
        let err = alice.encrypt_asym(&too_big).unwrap_err();
        assert!(matches!(err, CryptoError::AsymSize));
    }

    #[test]
    fn load_peer_public_key_rejects_garbage() {
        let mut engine = CryptoEngine::new(true, false, false);
        let err = engine.load_peer_public_key("not a pem").unwrap_err();
        assert!(matches!(err, CryptoError::BadKey));
    }
}
