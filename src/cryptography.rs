use std::fmt;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    ChaCha20Poly1305, Nonce,
};
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use crate::error::ChatError;
use crate::{KEY_SIZE, NONCE_SIZE, RSA_KEY_BITS};

/// Smallest modulus that still fits an OAEP-SHA256 wrapped room key.
pub const MIN_RSA_KEY_BITS: usize = 1024;

/// Symmetric key used for chat payloads.
#[derive(Clone, PartialEq, Eq)]
pub struct RoomKey([u8; KEY_SIZE]);

impl RoomKey {
    pub fn generate() -> Self {
        let key = ChaCha20Poly1305::generate_key(&mut OsRng);
        RoomKey(key.into())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChatError> {
        let key: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| ChatError::Crypto(format!("room key must be {} bytes, got {}", KEY_SIZE, bytes.len())))?;
        Ok(RoomKey(key))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RoomKey(..)")
    }
}

/// Whether every peer shares one room key or each gets its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyMode {
    #[default]
    Shared,
    PerPeer,
}

/// Hands out room keys for newly registered peers.
///
/// In `Shared` mode the key is generated once, when the policy is built, and
/// handed to every peer for the rest of the process lifetime.
#[derive(Debug, Clone)]
pub struct KeyPolicy {
    shared: Option<RoomKey>,
}

impl KeyPolicy {
    pub fn new(mode: KeyMode) -> Self {
        let shared = match mode {
            KeyMode::Shared => Some(RoomKey::generate()),
            KeyMode::PerPeer => None,
        };
        KeyPolicy { shared }
    }

    /// Shared mode with a caller-supplied key.
    pub fn with_shared_key(key: RoomKey) -> Self {
        KeyPolicy { shared: Some(key) }
    }

    pub fn mode(&self) -> KeyMode {
        if self.shared.is_some() {
            KeyMode::Shared
        } else {
            KeyMode::PerPeer
        }
    }

    pub fn key_for_new_peer(&self) -> RoomKey {
        match &self.shared {
            Some(key) => key.clone(),
            None => RoomKey::generate(),
        }
    }
}

/// A client's RSA keypair. Generated once per connection, before the handshake.
#[derive(Clone)]
pub struct KeyPair {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl KeyPair {
    pub fn generate() -> Result<Self, ChatError> {
        Self::generate_with_bits(RSA_KEY_BITS)
    }

    pub fn generate_with_bits(bits: usize) -> Result<Self, ChatError> {
        if bits < MIN_RSA_KEY_BITS {
            return Err(ChatError::Crypto(format!("RSA key must be at least {} bits", MIN_RSA_KEY_BITS)));
        }
        let private_key = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| ChatError::Crypto(format!("RSA key generation failed: {}", e)))?;
        let public_key = RsaPublicKey::from(&private_key);
        Ok(KeyPair { private_key, public_key })
    }

    /// SubjectPublicKeyInfo PEM, sent verbatim in the handshake.
    pub fn export_public_key(&self) -> Result<String, ChatError> {
        self.public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| ChatError::Crypto(format!("public key export failed: {}", e)))
    }

    /// Recover the room key the server wrapped under our public key.
    pub fn unwrap_symmetric_key(&self, encrypted_key: &str) -> Result<RoomKey, ChatError> {
        let ciphertext = STANDARD
            .decode(encrypted_key.trim())
            .map_err(|e| ChatError::Crypto(format!("wrapped key is not base64: {}", e)))?;
        let key_bytes = self
            .private_key
            .decrypt(Oaep::new::<Sha256>(), &ciphertext)
            .map_err(|e| ChatError::Crypto(format!("key unwrap failed: {}", e)))?;
        RoomKey::from_bytes(&key_bytes)
    }
}

/// RSA-OAEP (SHA-256 hash and MGF1) wrap of `room_key` under a peer's PEM key, base64 encoded.
pub fn wrap_symmetric_key(peer_public_key: &str, room_key: &RoomKey) -> Result<String, ChatError> {
    let public_key = RsaPublicKey::from_public_key_pem(peer_public_key.trim())
        .map_err(|e| ChatError::Crypto(format!("peer public key is malformed: {}", e)))?;
    let wrapped = public_key
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), room_key.as_bytes())
        .map_err(|e| ChatError::Crypto(format!("key wrap failed: {}", e)))?;
    Ok(STANDARD.encode(wrapped))
}

/// Encrypt a chat payload. Output is base64 of `nonce || ciphertext || tag`.
pub fn encrypt_payload(room_key: &RoomKey, plaintext: &str) -> Result<String, ChatError> {
    let cipher = ChaCha20Poly1305::new(room_key.as_bytes().into());
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|_| ChatError::Crypto("payload encryption failed".into()))?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(nonce.as_slice());
    sealed.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(sealed))
}

/// Inverse of [`encrypt_payload`]. A wrong key or any tampering is an error,
/// never a garbled plaintext.
pub fn decrypt_payload(room_key: &RoomKey, ciphertext: &str) -> Result<String, ChatError> {
    let sealed = STANDARD
        .decode(ciphertext.trim())
        .map_err(|e| ChatError::Crypto(format!("payload is not base64: {}", e)))?;
    if sealed.len() < NONCE_SIZE {
        return Err(ChatError::Crypto("payload shorter than nonce".into()));
    }
    let (nonce_bytes, body) = sealed.split_at(NONCE_SIZE);

    let cipher = ChaCha20Poly1305::new(room_key.as_bytes().into());
    // The tag check happens inside decrypt; a mismatch never yields plaintext.
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), body)
        .map_err(|_| ChatError::Crypto("payload authentication failed".into()))?;

    String::from_utf8(plaintext).map_err(|_| ChatError::Crypto("payload is not UTF-8".into()))
}
