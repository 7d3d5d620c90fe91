//! Cryptographic capability traits and a software reference
//! implementation.
//!
//! The core depends only on these traits — crypto is injected, never
//! hardcoded — so a caller embedding the engine can swap in a
//! PKCS#11/HSM-backed provider without touching `ike_sa`/`child_sa`.
//! [`SoftwareProvider`] is the reference implementation used by tests.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce as AesNonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("AEAD seal/open failed")]
    AeadFailed,
    #[error("invalid key length: expected {expected}, got {got}")]
    BadKeyLength { expected: usize, got: usize },
    #[error("unsupported algorithm id {0}")]
    Unsupported(u16),
}

pub type CryptoResult<T> = std::result::Result<T, CryptoError>;

/// Authenticated encryption used for SK payload bodies and ESP.
pub trait AeadCipher: Send + Sync {
    fn seal(&self, key: &[u8], nonce: &[u8], aad: &[u8], plaintext: &[u8]) -> CryptoResult<Vec<u8>>;
    fn open(&self, key: &[u8], nonce: &[u8], aad: &[u8], ciphertext: &[u8]) -> CryptoResult<Vec<u8>>;
    fn key_len(&self) -> usize;
}

/// Keyed-hash MAC used for `prf` and `prf+` (RFC 7296 section 2.13).
pub trait Prf: Send + Sync {
    fn prf(&self, key: &[u8], data: &[u8]) -> Vec<u8>;
    fn output_len(&self) -> usize;

    /// `prf+ (K, S) = T1 | T2 | T3 | ...` where `T1 = prf(K, S | 0x01)`,
    /// `T(n) = prf(K, T(n-1) | S | n)`.
    fn prf_plus(&self, key: &[u8], seed: &[u8], out_len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(out_len + self.output_len());
        let mut t_prev: Vec<u8> = Vec::new();
        let mut counter: u8 = 1;
        while out.len() < out_len {
            let mut input = Vec::with_capacity(t_prev.len() + seed.len() + 1);
            input.extend_from_slice(&t_prev);
            input.extend_from_slice(seed);
            input.push(counter);
            let t = self.prf(key, &input);
            out.extend_from_slice(&t);
            t_prev = t;
            counter = counter.wrapping_add(1);
        }
        out.truncate(out_len);
        out
    }
}

/// Diffie-Hellman group used for KE payloads.
pub trait DiffieHellman: Send + Sync {
    fn generate_keypair(&self) -> (Vec<u8>, DhPrivate);
    fn shared_secret(&self, private: &DhPrivate, peer_public: &[u8]) -> CryptoResult<Vec<u8>>;
    fn public_len(&self) -> usize;
}

/// Opaque holder for a DH private scalar; zeroized on drop so key
/// material never outlives the exchange that produced it.
pub struct DhPrivate(Vec<u8>);

impl Drop for DhPrivate {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Bundle of capability implementations an `IkeSa` is constructed with.
/// Deliberately not a trait object field-by-field: a provider either
/// implements all three or the daemon cannot negotiate with it, so one
/// trait object per bundle keeps the failure mode at construction time.
pub trait CryptoProvider: Send + Sync {
    fn aead(&self, algorithm_id: u16) -> CryptoResult<&dyn AeadCipher>;
    fn prf(&self, algorithm_id: u16) -> CryptoResult<&dyn Prf>;
    fn dh(&self, group_id: u16) -> CryptoResult<&dyn DiffieHellman>;
    fn random_bytes(&self, len: usize) -> Vec<u8>;
}

struct Aes256GcmImpl;

impl AeadCipher for Aes256GcmImpl {
    fn seal(&self, key: &[u8], nonce: &[u8], aad: &[u8], plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        if key.len() != 32 {
            return Err(CryptoError::BadKeyLength { expected: 32, got: key.len() });
        }
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::AeadFailed)?;
        let nonce = AesNonce::from_slice(nonce);
        cipher
            .encrypt(nonce, Payload { msg: plaintext, aad })
            .map_err(|_| CryptoError::AeadFailed)
    }

    fn open(&self, key: &[u8], nonce: &[u8], aad: &[u8], ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        if key.len() != 32 {
            return Err(CryptoError::BadKeyLength { expected: 32, got: key.len() });
        }
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::AeadFailed)?;
        let nonce = AesNonce::from_slice(nonce);
        cipher
            .decrypt(nonce, Payload { msg: ciphertext, aad })
            .map_err(|_| CryptoError::AeadFailed)
    }

    fn key_len(&self) -> usize {
        32
    }
}

struct ChaCha20Poly1305Impl;

impl AeadCipher for ChaCha20Poly1305Impl {
    fn seal(&self, key: &[u8], nonce: &[u8], aad: &[u8], plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        use chacha20poly1305::aead::Aead as _;
        use chacha20poly1305::{ChaCha20Poly1305, Nonce};
        if key.len() != 32 {
            return Err(CryptoError::BadKeyLength { expected: 32, got: key.len() });
        }
        let cipher = <ChaCha20Poly1305 as KeyInit>::new_from_slice(key).map_err(|_| CryptoError::AeadFailed)?;
        let nonce = Nonce::from_slice(nonce);
        cipher
            .encrypt(nonce, Payload { msg: plaintext, aad })
            .map_err(|_| CryptoError::AeadFailed)
    }

    fn open(&self, key: &[u8], nonce: &[u8], aad: &[u8], ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        use chacha20poly1305::aead::Aead as _;
        use chacha20poly1305::{ChaCha20Poly1305, Nonce};
        if key.len() != 32 {
            return Err(CryptoError::BadKeyLength { expected: 32, got: key.len() });
        }
        let cipher = <ChaCha20Poly1305 as KeyInit>::new_from_slice(key).map_err(|_| CryptoError::AeadFailed)?;
        let nonce = Nonce::from_slice(nonce);
        cipher
            .decrypt(nonce, Payload { msg: ciphertext, aad })
            .map_err(|_| CryptoError::AeadFailed)
    }

    fn key_len(&self) -> usize {
        32
    }
}

type HmacSha256 = Hmac<Sha256>;

struct HmacSha256Prf;

impl Prf for HmacSha256Prf {
    fn prf(&self, key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    fn output_len(&self) -> usize {
        32
    }
}

struct X25519Group;

impl DiffieHellman for X25519Group {
    fn generate_keypair(&self) -> (Vec<u8>, DhPrivate) {
        // `StaticSecret` (rather than `EphemeralSecret`) is used so the
        // scalar can be retained behind `DhPrivate` for the later
        // `shared_secret` call; IKEv2 KE payloads are one-shot per
        // exchange regardless, so the "static" naming carries no added
        // reuse risk here.
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        (public.as_bytes().to_vec(), DhPrivate(secret.to_bytes().to_vec()))
    }

    fn shared_secret(&self, private: &DhPrivate, peer_public: &[u8]) -> CryptoResult<Vec<u8>> {
        if peer_public.len() != 32 {
            return Err(CryptoError::BadKeyLength { expected: 32, got: peer_public.len() });
        }
        let mut pk_bytes = [0u8; 32];
        pk_bytes.copy_from_slice(peer_public);
        let peer = PublicKey::from(pk_bytes);

        let mut sk_bytes = [0u8; 32];
        sk_bytes.copy_from_slice(&private.0);
        let secret = StaticSecret::from(sk_bytes);
        Ok(secret.diffie_hellman(&peer).as_bytes().to_vec())
    }

    fn public_len(&self) -> usize {
        32
    }
}

/// In-process software implementation of every capability trait, backed
/// by pure-Rust crates. Algorithm ids follow RFC 7296's IKEv2 transform
/// registries: AEAD 20 = AES-GCM-256, 28 = ChaCha20-Poly1305; PRF 5 =
/// HMAC-SHA2-256; DH group 31 = Curve25519.
pub struct SoftwareProvider {
    aes_gcm: Aes256GcmImpl,
    chacha: ChaCha20Poly1305Impl,
    prf_sha256: HmacSha256Prf,
    x25519: X25519Group,
}

impl SoftwareProvider {
    pub fn new() -> Self {
        SoftwareProvider {
            aes_gcm: Aes256GcmImpl,
            chacha: ChaCha20Poly1305Impl,
            prf_sha256: HmacSha256Prf,
            x25519: X25519Group,
        }
    }
}

impl Default for SoftwareProvider {
    fn default() -> Self {
        SoftwareProvider::new()
    }
}

impl CryptoProvider for SoftwareProvider {
    fn aead(&self, algorithm_id: u16) -> CryptoResult<&dyn AeadCipher> {
        match algorithm_id {
            20 => Ok(&self.aes_gcm),
            28 => Ok(&self.chacha),
            other => Err(CryptoError::Unsupported(other)),
        }
    }

    fn prf(&self, algorithm_id: u16) -> CryptoResult<&dyn Prf> {
        match algorithm_id {
            5 => Ok(&self.prf_sha256),
            other => Err(CryptoError::Unsupported(other)),
        }
    }

    fn dh(&self, group_id: u16) -> CryptoResult<&dyn DiffieHellman> {
        match group_id {
            31 => Ok(&self.x25519),
            other => Err(CryptoError::Unsupported(other)),
        }
    }

    fn random_bytes(&self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        rand::rngs::OsRng.fill_bytes(&mut buf);
        buf
    }
}
