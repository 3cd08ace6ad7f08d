//! Payload authentication and optional confidentiality
//!
//! This module provides:
//! - HMAC-SHA256 signatures over outbound payloads
//! - AES-256-CBC encryption with a random IV prepended to the ciphertext
//! - A mandatory self-test before a key is trusted
//!
//! Without an installed key every operation passes data through unchanged.
//! Callers detect that state through `SigningService::is_enabled`.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Minimum accepted secret length in bytes
pub const MIN_KEY_LEN: usize = 16;

/// AES block and IV size
pub const IV_LEN: usize = 16;

const CIPHER_KEY_LABEL: &[u8] = b"telemetry-bridge/payload-encryption";
const SELF_TEST_PLAINTEXT: &[u8] = b"telemetry-bridge self-test block 0123456789";

/// Encrypt-then-decrypt pass checked by the self-test
type RoundTrip = fn(&SigningKey, &[u8]) -> Result<Vec<u8>, SigningError>;

/// Errors raised by the signing service
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("signing key too short: {actual} bytes (minimum {MIN})", MIN = MIN_KEY_LEN)]
    KeyTooShort { actual: usize },

    #[error("cryptographic self-test failed: {0}")]
    SelfTestFailed(String),

    #[error("malformed ciphertext: {0}")]
    MalformedCiphertext(&'static str),

    #[error("invalid key material")]
    InvalidKey,

    #[error("failed to serialize signed envelope: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Installed secret. Never printed.
#[derive(Clone)]
struct SigningKey {
    mac_key: Vec<u8>,
    cipher_key: [u8; 32],
}

impl SigningKey {
    fn derive(secret: &[u8]) -> Result<Self, SigningError> {
        let mut mac =
            <HmacSha256 as Mac>::new_from_slice(secret).map_err(|_| SigningError::InvalidKey)?;
        mac.update(CIPHER_KEY_LABEL);
        let mut cipher_key = [0u8; 32];
        cipher_key.copy_from_slice(&mac.finalize().into_bytes());

        Ok(Self {
            mac_key: secret.to_vec(),
            cipher_key,
        })
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningKey(<redacted>)")
    }
}

/// Signed payload as sent on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub payload: String,
    /// Hex-encoded HMAC-SHA256 of `payload`
    pub signature: String,
    /// Signing time, milliseconds since the UNIX epoch
    pub timestamp: u64,
}

/// Signs, verifies, encrypts and decrypts payloads with one symmetric secret
#[derive(Debug, Default)]
pub struct SigningService {
    key: Option<SigningKey>,
}

impl SigningService {
    /// Create a disabled service
    pub fn new() -> Self {
        Self { key: None }
    }

    /// Create a service and try to install `secret`, logging a failure
    pub fn with_secret(secret: &[u8]) -> Self {
        let mut service = Self::new();
        if let Err(e) = service.initialize(secret) {
            warn!(error = %e, "Payload signing disabled");
        }
        service
    }

    /// Install a secret after validating it with an encrypt/decrypt self-test.
    ///
    /// On any failure the service stays disabled and passes data through.
    pub fn initialize(&mut self, secret: &[u8]) -> Result<(), SigningError> {
        self.install(secret, encrypt_then_decrypt)
    }

    fn install(&mut self, secret: &[u8], round_trip: RoundTrip) -> Result<(), SigningError> {
        self.key = None;

        if secret.len() < MIN_KEY_LEN {
            return Err(SigningError::KeyTooShort {
                actual: secret.len(),
            });
        }

        let key = SigningKey::derive(secret)?;
        self_test(&key, round_trip)?;

        self.key = Some(key);
        info!("Payload signing enabled");
        Ok(())
    }

    /// Whether a validated key is installed
    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    /// Hex-encoded MAC of `payload`, or `None` when disabled
    pub fn signature(&self, payload: &str) -> Option<String> {
        let key = self.key.as_ref()?;
        mac_for(key, payload.as_bytes()).ok().map(hex::encode)
    }

    /// Envelope stamped with `signed_at_ms`, or `None` when disabled
    pub fn envelope(&self, payload: &str, signed_at_ms: u64) -> Option<SignedEnvelope> {
        let signature = self.signature(payload)?;
        Some(SignedEnvelope {
            payload: payload.to_string(),
            signature,
            timestamp: signed_at_ms,
        })
    }

    /// Serialized signed envelope; the payload itself when disabled
    pub fn sign(&self, payload: &str, signed_at_ms: u64) -> Result<String, SigningError> {
        match self.envelope(payload, signed_at_ms) {
            Some(envelope) => Ok(serde_json::to_string(&envelope)?),
            None => Ok(payload.to_string()),
        }
    }

    /// Check a hex signature against `payload`. Always false when disabled.
    pub fn verify(&self, payload: &str, signature: &str) -> bool {
        let Some(key) = self.key.as_ref() else {
            return false;
        };
        let Ok(expected) = hex::decode(signature) else {
            return false;
        };
        let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(&key.mac_key) else {
            return false;
        };
        mac.update(payload.as_bytes());
        mac.verify_slice(&expected).is_ok()
    }

    /// Encrypt `data` as `IV || ciphertext`; pass-through when disabled
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, SigningError> {
        match self.key.as_ref() {
            Some(key) => encrypt_with(key, data),
            None => Ok(data.to_vec()),
        }
    }

    /// Decrypt an `IV || ciphertext` blob and strip padding; pass-through when disabled
    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, SigningError> {
        match self.key.as_ref() {
            Some(key) => decrypt_with(key, blob),
            None => Ok(blob.to_vec()),
        }
    }
}

fn mac_for(key: &SigningKey, data: &[u8]) -> Result<Vec<u8>, SigningError> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(&key.mac_key).map_err(|_| SigningError::InvalidKey)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn encrypt_with(key: &SigningKey, data: &[u8]) -> Result<Vec<u8>, SigningError> {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let cipher = Aes256CbcEnc::new_from_slices(&key.cipher_key, &iv)
        .map_err(|_| SigningError::InvalidKey)?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(data);

    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn decrypt_with(key: &SigningKey, blob: &[u8]) -> Result<Vec<u8>, SigningError> {
    if blob.len() < IV_LEN {
        return Err(SigningError::MalformedCiphertext("shorter than IV"));
    }

    let (iv, ciphertext) = blob.split_at(IV_LEN);
    if ciphertext.is_empty() || ciphertext.len() % IV_LEN != 0 {
        return Err(SigningError::MalformedCiphertext("not block aligned"));
    }

    let cipher = Aes256CbcDec::new_from_slices(&key.cipher_key, iv)
        .map_err(|_| SigningError::InvalidKey)?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| SigningError::MalformedCiphertext("bad padding"))
}

fn encrypt_then_decrypt(key: &SigningKey, data: &[u8]) -> Result<Vec<u8>, SigningError> {
    let blob = encrypt_with(key, data)?;
    decrypt_with(key, &blob)
}

fn self_test(key: &SigningKey, round_trip: RoundTrip) -> Result<(), SigningError> {
    let recovered = round_trip(key, SELF_TEST_PLAINTEXT)
        .map_err(|e| SigningError::SelfTestFailed(format!("round trip: {e}")))?;

    if recovered != SELF_TEST_PLAINTEXT {
        return Err(SigningError::SelfTestFailed(
            "decrypted block does not match".to_string(),
        ));
    }

    let tag = mac_for(key, SELF_TEST_PLAINTEXT)?;
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(&key.mac_key).map_err(|_| SigningError::InvalidKey)?;
    mac.update(SELF_TEST_PLAINTEXT);
    mac.verify_slice(&tag)
        .map_err(|_| SigningError::SelfTestFailed("MAC verification".to_string()))?;

    debug!("Cryptographic self-test passed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = b"lostdev-sensor1-1008200303082003";
    const SIGNED_AT: u64 = 1_700_000_000_250;

    fn enabled() -> SigningService {
        let mut service = SigningService::new();
        service.initialize(KEY).unwrap();
        service
    }

    #[test]
    fn test_short_key_disables_signing() {
        let mut service = SigningService::new();
        let result = service.initialize(b"0123456789");

        assert!(matches!(result, Err(SigningError::KeyTooShort { actual: 10 })));
        assert!(!service.is_enabled());
        assert_eq!(
            service.sign("temperature=21.5", SIGNED_AT).unwrap(),
            "temperature=21.5"
        );
    }

    #[test]
    fn test_failed_reinitialize_disables_previous_key() {
        let mut service = enabled();
        assert!(service.initialize(b"short").is_err());
        assert!(!service.is_enabled());
    }

    fn corrupting_round_trip(key: &SigningKey, data: &[u8]) -> Result<Vec<u8>, SigningError> {
        let mut recovered = encrypt_then_decrypt(key, data)?;
        recovered[0] ^= 0xff;
        Ok(recovered)
    }

    fn failing_round_trip(_key: &SigningKey, _data: &[u8]) -> Result<Vec<u8>, SigningError> {
        Err(SigningError::MalformedCiphertext("bad padding"))
    }

    #[test]
    fn test_failed_self_test_leaves_signing_disabled() {
        let mut service = enabled();

        let result = service.install(KEY, corrupting_round_trip);

        assert!(matches!(result, Err(SigningError::SelfTestFailed(_))));
        assert!(!service.is_enabled());
        assert_eq!(service.sign("p", SIGNED_AT).unwrap(), "p");
        assert!(service.signature("p").is_none());
        assert_eq!(service.encrypt(b"p").unwrap(), b"p");
    }

    #[test]
    fn test_round_trip_error_fails_self_test() {
        let mut service = SigningService::new();

        let result = service.install(KEY, failing_round_trip);

        match result {
            Err(SigningError::SelfTestFailed(reason)) => assert!(reason.contains("bad padding")),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(!service.is_enabled());
    }

    #[test]
    fn test_sign_then_verify() {
        let service = enabled();
        let payload = r#"{"temperature":21.5,"humidity":40.0}"#;

        let envelope = service.envelope(payload, SIGNED_AT).unwrap();
        assert_eq!(envelope.payload, payload);
        assert_eq!(envelope.signature.len(), 64);
        assert!(service.verify(payload, &envelope.signature));
    }

    #[test]
    fn test_tampered_payload_fails_verification() {
        let service = enabled();
        let payload = "device_id=abc&temperature=21.5";
        let signature = service.signature(payload).unwrap();

        let mut tampered = payload.as_bytes().to_vec();
        tampered[0] ^= 0x01;
        let tampered = String::from_utf8(tampered).unwrap();

        assert!(!service.verify(&tampered, &signature));
    }

    #[test]
    fn test_sign_produces_json_envelope() {
        let service = enabled();
        let signed = service.sign("hello", SIGNED_AT).unwrap();

        let envelope: SignedEnvelope = serde_json::from_str(&signed).unwrap();
        assert_eq!(envelope.payload, "hello");
        assert_eq!(envelope.timestamp, SIGNED_AT);
        assert!(service.verify("hello", &envelope.signature));
    }

    #[test]
    fn test_verify_rejects_garbage_signature() {
        let service = enabled();
        assert!(!service.verify("hello", "not-hex"));
        assert!(!service.verify("hello", ""));
    }

    #[test]
    fn test_verify_false_when_disabled() {
        let signer = enabled();
        let signature = signer.signature("hello").unwrap();

        let disabled = SigningService::new();
        assert!(!disabled.verify("hello", &signature));
        assert!(disabled.signature("hello").is_none());
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let service = enabled();

        for len in [0usize, 1, 15, 16, 17, 100] {
            let data: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let blob = service.encrypt(&data).unwrap();

            assert!(blob.len() >= IV_LEN + 16);
            assert_eq!((blob.len() - IV_LEN) % 16, 0);
            assert_eq!(service.decrypt(&blob).unwrap(), data);
        }
    }

    #[test]
    fn test_fresh_iv_per_encryption() {
        let service = enabled();
        let a = service.encrypt(b"same input").unwrap();
        let b = service.encrypt(b"same input").unwrap();

        assert_ne!(&a[..IV_LEN], &b[..IV_LEN]);
    }

    #[test]
    fn test_decrypt_short_blob_fails() {
        let service = enabled();
        let result = service.decrypt(&[0u8; 8]);
        assert!(matches!(result, Err(SigningError::MalformedCiphertext(_))));

        let result = service.decrypt(&[0u8; IV_LEN]);
        assert!(matches!(result, Err(SigningError::MalformedCiphertext(_))));
    }

    #[test]
    fn test_decrypt_unaligned_blob_fails() {
        let service = enabled();
        let mut blob = service.encrypt(b"payload").unwrap();
        blob.pop();

        assert!(service.decrypt(&blob).is_err());
    }

    #[test]
    fn test_disabled_encrypt_passes_through() {
        let service = SigningService::new();
        assert_eq!(service.encrypt(b"plain").unwrap(), b"plain");
        assert_eq!(service.decrypt(b"plain").unwrap(), b"plain");
    }

    #[test]
    fn test_key_is_redacted_in_debug() {
        let service = enabled();
        let debug = format!("{:?}", service);
        assert!(debug.contains("redacted"));
        assert!(!debug.contains("lostdev"));
    }
}
