use base64::Engine;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use ring::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

const KEY_LEN: usize = 32; // 256 bits
const TOKEN_VERSION: u8 = 0x80;
const HEADER_LEN: usize = 1 + 8; // version + issued-at seconds
const TAG_LEN: usize = 16;
const MIN_TOKEN_LEN: usize = HEADER_LEN + NONCE_LEN + TAG_LEN;

/// Authenticated encryption for connection secrets, keyed once per process.
///
/// Tokens are laid out as `version | issued_at (u64 BE) | nonce | ciphertext+tag`.
/// The version and timestamp are bound as associated data, so any modified
/// byte makes [`Vault::decrypt`] fail.
///
/// A vault built with [`Vault::ephemeral`] uses a random key that is never
/// persisted. Everything it encrypts becomes unreadable after a restart.
pub struct Vault {
    key: LessSafeKey,
    rng: SystemRandom,
    ephemeral: bool,
}

impl Vault {
    /// Build from a URL-safe base64 encoded 256-bit key.
    pub fn new(encoded_key: &str) -> Result<Self, VaultError> {
        let key = decode_key(encoded_key)?;
        Self::from_key_bytes(&key, false)
    }

    /// Build with a freshly generated key that only lives as long as the process.
    pub fn ephemeral() -> Result<Self, VaultError> {
        let rng = SystemRandom::new();
        let mut key = [0u8; KEY_LEN];
        rng.fill(&mut key)
            .map_err(|_| VaultError::Crypto("failed to generate key".into()))?;
        Self::from_key_bytes(&key, true)
    }

    /// Use the configured key when present, otherwise fall back to an ephemeral one.
    pub fn from_config(encoded_key: Option<&str>) -> Result<Self, VaultError> {
        match encoded_key.map(str::trim).filter(|k| !k.is_empty()) {
            Some(key) => {
                let vault = Self::new(key)?;
                info!("credential vault initialised from configured key");
                Ok(vault)
            }
            None => {
                warn!(
                    "no encryption key configured; generated an ephemeral key. \
                     Stored connection passwords will be unreadable after restart"
                );
                Self::ephemeral()
            }
        }
    }

    fn from_key_bytes(key: &[u8], ephemeral: bool) -> Result<Self, VaultError> {
        let unbound = UnboundKey::new(&AES_256_GCM, key)
            .map_err(|_| VaultError::InvalidKey("failed to create AES key".into()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
            ephemeral,
        })
    }

    /// Whether this vault's key will disappear with the process.
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<Vec<u8>, VaultError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| VaultError::Crypto("failed to generate nonce".into()))?;

        let issued_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        let mut header = [0u8; HEADER_LEN];
        header[0] = TOKEN_VERSION;
        header[1..].copy_from_slice(&issued_at.to_be_bytes());

        let mut in_out = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::from(header),
                &mut in_out,
            )
            .map_err(|_| VaultError::Crypto("encryption failed".into()))?;

        let mut token = Vec::with_capacity(HEADER_LEN + NONCE_LEN + in_out.len());
        token.extend_from_slice(&header);
        token.extend_from_slice(&nonce_bytes);
        token.extend_from_slice(&in_out);
        Ok(token)
    }

    pub fn decrypt(&self, token: &[u8]) -> Result<String, VaultError> {
        if token.len() < MIN_TOKEN_LEN {
            return Err(VaultError::Decryption);
        }
        let (header, rest) = token.split_at(HEADER_LEN);
        if header[0] != TOKEN_VERSION {
            return Err(VaultError::Decryption);
        }
        let (nonce_bytes, sealed) = rest.split_at(NONCE_LEN);
        let nonce =
            Nonce::try_assume_unique_for_key(nonce_bytes).map_err(|_| VaultError::Decryption)?;

        let mut in_out = sealed.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::from(header), &mut in_out)
            .map_err(|_| VaultError::Decryption)?;

        String::from_utf8(plaintext.to_vec()).map_err(|_| VaultError::Decryption)
    }

    /// Unix seconds embedded in a token. Not authenticated until the token is decrypted.
    pub fn token_issued_at(token: &[u8]) -> Option<u64> {
        if token.len() < MIN_TOKEN_LEN || token[0] != TOKEN_VERSION {
            return None;
        }
        let mut secs = [0u8; 8];
        secs.copy_from_slice(&token[1..HEADER_LEN]);
        Some(u64::from_be_bytes(secs))
    }

    /// Generate a new key suitable for `TROVE_ENCRYPTION_KEY`.
    pub fn generate_key() -> Result<String, VaultError> {
        let mut key = [0u8; KEY_LEN];
        SystemRandom::new()
            .fill(&mut key)
            .map_err(|_| VaultError::Crypto("failed to generate key".into()))?;
        Ok(URL_SAFE.encode(key))
    }
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("algorithm", &"AES-256-GCM")
            .field("ephemeral", &self.ephemeral)
            .finish_non_exhaustive()
    }
}

fn decode_key(encoded: &str) -> Result<Vec<u8>, VaultError> {
    let trimmed = encoded.trim();
    let key = URL_SAFE
        .decode(trimmed)
        .or_else(|_| URL_SAFE_NO_PAD.decode(trimmed))
        .map_err(|e| VaultError::InvalidKey(format!("key is not URL-safe base64: {e}")))?;
    if key.len() != KEY_LEN {
        return Err(VaultError::InvalidKey(format!(
            "key must decode to {KEY_LEN} bytes, got {}",
            key.len()
        )));
    }
    Ok(key)
}

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),
    #[error("token is malformed, tampered with, or was encrypted with another key")]
    Decryption,
    #[error("cryptographic error: {0}")]
    Crypto(String),
}

impl From<VaultError> for trove_common::Error {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::InvalidKey(msg) => Self::Config(msg),
            other => Self::Credential(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn test_vault() -> Vault {
        Vault::new(&Vault::generate_key().unwrap()).unwrap()
    }

    fn random_ascii(rng: &mut impl Rng, len: usize) -> String {
        (0..len)
            .map(|_| rng.random_range(0x20u8..=0x7e) as char)
            .collect()
    }

    #[test]
    fn round_trips_printable_ascii() {
        let vault = test_vault();
        let mut rng = rand::rng();

        for len in [0, 1, 2, 15, 16, 17, 255, 999, 1000] {
            let s = random_ascii(&mut rng, len);
            let token = vault.encrypt(&s).unwrap();
            assert_eq!(vault.decrypt(&token).unwrap(), s);
        }
        for _ in 0..100 {
            let len = rng.random_range(0..=1000);
            let s = random_ascii(&mut rng, len);
            assert_eq!(vault.decrypt(&vault.encrypt(&s).unwrap()).unwrap(), s);
        }
    }

    #[test]
    fn round_trips_unicode() {
        let vault = test_vault();
        let token = vault.encrypt("pässwörd-🔑").unwrap();
        assert_eq!(vault.decrypt(&token).unwrap(), "pässwörd-🔑");
    }

    #[test]
    fn encryption_is_not_deterministic() {
        let vault = test_vault();
        let a = vault.encrypt("same").unwrap();
        let b = vault.encrypt("same").unwrap();
        assert_ne!(a, b);
        assert_eq!(vault.decrypt(&a).unwrap(), vault.decrypt(&b).unwrap());
    }

    #[test]
    fn ciphertext_does_not_contain_plaintext() {
        let vault = test_vault();
        let token = vault.encrypt("correct-horse-battery").unwrap();
        assert!(
            !token
                .windows("correct-horse-battery".len())
                .any(|w| w == b"correct-horse-battery")
        );
    }

    #[test]
    fn flipping_any_byte_fails_decryption() {
        let vault = test_vault();
        let token = vault.encrypt("p@ssw0rd").unwrap();

        for i in 0..token.len() {
            let mut tampered = token.clone();
            tampered[i] ^= 0x01;
            assert!(
                matches!(vault.decrypt(&tampered), Err(VaultError::Decryption)),
                "byte {i} flip was not detected"
            );
        }
    }

    #[test]
    fn truncated_tokens_fail() {
        let vault = test_vault();
        let token = vault.encrypt("secret").unwrap();

        assert!(vault.decrypt(&[]).is_err());
        assert!(vault.decrypt(&token[..MIN_TOKEN_LEN - 1]).is_err());
        assert!(vault.decrypt(&token[..token.len() - 1]).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let token = test_vault().encrypt("secret").unwrap();
        let other = test_vault();
        assert!(matches!(other.decrypt(&token), Err(VaultError::Decryption)));
    }

    #[test]
    fn same_key_decrypts_across_instances() {
        let key = Vault::generate_key().unwrap();
        let token = Vault::new(&key).unwrap().encrypt("persisted").unwrap();
        assert_eq!(Vault::new(&key).unwrap().decrypt(&token).unwrap(), "persisted");
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!(matches!(
            Vault::new("not base64 !!"),
            Err(VaultError::InvalidKey(_))
        ));
        assert!(matches!(
            Vault::new(&URL_SAFE.encode([7u8; 16])),
            Err(VaultError::InvalidKey(_))
        ));
    }

    #[test]
    fn accepts_unpadded_keys() {
        let unpadded = URL_SAFE_NO_PAD.encode([9u8; KEY_LEN]);
        assert!(Vault::new(&unpadded).is_ok());
    }

    #[test]
    fn missing_key_yields_ephemeral_vault() {
        let vault = Vault::from_config(None).unwrap();
        assert!(vault.is_ephemeral());

        let blank = Vault::from_config(Some("  ")).unwrap();
        assert!(blank.is_ephemeral());

        let configured = Vault::from_config(Some(&Vault::generate_key().unwrap())).unwrap();
        assert!(!configured.is_ephemeral());
    }

    #[test]
    fn token_records_issue_time() {
        let before = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let token = test_vault().encrypt("x").unwrap();
        let issued = Vault::token_issued_at(&token).unwrap();
        assert!(issued >= before && issued <= before + 5);
        assert_eq!(Vault::token_issued_at(b"short"), None);
    }

    #[test]
    fn decryption_error_maps_to_credential_error() {
        let err: trove_common::Error = VaultError::Decryption.into();
        assert_eq!(err.code(), "credential_error");

        let err: trove_common::Error = VaultError::InvalidKey("bad".into()).into();
        assert_eq!(err.code(), "config_error");
    }

    #[test]
    fn debug_does_not_expose_key() {
        let rendered = format!("{:?}", test_vault());
        assert!(rendered.contains("AES-256-GCM"));
        assert!(!rendered.contains("key:"));
    }
}
