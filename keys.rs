//! Key derivation from transfer metadata.
//!
//! No key is ever stored. The 256-bit archive key is the SHA-256 digest of
//! whichever piece of transfer context the configured [`KeySource`] selects.
//! Large archives additionally stretch that key with Argon2id under a fixed
//! salt, so the same context always reproduces the same block-cipher key.
//!
//! ## Security Features
//!
//! - Derived keys are zeroized on drop (via `Zeroize` trait)
//! - `Debug` output never contains key bytes

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use chrono::{DateTime, Utc};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroize;

use crate::clock::Clock;
use crate::error::{DropVaultError, Result};

pub const KEY_SIZE: usize = 32;

/// Fixed salt for block-cipher key stretching. Not request specific: the
/// decrypting side has nothing but the transfer context to work from.
const STRETCH_SALT: &[u8] = b"dropvault-archive-stream-v1";

/// Argon2id cost for stretching (19 MiB, 2 passes, 1 lane)
const STRETCH_MEM_KIB: u32 = 19 * 1024;
const STRETCH_TIME_COST: u32 = 2;

/// Which piece of transfer context seeds the archive key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    Manual,
    TransferName,
    Email,
    Password,
    Timestamp,
}

impl KeySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::TransferName => "transfer_name",
            Self::Email => "email",
            Self::Password => "password",
            Self::Timestamp => "timestamp",
        }
    }
}

impl fmt::Display for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeySource {
    type Err = DropVaultError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "manual" => Ok(Self::Manual),
            "transfer_name" => Ok(Self::TransferName),
            "email" => Ok(Self::Email),
            "password" => Ok(Self::Password),
            "timestamp" => Ok(Self::Timestamp),
            other => Err(DropVaultError::config(format!("unknown key source: {other}"))),
        }
    }
}

/// Caller-supplied context for key derivation.
#[derive(Debug, Clone, Default)]
pub struct TransferContext {
    pub name: String,
    pub recipient_email: Option<String>,
    pub password: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl TransferContext {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// A 256-bit archive key. Zeroized on drop.
#[derive(Clone)]
pub struct DerivedKey {
    bytes: [u8; KEY_SIZE],
}

impl DerivedKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for DerivedKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// Derive the base archive key for `source`.
///
/// `manual_key` is the configured secret and only consulted for
/// [`KeySource::Manual`]. The timestamp source falls back to `clock.now()`
/// when the context carries no creation time; every other source fails with
/// [`DropVaultError::MissingKeyContext`] when its field is absent.
pub fn derive_key(
    source: KeySource,
    ctx: &TransferContext,
    manual_key: Option<&str>,
    clock: &dyn Clock,
) -> Result<DerivedKey> {
    let missing = |field: &'static str| DropVaultError::MissingKeyContext {
        key_source: source,
        field,
    };

    let mut material = match source {
        KeySource::Manual => non_empty(manual_key).ok_or_else(|| missing("manual_key"))?.to_owned(),
        KeySource::TransferName => non_empty(Some(ctx.name.as_str()))
            .ok_or_else(|| missing("name"))?
            .to_owned(),
        KeySource::Email => non_empty(ctx.recipient_email.as_deref())
            .ok_or_else(|| missing("recipient_email"))?
            .to_owned(),
        KeySource::Password => non_empty(ctx.password.as_deref())
            .ok_or_else(|| missing("password"))?
            .to_owned(),
        KeySource::Timestamp => ctx
            .created_at
            .unwrap_or_else(|| clock.now())
            .timestamp_millis()
            .to_string(),
    };

    let digest: [u8; KEY_SIZE] = Sha256::digest(material.as_bytes()).into();
    material.zeroize();
    Ok(DerivedKey::from_bytes(digest))
}

/// Stretch a base key into the block-cipher key for streamed archives.
///
/// Deterministic: same base key, same output. CPU and memory heavy, so call
/// it from a blocking context.
pub fn stretch_key(base: &DerivedKey) -> Result<DerivedKey> {
    let params = Params::new(STRETCH_MEM_KIB, STRETCH_TIME_COST, 1, Some(KEY_SIZE))
        .map_err(|e| DropVaultError::config(format!("invalid Argon2id params: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut out = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(base.as_bytes(), STRETCH_SALT, &mut out)
        .map_err(|e| DropVaultError::config(format!("Argon2id stretch failed: {e}")))?;
    Ok(DerivedKey::from_bytes(out))
}

/// Hash a transfer password for storage (Argon2id PHC string).
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| DropVaultError::config(format!("password hashing failed: {e}")))
}

/// Check a password against a stored PHC string. Malformed hashes never verify.
pub fn verify_password(hash: &str, password: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{from_millis, ManualClock};

    fn clock() -> ManualClock {
        ManualClock::new(from_millis(1_700_000_000_000).unwrap())
    }

    #[test]
    fn test_same_name_same_key() {
        let c = clock();
        let ctx = TransferContext::named("ProjectX");
        let k1 = derive_key(KeySource::TransferName, &ctx, None, &c).unwrap();
        let k2 = derive_key(KeySource::TransferName, &ctx, None, &c).unwrap();
        assert_eq!(k1.as_bytes(), k2.as_bytes());

        let other = TransferContext::named("ProjectY");
        let k3 = derive_key(KeySource::TransferName, &other, None, &c).unwrap();
        assert_ne!(k1.as_bytes(), k3.as_bytes());
    }

    #[test]
    fn test_key_is_sha256_of_material() {
        let c = clock();
        let ctx = TransferContext {
            recipient_email: Some("a@example.com".into()),
            ..Default::default()
        };
        let key = derive_key(KeySource::Email, &ctx, None, &c).unwrap();
        let expected: [u8; 32] = Sha256::digest(b"a@example.com").into();
        assert_eq!(key.as_bytes(), &expected);
    }

    #[test]
    fn test_missing_context_fails_fast() {
        let c = clock();
        let ctx = TransferContext::default();

        for (source, field) in [
            (KeySource::Manual, "manual_key"),
            (KeySource::TransferName, "name"),
            (KeySource::Email, "recipient_email"),
            (KeySource::Password, "password"),
        ] {
            match derive_key(source, &ctx, None, &c) {
                Err(DropVaultError::MissingKeyContext { key_source, field: f }) => {
                    assert_eq!(key_source, source);
                    assert_eq!(f, field);
                }
                other => panic!("expected MissingKeyContext for {source}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_empty_password_counts_as_missing() {
        let c = clock();
        let ctx = TransferContext {
            password: Some(String::new()),
            ..Default::default()
        };
        assert!(matches!(
            derive_key(KeySource::Password, &ctx, None, &c),
            Err(DropVaultError::MissingKeyContext { .. })
        ));
    }

    #[test]
    fn test_timestamp_defaults_to_clock() {
        let c = clock();
        let ctx = TransferContext::default();
        let implicit = derive_key(KeySource::Timestamp, &ctx, None, &c).unwrap();

        let explicit_ctx = TransferContext {
            created_at: Some(c.now()),
            ..Default::default()
        };
        let explicit = derive_key(KeySource::Timestamp, &explicit_ctx, None, &c).unwrap();
        assert_eq!(implicit.as_bytes(), explicit.as_bytes());
    }

    #[test]
    fn test_manual_key_ignores_context() {
        let c = clock();
        let a = derive_key(KeySource::Manual, &TransferContext::named("a"), Some("s3cret"), &c).unwrap();
        let b = derive_key(KeySource::Manual, &TransferContext::named("b"), Some("s3cret"), &c).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_stretch_is_deterministic_and_distinct() {
        let base = DerivedKey::from_bytes([7u8; KEY_SIZE]);
        let s1 = stretch_key(&base).unwrap();
        let s2 = stretch_key(&base).unwrap();
        assert_eq!(s1.as_bytes(), s2.as_bytes());
        assert_ne!(s1.as_bytes(), base.as_bytes());
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = DerivedKey::from_bytes([0xAB; KEY_SIZE]);
        let dbg = format!("{key:?}");
        assert!(dbg.contains("REDACTED"));
        assert!(!dbg.contains("171"));
    }

    #[test]
    fn test_password_hash_verifies() {
        let hash = hash_password("open sesame").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password(&hash, "open sesame"));
        assert!(!verify_password(&hash, "open says me"));
        assert!(!verify_password("not-a-hash", "open sesame"));
    }

    #[test]
    fn test_key_source_parse() {
        assert_eq!("transfer_name".parse::<KeySource>().unwrap(), KeySource::TransferName);
        assert!("bogus".parse::<KeySource>().is_err());
        assert_eq!(KeySource::Timestamp.to_string(), "timestamp");
    }
}
