use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::keys::{KeySource, TransferContext};

/// One logical file-sharing operation. Owns exactly one archive blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// `None` means the transfer never expires
    pub expires_at: Option<DateTime<Utc>>,
    pub archive_name: String,
    pub size_bytes: u64,
    pub password_hash: Option<String>,
    pub recipient_email: Option<String>,
    pub is_encrypted: bool,
    /// Only meaningful when `is_encrypted`
    pub key_source: Option<KeySource>,
}

impl Transfer {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at < now)
    }

    /// Key-derivation context built from the stored row. The password is not
    /// stored, so the caller supplies it.
    pub fn context(&self, password: Option<String>) -> TransferContext {
        TransferContext {
            name: self.name.clone(),
            recipient_email: self.recipient_email.clone(),
            password,
            created_at: Some(self.created_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub transfer_id: String,
    pub original_name: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStats {
    pub download_count: u64,
    pub last_download_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessAction {
    Download,
    CacheHit,
}

impl AccessAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::CacheHit => "cache_hit",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn transfer(expires_at: Option<DateTime<Utc>>) -> Transfer {
        Transfer {
            id: "t1".into(),
            name: "ProjectX".into(),
            created_at: Utc::now(),
            expires_at,
            archive_name: "ProjectX.dvar".into(),
            size_bytes: 10,
            password_hash: None,
            recipient_email: Some("r@example.com".into()),
            is_encrypted: true,
            key_source: Some(KeySource::TransferName),
        }
    }

    #[test]
    fn test_permanent_transfer_never_expires() {
        let t = transfer(None);
        assert!(!t.is_expired(Utc::now() + Duration::days(10_000)));
    }

    #[test]
    fn test_expiry_is_strictly_past() {
        let now = Utc::now();
        let t = transfer(Some(now));
        assert!(!t.is_expired(now));
        assert!(t.is_expired(now + Duration::milliseconds(1)));
    }

    #[test]
    fn test_context_carries_row_fields() {
        let t = transfer(None);
        let ctx = t.context(Some("pw".into()));
        assert_eq!(ctx.name, "ProjectX");
        assert_eq!(ctx.recipient_email.as_deref(), Some("r@example.com"));
        assert_eq!(ctx.created_at, Some(t.created_at));
        assert_eq!(ctx.password.as_deref(), Some("pw"));
    }
}
