//! Backup and restore of identity plus contacts.
//!
//! ```text
//! {
//!   "version": 1,
//!   "identity": { "publicKey": "<b64>", "secretKey": "<b64>" },
//!   "contacts": { "<fingerprint>": "<b64 public key>", ... }
//! }
//! ```
//!
//! Restore runs in one of two modes:
//!
//! - [`RestoreMode::Merge`] adds the backup's contacts to the local ones and
//!   installs the backup identity when it has one.
//! - [`RestoreMode::Replace`] wipes the whole local store first.
//!
//! In both modes a contact whose fingerprint does not match its key is
//! skipped. In merge mode a contact already pinned locally to a different
//! key keeps its local pin and is reported as a conflict.

use murmur_crypto::fingerprint;
use murmur_crypto::x25519::X25519PublicKey;
use murmur_db::{keys, KvStoreExt};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::contacts::{ContactMap, TrustStore};
use crate::identity::{self, Identity, StoredIdentity};
use crate::{Result, TrustError};

/// The only backup format version understood by this build.
pub const BACKUP_VERSION: u64 = 1;

/// Backup file contents.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupFile {
    /// Format version.
    pub version: u64,
    /// Identity key pair. Both fields are empty when the store had none.
    #[serde(default)]
    pub identity: StoredIdentity,
    /// Pinned contacts.
    #[serde(default)]
    pub contacts: ContactMap,
}

/// How a backup is applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestoreMode {
    /// Union with the local store.
    Merge,
    /// Wipe the local store, then load the backup.
    Replace,
}

/// What a restore changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Whether the identity was written.
    pub identity_restored: bool,
    /// Contacts newly pinned.
    pub contacts_added: usize,
    /// Contacts whose fingerprint does not match their key.
    pub invalid: Vec<String>,
    /// Contacts already pinned locally to a different key (merge only).
    pub conflicts: Vec<String>,
}

impl BackupFile {
    /// Parse backup text, rejecting unknown versions before anything else.
    pub fn parse(text: &str) -> Result<Self> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| TrustError::MalformedBackup(e.to_string()))?;
        let version = value
            .get("version")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| TrustError::MalformedBackup("missing version".into()))?;
        if version != BACKUP_VERSION {
            return Err(TrustError::UnsupportedBackupVersion(version));
        }
        serde_json::from_value(value).map_err(|e| TrustError::MalformedBackup(e.to_string()))
    }

    /// Pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| TrustError::MalformedBackup(e.to_string()))
    }
}

fn valid_contact(fp: &str, encoded: &str) -> bool {
    X25519PublicKey::from_base64(encoded)
        .map(|pk| fingerprint::matches(fp, &pk))
        .unwrap_or(false)
}

impl TrustStore {
    /// Export the identity and every pinned contact.
    pub fn make_backup(&self) -> Result<BackupFile> {
        let identity = identity::load_identity(self.store().as_ref())?
            .map(|id| id.to_stored())
            .unwrap_or_default();
        Ok(BackupFile {
            version: BACKUP_VERSION,
            identity,
            contacts: self.contacts()?,
        })
    }

    /// Apply a parsed backup.
    pub fn restore_backup(&self, backup: &BackupFile, mode: RestoreMode) -> Result<RestoreReport> {
        if backup.version != BACKUP_VERSION {
            return Err(TrustError::UnsupportedBackupVersion(backup.version));
        }
        // Validate before touching anything so a bad file cannot wipe the store.
        let identity = if backup.identity.is_complete() {
            Some(Identity::from_stored(&backup.identity)?)
        } else {
            None
        };

        let mut report = RestoreReport::default();
        self.with_lock(|store| {
            if mode == RestoreMode::Replace {
                store.clear()?;
            }
            if let Some(identity) = &identity {
                identity::store_identity(store, identity)?;
                report.identity_restored = true;
            }

            let mut contacts: ContactMap = store.get_json(keys::CONTACTS)?.unwrap_or_default();
            for (fp, encoded) in &backup.contacts {
                if !valid_contact(fp, encoded) {
                    report.invalid.push(fp.clone());
                    continue;
                }
                match contacts.get(fp) {
                    Some(pinned) if pinned == encoded => {}
                    Some(_) => report.conflicts.push(fp.clone()),
                    None => {
                        contacts.insert(fp.clone(), encoded.clone());
                        report.contacts_added += 1;
                    }
                }
            }
            store.set_json(keys::CONTACTS, &contacts)?;
            Ok(())
        })?;

        if !report.invalid.is_empty() || !report.conflicts.is_empty() {
            warn!(
                invalid = report.invalid.len(),
                conflicts = report.conflicts.len(),
                "backup contacts skipped"
            );
        }
        info!(
            ?mode,
            identity = report.identity_restored,
            added = report.contacts_added,
            "backup restored"
        );
        Ok(report)
    }

    /// Parse `text` and apply it.
    pub fn restore_backup_json(&self, text: &str, mode: RestoreMode) -> Result<RestoreReport> {
        self.restore_backup(&BackupFile::parse(text)?, mode)
    }
}
