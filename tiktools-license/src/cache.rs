//! Sealed on-disk snapshot of the last known entitlement.
//!
//! File layout: `MAGIC || VERSION || nonce || ciphertext`, where the
//! ciphertext is the JSON snapshot sealed under a key derived from the raw
//! machine fingerprint. Any read failure is treated as "no cache".

use crate::device::MachineIdentity;
use crate::error::{LicenseError, LicenseResult};
use crate::record::Entitlement;
use crate::status::LicenseStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tiktools_crypto::{SealingKey, open_json, seal_json};
use tracing::{debug, warn};

const MAGIC: &[u8; 4] = b"TTLC";
const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = MAGIC.len() + 1;
const KEY_SALT_LABEL: &str = "tiktools-cache1";

/// The persisted state of the last validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub license_key: String,
    /// Dropped by [`SecureCache::load_trusted`] once the snapshot is stale.
    pub entitlement: Option<Entitlement>,
    pub status: LicenseStatus,
    pub cached_at: DateTime<Utc>,
    pub last_online_validation: Option<DateTime<Utc>>,
    /// Bound hash of the machine that wrote the snapshot.
    pub machine_id: String,
}

impl CacheSnapshot {
    /// Hours elapsed since the last online validation.
    pub fn offline_hours_at(&self, now: DateTime<Utc>) -> Option<f64> {
        self.last_online_validation
            .map(|at| (now - at).num_seconds().max(0) as f64 / 3600.0)
    }

    /// Returns true if the snapshot may still stand in for an online check.
    pub fn within_horizon_at(&self, now: DateTime<Utc>, horizon: Duration) -> bool {
        let Ok(horizon) = chrono::Duration::from_std(horizon) else {
            return true;
        };
        self.last_online_validation
            .is_some_and(|at| now - at <= horizon)
    }
}

/// Reads and writes the sealed snapshot at a fixed path.
pub struct SecureCache {
    path: PathBuf,
    key: SealingKey,
    machine_id: String,
    horizon: Duration,
}

impl SecureCache {
    /// Opens the cache for `identity`, deriving the sealing key from its
    /// raw fingerprint.
    pub fn new(
        path: impl Into<PathBuf>,
        identity: &MachineIdentity,
        horizon: Duration,
    ) -> LicenseResult<Self> {
        let key = SealingKey::derive(identity.fingerprint().as_bytes(), KEY_SALT_LABEL)?;
        Ok(Self {
            path: path.into(),
            key,
            machine_id: identity.bound_hash().to_string(),
            horizon,
        })
    }

    /// Returns the cache file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the bound hash that owns this cache.
    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    /// Seals `snapshot` and atomically replaces the cache file.
    pub fn save(&self, snapshot: &CacheSnapshot) -> LicenseResult<()> {
        let sealed = seal_json(&self.key, snapshot)?;
        let mut bytes = Vec::with_capacity(HEADER_LEN + sealed.len());
        bytes.extend_from_slice(MAGIC);
        bytes.push(FORMAT_VERSION);
        bytes.extend_from_slice(&sealed);

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| LicenseError::Cache(format!("create {}: {e}", parent.display())))?;
        }

        let tmp = self.path.with_extension("tmp");
        write_private(&tmp, &bytes)
            .map_err(|e| LicenseError::Cache(format!("write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            LicenseError::Cache(format!("replace {}: {e}", self.path.display()))
        })?;

        debug!("License cache saved");
        Ok(())
    }

    /// Reads the snapshot as written, or `None` if absent or unreadable.
    ///
    /// An unreadable file (bad header, wrong key, tampering, bad JSON) is
    /// deleted.
    pub fn load(&self) -> Option<CacheSnapshot> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("License cache unreadable: {e}");
                return None;
            }
        };

        match self.decode(&bytes) {
            Some(snapshot) => Some(snapshot),
            None => {
                warn!("License cache corrupt, discarding");
                self.clear();
                None
            }
        }
    }

    /// Reads the snapshot and applies the trust rules at `now`.
    ///
    /// - A snapshot owned by another machine is discarded entirely.
    /// - A snapshot older than the offline horizon keeps only its key.
    pub fn load_trusted_at(&self, now: DateTime<Utc>) -> Option<CacheSnapshot> {
        let mut snapshot = self.load()?;

        if snapshot.machine_id != self.machine_id {
            warn!("License cache belongs to another machine, discarding");
            self.clear();
            return None;
        }

        let stale = chrono::Duration::from_std(self.horizon)
            .map(|horizon| now - snapshot.cached_at > horizon)
            .unwrap_or(false);
        if stale {
            debug!("License cache older than offline horizon, keeping key only");
            snapshot.entitlement = None;
            snapshot.last_online_validation = None;
            snapshot.status = LicenseStatus::Invalid;
        }

        Some(snapshot)
    }

    /// [`Self::load_trusted_at`] at the current time.
    pub fn load_trusted(&self) -> Option<CacheSnapshot> {
        self.load_trusted_at(Utc::now())
    }

    /// Deletes the cache file. Idempotent.
    pub fn clear(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("License cache cleared"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to clear license cache: {e}"),
        }
    }

    /// Returns true if a cache file is present.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn decode(&self, bytes: &[u8]) -> Option<CacheSnapshot> {
        if bytes.len() < HEADER_LEN || &bytes[..MAGIC.len()] != MAGIC {
            return None;
        }
        if bytes[MAGIC.len()] != FORMAT_VERSION {
            return None;
        }
        open_json(&self.key, &bytes[HEADER_LEN..]).ok()
    }
}

impl std::fmt::Debug for SecureCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureCache")
            .field("path", &self.path)
            .field("machine_id", &self.machine_id)
            .finish()
    }
}

#[cfg(unix)]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}
