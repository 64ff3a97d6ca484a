//! Authority data model.
//!
//! Rows of the authority's `licenses`, `users` and `activations` tables,
//! decoded at the boundary with explicit defaults for absent or `null`
//! fields.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

fn default_license_type() -> String {
    "standard".to_string()
}

fn default_max_machines() -> u32 {
    1
}

/// Decodes `null` the same as an absent field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Decodes a timestamp string leniently; unparseable values become `None`.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(parse_timestamp))
}

/// Parses RFC 3339 timestamps as well as the naive ISO forms the authority
/// emits (`2026-01-31T12:00:00`, `2026-01-31T12:00:00.123456`, `2026-01-31`).
/// Naive values are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// A row of the `licenses` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LicenseRecord {
    pub key: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub active: bool,
    #[serde(default = "default_license_type", deserialize_with = "license_type_or_default")]
    pub license_type: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub features: Vec<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default = "default_max_machines", deserialize_with = "max_machines_or_default")]
    pub max_machines: u32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub bound_machines: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub email: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
}

fn license_type_or_default<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_else(default_license_type))
}

fn max_machines_or_default<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<u32>::deserialize(deserializer)?.unwrap_or_else(default_max_machines))
}

impl LicenseRecord {
    /// Returns true if the license has expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| now > exp)
    }

    /// Returns true if `machine_hash` holds one of this license's slots.
    pub fn is_bound(&self, machine_hash: &str) -> bool {
        self.bound_machines.iter().any(|m| m == machine_hash)
    }

    /// Returns true if no further machine can be bound.
    pub fn is_full(&self) -> bool {
        self.bound_machines.len() >= self.max_machines as usize
    }

    /// The entitlement this record grants.
    pub fn entitlement(&self) -> Entitlement {
        Entitlement {
            license_type: self.license_type.clone(),
            features: self.features.clone(),
            expires_at: self.expires_at,
            max_machines: self.max_machines,
            email: self.email.clone(),
            name: self.name.clone(),
        }
    }
}

/// The license fields granted by a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    pub license_type: String,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub max_machines: u32,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub name: String,
}

impl Entitlement {
    /// Case-insensitive feature lookup.
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f.eq_ignore_ascii_case(feature))
    }

    /// Whole days until expiry (never negative), or `None` for no expiry.
    pub fn days_remaining_at(&self, now: DateTime<Utc>) -> Option<i64> {
        self.expires_at
            .map(|exp| (exp - now).num_days().max(0))
    }
}

/// Partial update of a `licenses` row.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LicensePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bound_machines: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_version: Option<String>,
}

impl LicensePatch {
    /// A patch that replaces the binding list.
    pub fn bindings(bound_machines: Vec<String>) -> Self {
        Self {
            bound_machines: Some(bound_machines),
            ..Default::default()
        }
    }

    /// A patch that stamps a successful check-in.
    pub fn seen(now: DateTime<Utc>, app_version: &str) -> Self {
        Self {
            last_seen: Some(now),
            last_version: Some(app_version.to_string()),
            ..Default::default()
        }
    }
}

/// Audit record inserted into `activations` when a machine is bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationRecord {
    pub id: uuid::Uuid,
    pub license_key: String,
    pub machine_hash: String,
    pub app_id: String,
    pub activated_at: DateTime<Utc>,
    pub app_version: String,
}

/// Moderation state of a device row in `users`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Visitor,
    Banned,
    Suspicious,
    Hacking,
    #[serde(other)]
    Unknown,
}

impl UserStatus {
    /// Flagged rows are owned by moderators and never touched by clients.
    pub fn is_flagged(&self) -> bool {
        matches!(self, Self::Banned | Self::Suspicious | Self::Hacking)
    }
}

fn default_user_status() -> UserStatus {
    UserStatus::Unknown
}

fn user_status_or_default<'de, D>(deserializer: D) -> Result<UserStatus, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<UserStatus>::deserialize(deserializer)?.unwrap_or_else(default_user_status))
}

/// A row of the `users` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    #[serde(default, deserialize_with = "null_as_default")]
    pub app_id: String,
    #[serde(default = "default_user_status", deserialize_with = "user_status_or_default")]
    pub status: UserStatus,
    #[serde(default)]
    pub ban_reason: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub total_visits: u64,
    #[serde(default)]
    pub license_key: Option<String>,
}

impl UserRecord {
    pub fn is_banned(&self) -> bool {
        self.status == UserStatus::Banned
    }
}

/// Partial update of a `users` row.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UserPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_visits: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<UserStatus>,
}

/// A `users` row created on a device's first successful validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewUser {
    pub app_id: String,
    pub license_key: Option<String>,
    pub status: UserStatus,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub total_visits: u64,
    pub failed_attempts: u64,
}
