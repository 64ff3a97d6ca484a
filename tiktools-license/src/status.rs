//! Session status and validation outcomes.

use crate::record::Entitlement;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The authorization state of a license session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseStatus {
    /// Validated online and bound to this machine.
    Valid,
    /// No validated key (initial state, unknown key, empty key).
    Invalid,
    /// The license's expiry date has passed.
    Expired,
    /// Disabled by the authority (inactive, deleted, banned device, or this
    /// machine unbound). Terminal until the next explicit `validate()`.
    Disabled,
    /// This machine gave up its own binding via `deactivate()`.
    Revoked,
    /// Every machine slot of the license is taken.
    MaxDevices,
    /// Authority unreachable; running on a cached entitlement.
    Offline,
    /// Validation could not complete.
    Error,
}

impl LicenseStatus {
    /// Returns true if the host may unlock licensed functionality.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Valid | Self::Offline)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::Expired => "expired",
            Self::Disabled => "disabled",
            Self::Revoked => "revoked",
            Self::MaxDevices => "max_devices",
            Self::Offline => "offline",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LicenseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session was disabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisableReason {
    /// The device row is banned; carries the moderator's reason if given.
    Banned(Option<String>),
    /// The license row was switched to inactive.
    LicenseDisabled,
    /// The license row no longer exists.
    LicenseDeleted,
    /// This machine's hash was removed from `bound_machines`.
    MachineRemoved,
}

impl fmt::Display for DisableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Banned(Some(reason)) if !reason.trim().is_empty() => {
                write!(f, "Device banned: {reason}")
            }
            Self::Banned(_) => f.write_str("Device banned: Your device has been banned by administrator"),
            Self::LicenseDisabled => f.write_str("License has been disabled by administrator"),
            Self::LicenseDeleted => f.write_str("License has been deleted"),
            Self::MachineRemoved => f.write_str("Device has been removed from license"),
        }
    }
}

/// The outcome of a `validate()` call.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    pub status: LicenseStatus,
    /// Present for `Valid` and `Offline` only.
    pub entitlement: Option<Entitlement>,
    /// Human-readable explanation for non-valid outcomes.
    pub message: Option<String>,
    /// Hours since the last online validation, for `Offline`.
    pub offline_hours: Option<f64>,
}

impl ValidationResult {
    pub(crate) fn valid(entitlement: Entitlement) -> Self {
        Self {
            status: LicenseStatus::Valid,
            entitlement: Some(entitlement),
            message: None,
            offline_hours: None,
        }
    }

    pub(crate) fn offline(entitlement: Entitlement, offline_hours: f64) -> Self {
        Self {
            status: LicenseStatus::Offline,
            entitlement: Some(entitlement),
            message: None,
            offline_hours: Some(offline_hours),
        }
    }

    pub(crate) fn rejected(status: LicenseStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            entitlement: None,
            message: Some(message.into()),
            offline_hours: None,
        }
    }

    /// Returns true for `Valid` and `Offline`.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.status.is_usable()
    }
}
