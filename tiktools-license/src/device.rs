//! Machine identity for license binding.
//!
//! A raw fingerprint is derived from stable hardware/host signals and never
//! leaves the process. The authority only ever sees the salted, truncated
//! bound hash.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::env;
use sysinfo::{CpuRefreshKind, Networks, RefreshKind, System};

/// Salt/version tag mixed into the bound hash.
pub const MACHINE_HASH_SALT: &str = ":salt:v1";

/// Length (hex chars) of the bound hash.
pub const MACHINE_HASH_LEN: usize = 32;

/// Interface name prefixes that never count as the primary adapter.
const VIRTUAL_ADAPTER_PREFIXES: &[&str] = &[
    "lo", "docker", "veth", "br-", "virbr", "vmnet", "vboxnet", "tun", "tap", "utun", "awdl",
    "llw", "bridge", "zt", "wg",
];

/// Information about the current device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Operating system name.
    pub os_name: String,
    /// Hostname.
    pub hostname: String,
    /// CPU architecture.
    pub arch: String,
}

impl DeviceInfo {
    /// Collects information about the current device.
    #[must_use]
    pub fn collect() -> Self {
        Self {
            os_name: env::consts::OS.to_string(),
            hostname: get_hostname().unwrap_or_else(|| "unknown".to_string()),
            arch: env::consts::ARCH.to_string(),
        }
    }
}

/// The stable signals a fingerprint is computed from, in digest order.
///
/// Missing signals are `None` and are skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineSignals {
    pub hostname: Option<String>,
    pub arch: Option<String>,
    pub processor: Option<String>,
    pub os: Option<String>,
    pub mac_address: Option<String>,
    pub platform_id: Option<String>,
}

impl MachineSignals {
    /// Reads the signals of the current machine.
    #[must_use]
    pub fn collect() -> Self {
        Self {
            hostname: get_hostname(),
            arch: Some(env::consts::ARCH.to_string()),
            processor: get_processor(),
            os: Some(env::consts::OS.to_string()),
            mac_address: get_primary_mac(),
            platform_id: get_platform_id(),
        }
    }

    fn ordered(&self) -> [Option<&str>; 6] {
        [
            self.hostname.as_deref(),
            self.arch.as_deref(),
            self.processor.as_deref(),
            self.os.as_deref(),
            self.mac_address.as_deref(),
            self.platform_id.as_deref(),
        ]
    }
}

/// A device's identity: the raw fingerprint and the hash bound to licenses.
#[derive(Clone, PartialEq, Eq)]
pub struct MachineIdentity {
    fingerprint: String,
    bound_hash: String,
}

impl MachineIdentity {
    /// Derives the identity of the current machine.
    #[must_use]
    pub fn current() -> Self {
        Self::from_signals(&MachineSignals::collect())
    }

    /// Derives an identity from an explicit signal set.
    #[must_use]
    pub fn from_signals(signals: &MachineSignals) -> Self {
        let combined = signals
            .ordered()
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("|");

        Self::from_fingerprint(hex::encode(Sha256::digest(combined.as_bytes())))
    }

    /// Builds an identity around an already-computed raw fingerprint.
    #[must_use]
    pub fn from_fingerprint(fingerprint: impl Into<String>) -> Self {
        let fingerprint = fingerprint.into();
        let salted = format!("{fingerprint}{MACHINE_HASH_SALT}");
        let mut bound_hash = hex::encode(Sha256::digest(salted.as_bytes()));
        bound_hash.truncate(MACHINE_HASH_LEN);

        Self {
            fingerprint,
            bound_hash,
        }
    }

    /// The raw fingerprint. Local use only (cache key material).
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// The salted hash sent to the authority and stored in `bound_machines`.
    #[must_use]
    pub fn bound_hash(&self) -> &str {
        &self.bound_hash
    }
}

impl std::fmt::Debug for MachineIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineIdentity")
            .field("fingerprint", &"[REDACTED]")
            .field("bound_hash", &self.bound_hash)
            .finish()
    }
}

/// Gets the machine hostname.
fn get_hostname() -> Option<String> {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
}

/// Gets the CPU brand string.
fn get_processor() -> Option<String> {
    let sys = System::new_with_specifics(RefreshKind::nothing().with_cpu(CpuRefreshKind::nothing()));
    sys.cpus()
        .first()
        .map(|cpu| cpu.brand().trim().to_string())
        .filter(|brand| !brand.is_empty())
}

/// Gets the MAC address of the primary physical adapter.
///
/// Adapters are ordered by name so the choice is stable across runs.
fn get_primary_mac() -> Option<String> {
    let networks = Networks::new_with_refreshed_list();
    let mut candidates: Vec<(&String, String)> = networks
        .list()
        .iter()
        .filter(|(name, _)| {
            !VIRTUAL_ADAPTER_PREFIXES
                .iter()
                .any(|prefix| name.starts_with(prefix))
        })
        .filter(|(_, data)| !data.mac_address().is_unspecified())
        .map(|(name, data)| (name, data.mac_address().to_string()))
        .collect();
    candidates.sort();
    candidates.into_iter().next().map(|(_, mac)| mac)
}

/// Gets the platform machine ID (platform-specific unique identifier).
fn get_platform_id() -> Option<String> {
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("ioreg")
            .args(["-rd1", "-c", "IOPlatformExpertDevice"])
            .output()
            .ok()
            .and_then(|o| String::from_utf8(o.stdout).ok())
            .and_then(|output| {
                output
                    .lines()
                    .find(|l| l.contains("IOPlatformUUID"))
                    .and_then(|l| l.split('"').nth(3))
                    .map(String::from)
            })
    }

    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/etc/machine-id")
            .or_else(|_| std::fs::read_to_string("/var/lib/dbus/machine-id"))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    #[cfg(target_os = "windows")]
    {
        // first physical disk serial
        std::process::Command::new("wmic")
            .args(["diskdrive", "get", "serialnumber"])
            .output()
            .ok()
            .and_then(|o| String::from_utf8(o.stdout).ok())
            .and_then(|output| {
                output
                    .lines()
                    .map(str::trim)
                    .find(|l| !l.is_empty() && *l != "SerialNumber")
                    .map(String::from)
            })
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows", target_os = "linux")))]
    {
        None
    }
}
