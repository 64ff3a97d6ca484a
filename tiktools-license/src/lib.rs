//! License entitlement sync for TikTools.
//!
//! Keeps a desktop client's authorization state consistent with the remote
//! license authority in three modes:
//! - online validation with machine binding
//! - realtime revocation over the authority's push channel, backed by a
//!   periodic poll
//! - bounded offline operation from a sealed local cache
//!
//! # Identity
//!
//! Only the salted machine hash ever leaves the device. The raw fingerprint
//! stays local and keys the cache.
//!
//! # Usage
//!
//! ```no_run
//! # async fn run() -> tiktools_license::LicenseResult<()> {
//! use tiktools_license::{LicenseClient, LicenseConfig};
//!
//! let client = LicenseClient::new(LicenseConfig {
//!     authority_url: "https://auth.example.com".to_string(),
//!     api_key: "public-anon-key".to_string(),
//!     ..Default::default()
//! })?;
//! client.on_license_disabled(|reason| eprintln!("{reason}"));
//!
//! let result = client.validate("ABCD-1234").await;
//! if result.is_valid() && client.has_feature("batch") {
//!     // unlock
//! }
//! client.stop();
//! # Ok(())
//! # }
//! ```

pub mod authority;
mod cache;
mod client;
mod config;
mod device;
mod error;
mod notifier;
pub mod poll;
pub mod realtime;
mod record;
mod status;

pub use authority::{Authority, AuthorityClient};
pub use cache::{CacheSnapshot, SecureCache};
pub use client::{LicenseClient, ValidateOptions};
pub use config::{CACHE_DIR_NAME, CACHE_FILE_NAME, LicenseConfig};
pub use device::{DeviceInfo, MACHINE_HASH_LEN, MACHINE_HASH_SALT, MachineIdentity, MachineSignals};
pub use error::{AuthorityError, AuthorityResult, LicenseError, LicenseResult};
pub use notifier::EventNotifier;
pub use record::{
    ActivationRecord, Entitlement, LicensePatch, LicenseRecord, NewUser, UserPatch, UserRecord,
    UserStatus, parse_timestamp,
};
pub use status::{DisableReason, LicenseStatus, ValidationResult};
