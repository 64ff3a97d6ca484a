//! Shared test helpers for license tests.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tiktools_license::authority::mock::MemoryAuthority;
use tiktools_license::{
    DisableReason, Entitlement, LicenseClient, LicenseConfig, LicenseRecord, LicenseStatus,
    MachineIdentity,
};

pub const KEY: &str = "ABCD-1234";

/// A fixed identity so hashes are stable across test runs.
pub fn identity() -> MachineIdentity {
    MachineIdentity::from_fingerprint("test-fingerprint-0001")
}

pub fn other_identity() -> MachineIdentity {
    MachineIdentity::from_fingerprint("test-fingerprint-0002")
}

/// A config with monitors disabled and the cache inside `dir`.
pub fn config(dir: &Path) -> LicenseConfig {
    LicenseConfig {
        authority_url: "http://127.0.0.1:9".to_string(),
        api_key: "test-anon-key".to_string(),
        cache_path: Some(dir.join("license_cache.enc")),
        request_timeout: Duration::from_secs(2),
        realtime_enabled: false,
        poll_enabled: false,
        ..Default::default()
    }
}

/// An active license with `max_machines` slots and the given bindings.
pub fn license(max_machines: u32, bound: &[&str]) -> LicenseRecord {
    LicenseRecord {
        key: KEY.to_string(),
        active: true,
        license_type: "pro".to_string(),
        features: vec!["Batch".to_string(), "hd".to_string()],
        expires_at: None,
        max_machines,
        bound_machines: bound.iter().map(|s| s.to_string()).collect(),
        email: "owner@example.com".to_string(),
        name: "Owner".to_string(),
    }
}

pub fn entitlement() -> Entitlement {
    license(2, &[]).entitlement()
}

pub fn client(dir: &Path, authority: &Arc<MemoryAuthority>) -> LicenseClient {
    client_for(config(dir), identity(), authority)
}

pub fn client_for(
    config: LicenseConfig,
    identity: MachineIdentity,
    authority: &Arc<MemoryAuthority>,
) -> LicenseClient {
    LicenseClient::with_parts(config, identity, authority.clone()).unwrap()
}

pub fn hours_ago(hours: i64) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::hours(hours)
}

/// Everything the client reported through its callbacks.
#[derive(Debug, Default)]
pub struct Recorded {
    pub transitions: Mutex<Vec<(LicenseStatus, LicenseStatus)>>,
    pub disabled: Mutex<Vec<DisableReason>>,
    pub updates: Mutex<Vec<serde_json::Value>>,
}

impl Recorded {
    pub fn transitions(&self) -> Vec<(LicenseStatus, LicenseStatus)> {
        self.transitions.lock().unwrap().clone()
    }

    pub fn disabled(&self) -> Vec<DisableReason> {
        self.disabled.lock().unwrap().clone()
    }

    pub fn updates(&self) -> Vec<serde_json::Value> {
        self.updates.lock().unwrap().clone()
    }
}

/// Registers recording callbacks on `client`.
pub fn record(client: &LicenseClient) -> Arc<Recorded> {
    let recorded = Arc::new(Recorded::default());

    let r = recorded.clone();
    client.on_status_change(move |old, new| r.transitions.lock().unwrap().push((old, new)));
    let r = recorded.clone();
    client.on_license_disabled(move |reason| r.disabled.lock().unwrap().push(reason.clone()));
    let r = recorded.clone();
    client.on_realtime_update(move |record| r.updates.lock().unwrap().push(record.clone()));

    recorded
}

/// Polls `condition` every 10ms until it holds or `limit` elapses.
pub async fn eventually(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
