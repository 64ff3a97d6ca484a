//! Request/response access to the license authority.
//!
//! [`Authority`] is the seam the engine talks through. [`AuthorityClient`]
//! implements it over the authority's REST tables. Calls are single-shot:
//! a fixed timeout, no retries, failures classified into
//! [`AuthorityError`].

use crate::config::LicenseConfig;
use crate::error::{AuthorityError, AuthorityResult};
use crate::record::{ActivationRecord, LicensePatch, LicenseRecord, NewUser, UserPatch, UserRecord};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

const LICENSES: &str = "licenses";
const ACTIVATIONS: &str = "activations";
const USERS: &str = "users";

/// Operations the engine needs from the authority.
#[async_trait]
pub trait Authority: Send + Sync {
    /// Fetches a license row by key.
    async fn fetch_license(&self, key: &str) -> AuthorityResult<Option<LicenseRecord>>;

    /// Applies a partial update to a license row.
    async fn patch_license(&self, key: &str, patch: &LicensePatch) -> AuthorityResult<()>;

    /// Inserts an activation audit record.
    async fn insert_activation(&self, activation: &ActivationRecord) -> AuthorityResult<()>;

    /// Fetches a device row by app id.
    async fn fetch_user(&self, app_id: &str) -> AuthorityResult<Option<UserRecord>>;

    /// Applies a partial update to a device row.
    async fn patch_user(&self, app_id: &str, patch: &UserPatch) -> AuthorityResult<()>;

    /// Inserts a device row.
    async fn insert_user(&self, user: &NewUser) -> AuthorityResult<()>;
}

/// Body of `POST /api/validate`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidateRequest {
    pub license_key: String,
    pub machine_id: String,
    pub app_id: String,
    pub app_version: String,
}

/// Response of `POST /api/validate`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ValidateResponse {
    #[serde(default)]
    pub valid: bool,
    #[serde(default)]
    pub license_type: Option<String>,
    #[serde(default)]
    pub features: Option<Vec<String>>,
    #[serde(default)]
    pub expires_at: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Body of `POST /api/deactivate`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeactivateRequest {
    pub license_key: String,
    pub machine_id: String,
}

/// Response of `POST /api/deactivate`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeactivateResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// HTTP client for the authority.
#[derive(Debug, Clone)]
pub struct AuthorityClient {
    base_url: String,
    api_key: String,
    client: Client,
}

impl AuthorityClient {
    /// Creates a client for the configured authority.
    pub fn new(config: &LicenseConfig) -> AuthorityResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.request_timeout)
            .build()
            .map_err(|e| AuthorityError::Connection(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            base_url: config.authority_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            client,
        })
    }

    /// Returns the REST base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header("Prefer", "return=representation")
    }

    async fn select_one<T: DeserializeOwned>(
        &self,
        table: &str,
        column: &str,
        value: &str,
    ) -> AuthorityResult<Option<T>> {
        let request = self
            .client
            .get(self.table_url(table))
            .query(&[(column, format!("eq.{value}"))]);
        let rows: Vec<T> = read_json(self.authorize(request).send().await?).await?;
        Ok(rows.into_iter().next())
    }

    async fn update<B: Serialize + Sync>(
        &self,
        table: &str,
        column: &str,
        value: &str,
        body: &B,
    ) -> AuthorityResult<()> {
        let request = self
            .client
            .patch(self.table_url(table))
            .query(&[(column, format!("eq.{value}"))])
            .json(body);
        expect_success(self.authorize(request).send().await?).await
    }

    async fn insert<B: Serialize + Sync>(&self, table: &str, body: &B) -> AuthorityResult<()> {
        let request = self.client.post(self.table_url(table)).json(body);
        expect_success(self.authorize(request).send().await?).await
    }

    /// `GET /users?app_id=eq.<id>`: every device row for an app id.
    pub async fn users_by_app_id(&self, app_id: &str) -> AuthorityResult<Vec<UserRecord>> {
        let request = self
            .client
            .get(self.table_url(USERS))
            .query(&[("app_id", format!("eq.{app_id}"))]);
        read_json(self.authorize(request).send().await?).await
    }

    /// `POST /api/validate` on the license server.
    pub async fn validate_remote(&self, body: &ValidateRequest) -> AuthorityResult<ValidateResponse> {
        let request = self
            .client
            .post(format!("{}/api/validate", self.base_url))
            .json(body);
        read_json(self.authorize(request).send().await?).await
    }

    /// `POST /api/deactivate` on the license server.
    pub async fn deactivate_remote(
        &self,
        body: &DeactivateRequest,
    ) -> AuthorityResult<DeactivateResponse> {
        let request = self
            .client
            .post(format!("{}/api/deactivate", self.base_url))
            .json(body);
        read_json(self.authorize(request).send().await?).await
    }
}

#[async_trait]
impl Authority for AuthorityClient {
    async fn fetch_license(&self, key: &str) -> AuthorityResult<Option<LicenseRecord>> {
        self.select_one(LICENSES, "key", key).await
    }

    async fn patch_license(&self, key: &str, patch: &LicensePatch) -> AuthorityResult<()> {
        self.update(LICENSES, "key", key, patch).await
    }

    async fn insert_activation(&self, activation: &ActivationRecord) -> AuthorityResult<()> {
        self.insert(ACTIVATIONS, activation).await
    }

    async fn fetch_user(&self, app_id: &str) -> AuthorityResult<Option<UserRecord>> {
        self.select_one(USERS, "app_id", app_id).await
    }

    async fn patch_user(&self, app_id: &str, patch: &UserPatch) -> AuthorityResult<()> {
        self.update(USERS, "app_id", app_id, patch).await
    }

    async fn insert_user(&self, user: &NewUser) -> AuthorityResult<()> {
        self.insert(USERS, user).await
    }
}

/// Turns a non-2xx response into [`AuthorityError::Status`] with its body.
async fn check_status(response: Response) -> AuthorityResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    debug!("Authority returned {status}");
    Err(AuthorityError::Status {
        status: status.as_u16(),
        body,
    })
}

async fn expect_success(response: Response) -> AuthorityResult<()> {
    check_status(response).await.map(|_| ())
}

async fn read_json<T: DeserializeOwned>(response: Response) -> AuthorityResult<T> {
    let response = check_status(response).await?;
    let text = response.text().await?;
    // PostgREST answers an empty body for some writes
    let text = if text.trim().is_empty() { "[]" } else { text.as_str() };
    serde_json::from_str(text).map_err(|e| AuthorityError::Decode(e.to_string()))
}

/// An in-memory authority for tests and offline development.
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Mutex, PoisonError};
    use std::time::Duration;

    #[derive(Default)]
    struct Tables {
        licenses: HashMap<String, LicenseRecord>,
        users: HashMap<String, UserRecord>,
        activations: Vec<ActivationRecord>,
        new_users: Vec<NewUser>,
        license_patches: Vec<(String, LicensePatch)>,
    }

    /// Authority backed by in-process tables.
    ///
    /// `set_offline(true)` makes every call fail with a connection error;
    /// `fail_activations(true)` makes only the audit insert fail.
    /// `set_patch_latency` delays the answer to a license patch that has
    /// already been applied.
    #[derive(Default)]
    pub struct MemoryAuthority {
        tables: Mutex<Tables>,
        offline: AtomicBool,
        fail_activations: AtomicBool,
        patch_latency: Mutex<Duration>,
        calls: AtomicUsize,
    }

    impl MemoryAuthority {
        pub fn new() -> Self {
            Self::default()
        }

        fn tables(&self) -> std::sync::MutexGuard<'_, Tables> {
            self.tables.lock().unwrap_or_else(PoisonError::into_inner)
        }

        fn enter(&self) -> AuthorityResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.offline.load(Ordering::SeqCst) {
                return Err(AuthorityError::Connection("connection refused".to_string()));
            }
            Ok(())
        }

        /// Inserts or replaces a license row.
        pub fn put_license(&self, record: LicenseRecord) {
            self.tables().licenses.insert(record.key.clone(), record);
        }

        /// Removes a license row.
        pub fn delete_license(&self, key: &str) {
            self.tables().licenses.remove(key);
        }

        /// Returns a copy of a license row.
        pub fn license(&self, key: &str) -> Option<LicenseRecord> {
            self.tables().licenses.get(key).cloned()
        }

        /// Mutates a license row in place.
        pub fn update_license(&self, key: &str, f: impl FnOnce(&mut LicenseRecord)) {
            if let Some(record) = self.tables().licenses.get_mut(key) {
                f(record);
            }
        }

        /// Inserts or replaces a device row.
        pub fn put_user(&self, record: UserRecord) {
            self.tables().users.insert(record.app_id.clone(), record);
        }

        /// Returns a copy of a device row.
        pub fn user(&self, app_id: &str) -> Option<UserRecord> {
            self.tables().users.get(app_id).cloned()
        }

        pub fn activations(&self) -> Vec<ActivationRecord> {
            self.tables().activations.clone()
        }

        pub fn license_patches(&self) -> Vec<(String, LicensePatch)> {
            self.tables().license_patches.clone()
        }

        pub fn set_offline(&self, offline: bool) {
            self.offline.store(offline, Ordering::SeqCst);
        }

        pub fn fail_activations(&self, fail: bool) {
            self.fail_activations.store(fail, Ordering::SeqCst);
        }

        pub fn set_patch_latency(&self, latency: Duration) {
            *self.patch_latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
        }

        /// Number of calls made so far, including failed ones.
        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Authority for MemoryAuthority {
        async fn fetch_license(&self, key: &str) -> AuthorityResult<Option<LicenseRecord>> {
            self.enter()?;
            Ok(self.tables().licenses.get(key).cloned())
        }

        async fn patch_license(&self, key: &str, patch: &LicensePatch) -> AuthorityResult<()> {
            self.enter()?;
            {
                let mut tables = self.tables();
                tables.license_patches.push((key.to_string(), patch.clone()));
                if let Some(record) = tables.licenses.get_mut(key) {
                    if let Some(bound) = &patch.bound_machines {
                        record.bound_machines = bound.clone();
                    }
                }
            }
            let latency = *self.patch_latency.lock().unwrap_or_else(PoisonError::into_inner);
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            Ok(())
        }

        async fn insert_activation(&self, activation: &ActivationRecord) -> AuthorityResult<()> {
            self.enter()?;
            if self.fail_activations.load(Ordering::SeqCst) {
                return Err(AuthorityError::Status {
                    status: 500,
                    body: "activations unavailable".to_string(),
                });
            }
            self.tables().activations.push(activation.clone());
            Ok(())
        }

        async fn fetch_user(&self, app_id: &str) -> AuthorityResult<Option<UserRecord>> {
            self.enter()?;
            Ok(self.tables().users.get(app_id).cloned())
        }

        async fn patch_user(&self, app_id: &str, patch: &UserPatch) -> AuthorityResult<()> {
            self.enter()?;
            if let Some(user) = self.tables().users.get_mut(app_id) {
                if let Some(visits) = patch.total_visits {
                    user.total_visits = visits;
                }
                if let Some(status) = patch.status {
                    user.status = status;
                }
                if patch.license_key.is_some() {
                    user.license_key = patch.license_key.clone();
                }
            }
            Ok(())
        }

        async fn insert_user(&self, user: &NewUser) -> AuthorityResult<()> {
            self.enter()?;
            let mut tables = self.tables();
            tables.new_users.push(user.clone());
            tables.users.insert(
                user.app_id.clone(),
                UserRecord {
                    app_id: user.app_id.clone(),
                    status: user.status,
                    ban_reason: None,
                    total_visits: user.total_visits,
                    license_key: user.license_key.clone(),
                },
            );
            Ok(())
        }
    }
}
