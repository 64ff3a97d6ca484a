//! The license session state machine.
//!
//! [`LicenseClient`] owns the session (key, status, entitlement, last online
//! validation) and every component that feeds it. All transitions go
//! through one session lock; `validate()` and `deactivate()` are further
//! serialized against each other so their network round-trips never
//! interleave. Callbacks always run after the lock is released.

use crate::authority::{Authority, AuthorityClient};
use crate::cache::{CacheSnapshot, SecureCache};
use crate::config::LicenseConfig;
use crate::device::MachineIdentity;
use crate::error::{AuthorityResult, LicenseError, LicenseResult};
use crate::notifier::EventNotifier;
use crate::poll::PollFallback;
use crate::realtime::{RealtimeChannel, RevocationSink, key_prefix};
use crate::record::{
    ActivationRecord, Entitlement, LicensePatch, LicenseRecord, NewUser, UserPatch, UserStatus,
};
use crate::status::{DisableReason, LicenseStatus, ValidationResult};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Per-call options for [`LicenseClient::validate_with`].
#[derive(Debug, Clone, Copy)]
pub struct ValidateOptions {
    /// Start the realtime channel and poll fallback on success.
    pub monitor: bool,
}

impl Default for ValidateOptions {
    fn default() -> Self {
        Self { monitor: true }
    }
}

#[derive(Debug)]
struct Session {
    key: Option<String>,
    status: LicenseStatus,
    entitlement: Option<Entitlement>,
    last_online_validation: Option<DateTime<Utc>>,
    /// Bumped by every validate/deactivate; monitor signals carry the epoch
    /// they were started for.
    epoch: u64,
}

struct Monitors {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

struct Shared {
    config: LicenseConfig,
    identity: MachineIdentity,
    authority: Arc<dyn Authority>,
    cache: SecureCache,
    notifier: EventNotifier,
    session: Mutex<Session>,
    monitors: Mutex<Option<Monitors>>,
    op_gate: tokio::sync::Mutex<()>,
}

/// Keeps a desktop client's entitlement in step with the license authority.
///
/// One instance per process, passed by reference to whatever needs it.
pub struct LicenseClient {
    shared: Arc<Shared>,
}

impl LicenseClient {
    /// Creates a client for the current machine against the configured
    /// authority.
    pub fn new(config: LicenseConfig) -> LicenseResult<Self> {
        let authority = Arc::new(AuthorityClient::new(&config)?);
        Self::with_parts(config, MachineIdentity::current(), authority)
    }

    /// Creates a client from explicit parts.
    ///
    /// Fails on a config the monitors cannot run with.
    /// Restores key, status and entitlement from a trusted cache snapshot,
    /// if there is one.
    pub fn with_parts(
        config: LicenseConfig,
        identity: MachineIdentity,
        authority: Arc<dyn Authority>,
    ) -> LicenseResult<Self> {
        config.validate()?;
        let cache = SecureCache::new(
            config.resolve_cache_path()?,
            &identity,
            config.offline_horizon,
        )?;

        let mut session = Session {
            key: None,
            status: LicenseStatus::Invalid,
            entitlement: None,
            last_online_validation: None,
            epoch: 0,
        };
        if let Some(snapshot) = cache.load_trusted() {
            debug!("Restored license {}... from cache", key_prefix(&snapshot.license_key));
            session.key = Some(snapshot.license_key);
            if snapshot.entitlement.is_some() {
                session.status = snapshot.status;
                session.entitlement = snapshot.entitlement;
                session.last_online_validation = snapshot.last_online_validation;
            }
        }

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                identity,
                authority,
                cache,
                notifier: EventNotifier::new(),
                session: Mutex::new(session),
                monitors: Mutex::new(None),
                op_gate: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// Validates `key` online and starts monitoring on success.
    pub async fn validate(&self, key: &str) -> ValidationResult {
        self.validate_with(key, ValidateOptions::default()).await
    }

    /// Validates `key` online.
    ///
    /// Never fails: every outcome, including an unreachable authority, is
    /// reported through the returned status.
    pub async fn validate_with(&self, key: &str, options: ValidateOptions) -> ValidationResult {
        let _gate = self.shared.op_gate.lock().await;
        self.shared.stop_monitors();

        let key = normalize_key(key);
        let epoch = self.shared.begin_session(key.as_deref());
        let Some(key) = key else {
            return self
                .shared
                .reject(epoch, LicenseStatus::Invalid, "No license key", None);
        };

        let result = self.shared.run_validation(epoch, &key).await;
        info!("License {}... validated: {}", key_prefix(&key), result.status);

        if result.status == LicenseStatus::Valid && options.monitor {
            self.shared.start_monitors(epoch, &key);
        }
        result
    }

    /// Re-validates the key restored from cache (or the last validated key).
    pub async fn validate_stored(&self) -> ValidationResult {
        let key = self.license_key().unwrap_or_default();
        self.validate(&key).await
    }

    /// Releases this machine's binding and ends the session with `Revoked`.
    pub async fn deactivate(&self) -> LicenseResult<()> {
        let _gate = self.shared.op_gate.lock().await;
        let key = self.license_key().ok_or(LicenseError::NotActivated)?;
        let hash = self.shared.identity.bound_hash();

        let record = self
            .shared
            .authority
            .fetch_license(&key)
            .await?
            .ok_or_else(|| LicenseError::NotFound(key_prefix(&key).to_string()))?;

        // Our own unbinding must not come back through the monitors as a
        // revocation.
        let was_monitoring = self.is_monitoring();
        let epoch = {
            let mut session = self.shared.lock_session();
            session.epoch += 1;
            session.epoch
        };
        self.shared.stop_monitors();

        if record.is_bound(hash) {
            let remaining: Vec<String> = record
                .bound_machines
                .into_iter()
                .filter(|m| m != hash)
                .collect();
            let patch = LicensePatch::bindings(remaining);
            if let Err(e) = self.shared.authority.patch_license(&key, &patch).await {
                if was_monitoring && self.is_valid() {
                    self.shared.start_monitors(epoch, &key);
                }
                return Err(e.into());
            }
        }

        let old = {
            let mut session = self.shared.lock_session();
            session.epoch += 1;
            session.key = None;
            session.entitlement = None;
            session.last_online_validation = None;
            std::mem::replace(&mut session.status, LicenseStatus::Revoked)
        };
        self.shared.cache.clear();
        info!("License {}... deactivated on this machine", key_prefix(&key));

        if old != LicenseStatus::Revoked {
            self.shared.notifier.status_changed(old, LicenseStatus::Revoked);
        }
        Ok(())
    }

    /// Starts the realtime channel and poll fallback for the current key.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_monitoring(&self) -> LicenseResult<()> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| LicenseError::Runtime(e.to_string()))?;
        let _enter = handle.enter();

        let (key, epoch) = {
            let session = self.shared.lock_session();
            (session.key.clone(), session.epoch)
        };
        let key = key.ok_or(LicenseError::NotActivated)?;
        self.shared.start_monitors(epoch, &key);
        Ok(())
    }

    /// Signals every background monitor to stop. Does not wait for them.
    pub fn stop(&self) {
        self.shared.stop_monitors();
    }

    /// Returns true while background monitors are running.
    pub fn is_monitoring(&self) -> bool {
        self.shared
            .lock_monitors()
            .as_ref()
            .is_some_and(|m| m.tasks.iter().any(|t| !t.is_finished()))
    }

    /// Returns true if licensed functionality may be used (`Valid` or
    /// `Offline`).
    pub fn is_valid(&self) -> bool {
        self.status().is_usable()
    }

    pub fn status(&self) -> LicenseStatus {
        self.shared.lock_session().status
    }

    pub fn license_key(&self) -> Option<String> {
        self.shared.lock_session().key.clone()
    }

    /// The license type, or `"none"` unless the session is usable.
    pub fn license_type(&self) -> String {
        let session = self.shared.lock_session();
        match &session.entitlement {
            Some(e) if session.status.is_usable() => e.license_type.clone(),
            _ => "none".to_string(),
        }
    }

    pub fn entitlement(&self) -> Option<Entitlement> {
        self.shared.lock_session().entitlement.clone()
    }

    /// Case-insensitive feature check. Only a usable session grants
    /// features; an expired entitlement is kept for display only.
    pub fn has_feature(&self, feature: &str) -> bool {
        let session = self.shared.lock_session();
        session.status.is_usable()
            && session
                .entitlement
                .as_ref()
                .is_some_and(|e| e.has_feature(feature))
    }

    /// Whole days until expiry; `None` without an entitlement or expiry.
    pub fn days_remaining(&self) -> Option<i64> {
        self.shared
            .lock_session()
            .entitlement
            .as_ref()
            .and_then(|e| e.days_remaining_at(Utc::now()))
    }

    pub fn identity(&self) -> &MachineIdentity {
        &self.shared.identity
    }

    pub fn config(&self) -> &LicenseConfig {
        &self.shared.config
    }

    pub fn on_status_change<F>(&self, callback: F)
    where
        F: Fn(LicenseStatus, LicenseStatus) + Send + Sync + 'static,
    {
        self.shared.notifier.on_status_change(callback);
    }

    pub fn on_license_disabled<F>(&self, callback: F)
    where
        F: Fn(&DisableReason) + Send + Sync + 'static,
    {
        self.shared.notifier.on_license_disabled(callback);
    }

    pub fn on_realtime_update<F>(&self, callback: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.shared.notifier.on_realtime_update(callback);
    }
}

impl Drop for LicenseClient {
    fn drop(&mut self) {
        self.shared.stop_monitors();
    }
}

impl std::fmt::Debug for LicenseClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LicenseClient")
            .field("identity", &self.shared.identity)
            .field("status", &self.status())
            .finish()
    }
}

impl Shared {
    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_monitors(&self) -> MutexGuard<'_, Option<Monitors>> {
        self.monitors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin_session(&self, key: Option<&str>) -> u64 {
        let mut session = self.lock_session();
        session.epoch += 1;
        if let Some(key) = key {
            session.key = Some(key.to_string());
        }
        session.epoch
    }

    async fn run_validation(&self, epoch: u64, key: &str) -> ValidationResult {
        let hash = self.identity.bound_hash();

        match self.authority.fetch_user(hash).await {
            Ok(Some(user)) if user.is_banned() => {
                let reason = DisableReason::Banned(user.ban_reason);
                let message = reason.to_string();
                self.disable(epoch, reason);
                return ValidationResult::rejected(LicenseStatus::Disabled, message);
            }
            Ok(_) => {}
            Err(e) => debug!("Ban check failed: {e}"),
        }

        let record = match self.authority.fetch_license(key).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                return self.reject(epoch, LicenseStatus::Invalid, "Invalid license key", None);
            }
            Err(e) if e.is_connection() => return self.offline(epoch, key),
            Err(e) => return self.reject(epoch, LicenseStatus::Error, e.to_string(), None),
        };

        let now = Utc::now();
        if !record.active {
            let reason = DisableReason::LicenseDisabled;
            let message = reason.to_string();
            self.disable(epoch, reason);
            return ValidationResult::rejected(LicenseStatus::Disabled, message);
        }
        if record.is_expired_at(now) {
            return self.reject(
                epoch,
                LicenseStatus::Expired,
                "License expired",
                Some(record.entitlement()),
            );
        }

        if !record.is_bound(hash) {
            if record.is_full() {
                let message = format!("Max {} devices allowed", record.max_machines);
                return self.reject(epoch, LicenseStatus::MaxDevices, message, None);
            }
            match self.bind(key, &record, now).await {
                Ok(()) => {}
                Err(e) if e.is_connection() => return self.offline(epoch, key),
                Err(e) => return self.reject(epoch, LicenseStatus::Error, e.to_string(), None),
            }
        }

        self.track_usage(key, now).await;

        let entitlement = record.entitlement();
        self.accept(epoch, key, entitlement.clone(), now);
        ValidationResult::valid(entitlement)
    }

    /// Appends this machine to the record's bindings and audits the
    /// activation. The audit insert is best-effort.
    async fn bind(&self, key: &str, record: &LicenseRecord, now: DateTime<Utc>) -> AuthorityResult<()> {
        let hash = self.identity.bound_hash();
        let mut bound = record.bound_machines.clone();
        bound.push(hash.to_string());
        self.authority
            .patch_license(key, &LicensePatch::bindings(bound))
            .await?;
        info!("Bound this machine to license {}...", key_prefix(key));

        let activation = ActivationRecord {
            id: uuid::Uuid::new_v4(),
            license_key: key.to_string(),
            machine_hash: hash.to_string(),
            app_id: hash.to_string(),
            activated_at: now,
            app_version: self.config.app_version.clone(),
        };
        if let Err(e) = self.authority.insert_activation(&activation).await {
            warn!("Activation audit failed: {e}");
        }
        Ok(())
    }

    /// Best-effort check-in: the device row and the license's last-seen.
    async fn track_usage(&self, key: &str, now: DateTime<Utc>) {
        let app_id = self.identity.bound_hash();

        let tracked: AuthorityResult<()> = async {
            match self.authority.fetch_user(app_id).await? {
                Some(user) if user.status.is_flagged() => Ok(()),
                Some(user) => {
                    let patch = UserPatch {
                        last_seen: Some(now),
                        total_visits: Some(user.total_visits + 1),
                        license_key: Some(key.to_string()),
                        status: Some(UserStatus::Active),
                    };
                    self.authority.patch_user(app_id, &patch).await
                }
                None => {
                    let user = NewUser {
                        app_id: app_id.to_string(),
                        license_key: Some(key.to_string()),
                        status: UserStatus::Active,
                        first_seen: now,
                        last_seen: now,
                        total_visits: 1,
                        failed_attempts: 0,
                    };
                    self.authority.insert_user(&user).await
                }
            }
        }
        .await;
        if let Err(e) = tracked {
            debug!("Usage tracking failed: {e}");
        }

        let seen = LicensePatch::seen(now, &self.config.app_version);
        if let Err(e) = self.authority.patch_license(key, &seen).await {
            debug!("Last-seen update failed: {e}");
        }
    }

    /// Falls back to the cached entitlement when the authority is
    /// unreachable.
    fn offline(&self, epoch: u64, key: &str) -> ValidationResult {
        let now = Utc::now();
        let usable = self.cache.load_trusted_at(now).filter(|snapshot| {
            snapshot.license_key == key
                && snapshot.within_horizon_at(now, self.config.offline_horizon)
        });

        if let Some(snapshot) = usable {
            if let (Some(entitlement), Some(hours)) =
                (snapshot.entitlement.clone(), snapshot.offline_hours_at(now))
            {
                let hours = (hours * 10.0).round() / 10.0;
                warn!("License authority unreachable, offline for {hours}h");
                self.set_state(
                    epoch,
                    LicenseStatus::Offline,
                    Some(entitlement.clone()),
                    snapshot.last_online_validation,
                );
                return ValidationResult::offline(entitlement, hours);
            }
        }

        self.reject(
            epoch,
            LicenseStatus::Error,
            "Cannot connect - online validation required",
            None,
        )
    }

    fn reject(
        &self,
        epoch: u64,
        status: LicenseStatus,
        message: impl Into<String>,
        entitlement: Option<Entitlement>,
    ) -> ValidationResult {
        let last_online = self.lock_session().last_online_validation;
        self.set_state(epoch, status, entitlement, last_online);
        ValidationResult::rejected(status, message)
    }

    fn accept(&self, epoch: u64, key: &str, entitlement: Entitlement, now: DateTime<Utc>) {
        let old = {
            let mut session = self.lock_session();
            if session.epoch != epoch {
                return;
            }
            session.key = Some(key.to_string());
            session.entitlement = Some(entitlement);
            session.last_online_validation = Some(now);
            let old = std::mem::replace(&mut session.status, LicenseStatus::Valid);
            self.persist(&session, now);
            old
        };
        if old != LicenseStatus::Valid {
            self.notifier.status_changed(old, LicenseStatus::Valid);
        }
    }

    fn set_state(
        &self,
        epoch: u64,
        status: LicenseStatus,
        entitlement: Option<Entitlement>,
        last_online: Option<DateTime<Utc>>,
    ) {
        let old = {
            let mut session = self.lock_session();
            if session.epoch != epoch {
                return;
            }
            session.entitlement = entitlement;
            session.last_online_validation = last_online;
            std::mem::replace(&mut session.status, status)
        };
        if old != status {
            self.notifier.status_changed(old, status);
        }
    }

    /// Moves the session to `Disabled`. A no-op if the session is already
    /// disabled or `epoch` has been superseded.
    fn disable(&self, epoch: u64, reason: DisableReason) {
        let old = {
            let mut session = self.lock_session();
            if session.epoch != epoch || session.status == LicenseStatus::Disabled {
                return;
            }
            session.entitlement = None;
            self.cache.clear();
            self.stop_monitors();
            std::mem::replace(&mut session.status, LicenseStatus::Disabled)
        };
        warn!("License disabled: {reason}");
        self.notifier.status_changed(old, LicenseStatus::Disabled);
        self.notifier.disabled(&reason);
    }

    /// Applies a non-revoking realtime change to the running session.
    fn refresh(&self, epoch: u64, record: &Value, active: bool) {
        {
            let mut session = self.lock_session();
            if session.epoch != epoch {
                return;
            }
            if active && session.status.is_usable() {
                match serde_json::from_value::<LicenseRecord>(record.clone()) {
                    Ok(updated) => {
                        debug!("Refreshing entitlement from realtime update");
                        session.entitlement = Some(updated.entitlement());
                        self.persist(&session, Utc::now());
                    }
                    Err(e) => debug!("Unreadable realtime record: {e}"),
                }
            }
        }
        self.notifier.realtime_update(record);
    }

    fn persist(&self, session: &Session, now: DateTime<Utc>) {
        let Some(key) = &session.key else {
            return;
        };
        let snapshot = CacheSnapshot {
            license_key: key.clone(),
            entitlement: session.entitlement.clone(),
            status: session.status,
            cached_at: now,
            last_online_validation: session.last_online_validation,
            machine_id: self.identity.bound_hash().to_string(),
        };
        if let Err(e) = self.cache.save(&snapshot) {
            warn!("Failed to save license cache: {e}");
        }
    }

    fn start_monitors(self: &Arc<Self>, epoch: u64, key: &str) {
        let mut slot = self.lock_monitors();
        if let Some(previous) = slot.take() {
            let _ = previous.shutdown.send(true);
        }
        if !self.config.realtime_enabled && !self.config.poll_enabled {
            return;
        }

        let (shutdown, rx) = watch::channel(false);
        let sink: Arc<dyn RevocationSink> = Arc::new(SessionSink {
            shared: Arc::downgrade(self),
            epoch,
        });
        let hash = self.identity.bound_hash().to_string();
        let mut tasks = Vec::with_capacity(2);

        if self.config.realtime_enabled {
            let channel = RealtimeChannel {
                endpoint: self.config.realtime_endpoint(),
                key: key.to_string(),
                machine_hash: hash.clone(),
                heartbeat: self.config.heartbeat_interval,
                backoff: self.config.reconnect_backoff,
                connect_timeout: self.config.request_timeout,
            };
            tasks.push(channel.spawn(sink.clone(), rx.clone()));
        }
        if self.config.poll_enabled {
            let poll = PollFallback {
                key: key.to_string(),
                machine_hash: hash,
                interval: self.config.poll_interval,
            };
            tasks.push(poll.spawn(self.authority.clone(), sink, rx));
        }

        info!("Monitoring license {}...", key_prefix(key));
        *slot = Some(Monitors { shutdown, tasks });
    }

    fn stop_monitors(&self) {
        if let Some(monitors) = self.lock_monitors().take() {
            let _ = monitors.shutdown.send(true);
            debug!("License monitors signalled to stop");
        }
    }
}

/// Routes monitor signals back into the session they were started for.
struct SessionSink {
    shared: Weak<Shared>,
    epoch: u64,
}

impl RevocationSink for SessionSink {
    fn revoke(&self, reason: DisableReason) {
        if let Some(shared) = self.shared.upgrade() {
            shared.disable(self.epoch, reason);
        }
    }

    fn changed(&self, record: &Value, active: bool) {
        if let Some(shared) = self.shared.upgrade() {
            shared.refresh(self.epoch, record, active);
        }
    }
}

fn normalize_key(key: &str) -> Option<String> {
    let key = key.trim().to_uppercase();
    (!key.is_empty()).then_some(key)
}
