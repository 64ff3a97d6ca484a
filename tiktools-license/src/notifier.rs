//! Callback fan-out to the host application.
//!
//! One slot per event kind; registering again replaces the previous
//! callback. Callbacks run on whichever task detected the event and a
//! panicking callback is logged and discarded.

use crate::status::{DisableReason, LicenseStatus};
use serde_json::Value;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::warn;

pub type StatusCallback = Arc<dyn Fn(LicenseStatus, LicenseStatus) + Send + Sync>;
pub type DisabledCallback = Arc<dyn Fn(&DisableReason) + Send + Sync>;
pub type UpdateCallback = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Default)]
pub struct EventNotifier {
    status_changed: RwLock<Option<StatusCallback>>,
    disabled: RwLock<Option<DisabledCallback>>,
    realtime_update: RwLock<Option<UpdateCallback>>,
}

impl EventNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the status-changed callback, receiving `(old, new)`.
    pub fn on_status_change<F>(&self, callback: F)
    where
        F: Fn(LicenseStatus, LicenseStatus) + Send + Sync + 'static,
    {
        let callback: StatusCallback = Arc::new(callback);
        set(&self.status_changed, callback);
    }

    /// Registers the disabled callback.
    pub fn on_license_disabled<F>(&self, callback: F)
    where
        F: Fn(&DisableReason) + Send + Sync + 'static,
    {
        let callback: DisabledCallback = Arc::new(callback);
        set(&self.disabled, callback);
    }

    /// Registers the realtime-update callback, receiving the raw record.
    pub fn on_realtime_update<F>(&self, callback: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let callback: UpdateCallback = Arc::new(callback);
        set(&self.realtime_update, callback);
    }

    pub fn status_changed(&self, old: LicenseStatus, new: LicenseStatus) {
        if let Some(callback) = get(&self.status_changed) {
            guarded("status_changed", || callback(old, new));
        }
    }

    pub fn disabled(&self, reason: &DisableReason) {
        if let Some(callback) = get(&self.disabled) {
            guarded("disabled", || callback(reason));
        }
    }

    pub fn realtime_update(&self, record: &Value) {
        if let Some(callback) = get(&self.realtime_update) {
            guarded("realtime_update", || callback(record));
        }
    }
}

impl std::fmt::Debug for EventNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventNotifier")
            .field("status_changed", &get(&self.status_changed).is_some())
            .field("disabled", &get(&self.disabled).is_some())
            .field("realtime_update", &get(&self.realtime_update).is_some())
            .finish()
    }
}

fn set<T: ?Sized>(slot: &RwLock<Option<Arc<T>>>, callback: Arc<T>) {
    *slot.write().unwrap_or_else(PoisonError::into_inner) = Some(callback);
}

// Clone the Arc out so the callback runs without the slot lock held and may
// re-register itself.
fn get<T: ?Sized>(slot: &RwLock<Option<Arc<T>>>) -> Option<Arc<T>> {
    slot.read().unwrap_or_else(PoisonError::into_inner).clone()
}

fn guarded(event: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!("License {event} callback panicked; ignored");
    }
}
