//! Pull-based safety net next to the realtime channel.

use crate::authority::Authority;
use crate::error::AuthorityResult;
use crate::realtime::{RevocationSink, key_prefix, stop_requested};
use crate::status::DisableReason;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, warn};

/// Read-only re-check of a bound license: ban, existence, active flag and
/// binding, in that order. Never mutates the authority.
pub async fn check_license(
    authority: &dyn Authority,
    key: &str,
    machine_hash: &str,
) -> AuthorityResult<Option<DisableReason>> {
    if let Some(user) = authority.fetch_user(machine_hash).await? {
        if user.is_banned() {
            return Ok(Some(DisableReason::Banned(user.ban_reason)));
        }
    }

    let Some(license) = authority.fetch_license(key).await? else {
        return Ok(Some(DisableReason::LicenseDeleted));
    };
    if !license.active {
        return Ok(Some(DisableReason::LicenseDisabled));
    }
    if !license.is_bound(machine_hash) {
        return Ok(Some(DisableReason::MachineRemoved));
    }
    Ok(None)
}

/// Periodic [`check_license`] for one key.
#[derive(Debug, Clone)]
pub struct PollFallback {
    pub key: String,
    pub machine_hash: String,
    pub interval: Duration,
}

impl PollFallback {
    pub fn spawn(
        self,
        authority: Arc<dyn Authority>,
        sink: Arc<dyn RevocationSink>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(authority, sink, shutdown))
    }

    async fn run(
        self,
        authority: Arc<dyn Authority>,
        sink: Arc<dyn RevocationSink>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let prefix = key_prefix(&self.key);
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop_requested(&mut shutdown) => break,
                _ = ticker.tick() => {}
            }

            debug!("Polling license {prefix}...");
            match check_license(authority.as_ref(), &self.key, &self.machine_hash).await {
                Ok(None) => {}
                Ok(Some(reason)) => {
                    warn!("Poll revocation: {reason}");
                    sink.revoke(reason);
                    break;
                }
                // a blip must never disable on its own
                Err(e) => debug!("License poll failed, ignoring: {e}"),
            }
        }
        debug!("License poll for {prefix}... stopped");
    }
}
