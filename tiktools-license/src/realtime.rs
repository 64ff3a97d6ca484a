//! Push-based revocation over the authority's realtime websocket.
//!
//! One connection per monitored key, speaking Phoenix channel framing: a
//! `phx_join` on `realtime:public:licenses:key=eq.<KEY>`, a `heartbeat` on the
//! `phoenix` topic every heartbeat interval, and `UPDATE`/`DELETE` change
//! events in return. Dropped connections are retried after a fixed backoff
//! until shutdown.

use crate::status::DisableReason;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at, sleep, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Receives what the background monitors detect.
pub trait RevocationSink: Send + Sync {
    /// The license must be disabled for `reason`.
    fn revoke(&self, reason: DisableReason);

    /// A non-revoking change to the monitored row. `active` is the row's
    /// new `active` value.
    fn changed(&self, record: &Value, active: bool);
}

/// Change-feed topic for a license key.
pub fn topic_for(key: &str) -> String {
    format!("realtime:public:licenses:key=eq.{key}")
}

pub(crate) fn join_frame(topic: &str, msg_ref: u64) -> Value {
    json!({
        "topic": topic,
        "event": "phx_join",
        "payload": {"config": {"broadcast": {"self": false}, "presence": {"key": ""}}},
        "ref": msg_ref.to_string(),
    })
}

pub(crate) fn heartbeat_frame(msg_ref: u64) -> Value {
    json!({
        "topic": "phoenix",
        "event": "heartbeat",
        "payload": {},
        "ref": msg_ref.to_string(),
    })
}

#[derive(Debug, Deserialize)]
struct InboundFrame {
    #[serde(default)]
    topic: String,
    #[serde(default)]
    event: String,
    #[serde(default)]
    payload: Value,
}

/// The columns of a changed row that decide revocation.
#[derive(Debug, Default, Deserialize)]
struct ChangedRow {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    active: Option<bool>,
    #[serde(default)]
    bound_machines: Option<Vec<String>>,
}

impl ChangedRow {
    fn from_payload(payload: &Value, field: &str) -> Self {
        payload
            .get(field)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }
}

/// What an inbound frame means for the monitored key.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Unrelated, malformed or control traffic.
    Ignored,
    /// The row was updated. `revocation` is set when the update disables
    /// this machine.
    Updated {
        record: Value,
        active: bool,
        revocation: Option<DisableReason>,
    },
    /// The row was deleted.
    Deleted,
    /// The server closed or errored our channel.
    ChannelError(String),
}

/// Classifies one text frame for `key` as seen by `machine_hash`.
pub fn classify(text: &str, key: &str, machine_hash: &str) -> ChannelEvent {
    let Ok(frame) = serde_json::from_str::<InboundFrame>(text) else {
        return ChannelEvent::Ignored;
    };

    match frame.event.as_str() {
        "UPDATE" => {
            let new = ChangedRow::from_payload(&frame.payload, "record");
            if new.key.as_deref() != Some(key) {
                return ChannelEvent::Ignored;
            }
            let old = ChangedRow::from_payload(&frame.payload, "old_record");

            let was_active = old.active.unwrap_or(true);
            let is_active = new.active.unwrap_or(true);
            let new_machines = new.bound_machines.unwrap_or_default();
            let was_bound = old
                .bound_machines
                .is_none_or(|machines| machines.iter().any(|m| m == machine_hash));
            let is_bound = new_machines.iter().any(|m| m == machine_hash);

            let revocation = if was_active && !is_active {
                Some(DisableReason::LicenseDisabled)
            } else if was_bound && !is_bound {
                Some(DisableReason::MachineRemoved)
            } else {
                None
            };

            ChannelEvent::Updated {
                record: frame.payload.get("record").cloned().unwrap_or(Value::Null),
                active: is_active,
                revocation,
            }
        }
        "DELETE" => {
            let old = ChangedRow::from_payload(&frame.payload, "old_record");
            if old.key.as_deref() == Some(key) {
                ChannelEvent::Deleted
            } else {
                ChannelEvent::Ignored
            }
        }
        "phx_error" | "phx_close" if frame.topic == topic_for(key) => {
            ChannelEvent::ChannelError(frame.event.clone())
        }
        _ => ChannelEvent::Ignored,
    }
}

/// Resolves once shutdown is requested or the sender is gone.
pub(crate) async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

enum SessionEnd {
    Shutdown,
    Revoked,
    Dropped(String),
}

/// A realtime subscription for one key.
#[derive(Debug, Clone)]
pub struct RealtimeChannel {
    pub endpoint: String,
    pub key: String,
    pub machine_hash: String,
    pub heartbeat: Duration,
    pub backoff: Duration,
    pub connect_timeout: Duration,
}

impl RealtimeChannel {
    /// Runs the channel on the current runtime until `shutdown` flips or
    /// a revocation is delivered.
    pub fn spawn(
        self,
        sink: Arc<dyn RevocationSink>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(sink, shutdown))
    }

    async fn run(self, sink: Arc<dyn RevocationSink>, mut shutdown: watch::Receiver<bool>) {
        let prefix = key_prefix(&self.key);
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.session(sink.as_ref(), &mut shutdown).await {
                SessionEnd::Shutdown | SessionEnd::Revoked => break,
                SessionEnd::Dropped(reason) => {
                    warn!("Realtime connection for {prefix}... lost: {reason}");
                }
            }
            tokio::select! {
                _ = stop_requested(&mut shutdown) => break,
                _ = sleep(self.backoff) => {}
            }
            debug!("Realtime reconnecting for {prefix}...");
        }
        debug!("Realtime channel for {prefix}... stopped");
    }

    async fn session(
        &self,
        sink: &dyn RevocationSink,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let connect = timeout(self.connect_timeout, connect_async(self.endpoint.as_str()));
        let ws = tokio::select! {
            _ = stop_requested(shutdown) => return SessionEnd::Shutdown,
            result = connect => match result {
                Ok(Ok((ws, _))) => ws,
                Ok(Err(e)) => return SessionEnd::Dropped(e.to_string()),
                Err(_) => return SessionEnd::Dropped("connect timed out".to_string()),
            },
        };

        let (mut write, mut read) = ws.split();
        let topic = topic_for(&self.key);
        let mut next_ref = 1u64;

        let join = join_frame(&topic, next_ref);
        next_ref += 1;
        if let Err(e) = write.send(Message::Text(join.to_string().into())).await {
            return SessionEnd::Dropped(e.to_string());
        }
        info!("Realtime subscribed to {}...", key_prefix(&self.key));

        let mut heartbeat = interval_at(Instant::now() + self.heartbeat, self.heartbeat);

        loop {
            tokio::select! {
                _ = stop_requested(shutdown) => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
                _ = heartbeat.tick() => {
                    let frame = heartbeat_frame(next_ref);
                    next_ref += 1;
                    if let Err(e) = write.send(Message::Text(frame.to_string().into())).await {
                        return SessionEnd::Dropped(e.to_string());
                    }
                }
                next = read.next() => {
                    let text = match next {
                        None => return SessionEnd::Dropped("connection closed".to_string()),
                        Some(Err(e)) => return SessionEnd::Dropped(e.to_string()),
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) => {
                            return SessionEnd::Dropped("closed by server".to_string());
                        }
                        Some(Ok(_)) => continue,
                    };

                    match classify(text.as_str(), &self.key, &self.machine_hash) {
                        ChannelEvent::Ignored => {}
                        ChannelEvent::Updated { record, active, revocation } => {
                            if let Some(reason) = revocation {
                                warn!("Realtime revocation: {reason}");
                                sink.revoke(reason);
                                return SessionEnd::Revoked;
                            }
                            sink.changed(&record, active);
                        }
                        ChannelEvent::Deleted => {
                            warn!("Realtime: license deleted");
                            sink.revoke(DisableReason::LicenseDeleted);
                            return SessionEnd::Revoked;
                        }
                        ChannelEvent::ChannelError(event) => {
                            return SessionEnd::Dropped(format!("channel {event}"));
                        }
                    }
                }
            }
        }
    }
}

/// The first eight characters of a key, for logs.
pub(crate) fn key_prefix(key: &str) -> &str {
    key.char_indices().nth(8).map_or(key, |(i, _)| &key[..i])
}
