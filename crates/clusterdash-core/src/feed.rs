// ── Delta feed ──
//
// Bridges one subscription channel into one `EntityCollection`. A single
// supervisor task owns both: it opens the channel while the session is
// authenticated, decodes every inbound frame in arrival order, applies
// update batches, and routes replies back to whoever sent the matching
// `msg_id`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use clusterdash_api::{ChannelState, ControlMessage, DEFAULT_TIMEOUT, ReconnectConfig, SubscriptionChannel, TokenStore};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::auth::{AuthState, AuthStatus};
use crate::error::CoreError;
use crate::model::{Entity, Workload, WorkloadRegistration};
use crate::notice::Notifier;
use crate::store::{EntityCollection, UpdateBatch};
use crate::stream::{Snapshot, SnapshotStream};

const COMMAND_QUEUE_SIZE: usize = 64;

/// A decoded reply frame.
pub type Reply = Map<String, Value>;

type ReplySender = oneshot::Sender<Result<Reply, CoreError>>;

/// Where a feed connects and what it calls its entities on the wire.
#[derive(Debug, Clone)]
pub struct FeedTarget {
    /// Wire name used in batch fields and the resync op
    /// (`workloads` → `new_workloads`, `get_workloads`).
    pub resource: String,
    pub url: Url,
    pub reconnect: ReconnectConfig,
}

struct Shared<T> {
    resource: String,
    cancel: CancellationToken,
    _guard: DropGuard,
    snapshot: watch::Receiver<Snapshot<T>>,
    state: watch::Receiver<ChannelState>,
    commands: mpsc::Sender<(ControlMessage, ReplySender)>,
}

/// Handle to a live, reconciled collection. Cheaply cloneable; the task
/// and its socket go away with the last clone.
pub struct DeltaFeed<T: Entity> {
    shared: Arc<Shared<T>>,
}

impl<T: Entity> Clone for DeltaFeed<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// A feed handle that does not keep the socket open.
pub struct WeakDeltaFeed<T: Entity>(Weak<Shared<T>>);

impl<T: Entity> WeakDeltaFeed<T> {
    pub fn upgrade(&self) -> Option<DeltaFeed<T>> {
        let shared = self.0.upgrade()?;
        if shared.cancel.is_cancelled() {
            return None;
        }
        Some(DeltaFeed { shared })
    }
}

impl<T: Entity> DeltaFeed<T> {
    pub fn spawn(
        target: FeedTarget,
        tokens: TokenStore,
        auth: AuthState,
        notifier: Notifier,
        parent: &CancellationToken,
    ) -> Self {
        let cancel = parent.child_token();
        let collection = EntityCollection::new();
        let snapshot = collection.subscribe();
        let (state_tx, state_rx) = watch::channel(ChannelState::Closed);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let resource = target.resource.clone();

        let task = FeedTask {
            target,
            tokens,
            auth,
            notifier,
            collection,
            commands: command_rx,
            pending: HashMap::new(),
            state: state_tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(task.run());

        Self {
            shared: Arc::new(Shared {
                resource,
                cancel: cancel.clone(),
                _guard: cancel.drop_guard(),
                snapshot,
                state: state_rx,
                commands: command_tx,
            }),
        }
    }

    pub fn resource(&self) -> &str {
        &self.shared.resource
    }

    /// Current reconciled snapshot (cheap `Arc` clone).
    pub fn snapshot(&self) -> Snapshot<T> {
        self.shared.snapshot.borrow().clone()
    }

    pub fn get(&self, id: &str) -> Option<Arc<T>> {
        self.shared
            .snapshot
            .borrow()
            .iter()
            .find(|e| e.entity_id() == id)
            .map(Arc::clone)
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot<T>> {
        self.shared.snapshot.clone()
    }

    pub fn stream(&self) -> SnapshotStream<T> {
        SnapshotStream::new(self.shared.snapshot.clone())
    }

    pub fn channel_state(&self) -> ChannelState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.clone()
    }

    /// Ask the server for a full resync (`get_<resource>`) and wait until
    /// its reply has been applied.
    pub async fn refresh(&self) -> Result<(), CoreError> {
        let op = format!("get_{}", self.shared.resource);
        self.request(ControlMessage::new(op), DEFAULT_TIMEOUT).await?;
        Ok(())
    }

    /// Send a control message and wait for the reply carrying its `msg_id`.
    ///
    /// Error replies resolve to [`CoreError::Rejected`]. Batch data in an
    /// `OK` reply is applied before this returns.
    pub async fn request(&self, message: ControlMessage, timeout: Duration) -> Result<Reply, CoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared
            .commands
            .send((message, reply_tx))
            .await
            .map_err(|_| self.closed())?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.closed()),
            Err(_) => Err(CoreError::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakDeltaFeed<T> {
        WeakDeltaFeed(Arc::downgrade(&self.shared))
    }

    /// Close the socket and stop the task, even with other handles alive.
    pub fn shutdown(&self) {
        self.shared.cancel.cancel();
    }

    fn closed(&self) -> CoreError {
        CoreError::ResourceClosed {
            resource: self.shared.resource.clone(),
        }
    }
}

impl<T: Entity> fmt::Debug for DeltaFeed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeltaFeed")
            .field("resource", &self.shared.resource)
            .field("state", &*self.shared.state.borrow())
            .finish_non_exhaustive()
    }
}

// ── Workload operations ──────────────────────────────────────────────

impl DeltaFeed<Workload> {
    /// `start_workload`: begin running a registered workload.
    pub async fn start_workload(&self, workload_id: &str) -> Result<Reply, CoreError> {
        self.workload_op("start_workload", workload_id).await
    }

    /// `stop_workload`: stop one running workload.
    pub async fn stop_workload(&self, workload_id: &str) -> Result<Reply, CoreError> {
        self.workload_op("stop_workload", workload_id).await
    }

    /// `stop_workloads`: stop several workloads in one request.
    pub async fn stop_workloads(&self, workload_ids: &[&str]) -> Result<Reply, CoreError> {
        let message = ControlMessage::new("stop_workloads").with_field("workload_ids", workload_ids.to_vec());
        self.request(message, DEFAULT_TIMEOUT).await
    }

    /// `pause_workload` or `unpause_workload`.
    pub async fn set_paused(&self, workload_id: &str, paused: bool) -> Result<Reply, CoreError> {
        let op = if paused { "pause_workload" } else { "unpause_workload" };
        self.workload_op(op, workload_id).await
    }

    /// `register_workload`: create a workload from a preset. The new
    /// workload arrives in the reply's batch fields.
    pub async fn register_workload(&self, registration: &WorkloadRegistration) -> Result<Reply, CoreError> {
        let body = serde_json::to_value(registration)
            .map_err(|e| clusterdash_api::Error::decode(e, registration.name.clone()))?;
        let message = ControlMessage::new("register_workload").with_field("workload_registration_request", body);
        self.request(message, DEFAULT_TIMEOUT).await
    }

    /// `toggle_debug_logs`: switch debug-level logging for one workload.
    pub async fn toggle_debug_logs(&self, workload_id: &str, enabled: bool) -> Result<Reply, CoreError> {
        let message = ControlMessage::new("toggle_debug_logs")
            .with_field("workload_id", workload_id)
            .with_field("enabled", enabled);
        self.request(message, DEFAULT_TIMEOUT).await
    }

    async fn workload_op(&self, op: &str, workload_id: &str) -> Result<Reply, CoreError> {
        debug!(op, workload_id, "workload operation");
        let message = ControlMessage::new(op).with_field("workload_id", workload_id);
        self.request(message, DEFAULT_TIMEOUT).await
    }
}

// ── Supervisor task ──────────────────────────────────────────────────

struct FeedTask<T: Entity> {
    target: FeedTarget,
    tokens: TokenStore,
    auth: AuthState,
    notifier: Notifier,
    collection: EntityCollection<T>,
    commands: mpsc::Receiver<(ControlMessage, ReplySender)>,
    pending: HashMap<String, ReplySender>,
    state: watch::Sender<ChannelState>,
    cancel: CancellationToken,
}

/// Why a channel session ended.
enum SessionEnd {
    Shutdown,
    Deauthenticated,
    /// The channel gave up reconnecting.
    ChannelLost,
}

impl<T: Entity> FeedTask<T> {
    async fn run(mut self) {
        let resource = self.target.resource.clone();
        debug!(resource = %resource, "delta feed started");
        let mut auth_rx = self.auth.subscribe();

        loop {
            if !self.wait_for_auth(&mut auth_rx).await {
                break;
            }

            match self.session(&mut auth_rx).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Deauthenticated => {
                    info!(resource = %resource, "session ended, closing feed socket");
                    self.fail_pending(|| CoreError::NotAuthenticated);
                }
                SessionEnd::ChannelLost => {
                    error!(resource = %resource, "subscription channel gave up, reopening later");
                    self.fail_pending(|| CoreError::ConnectionFailed {
                        reason: "subscription channel closed".into(),
                    });
                    tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => break,
                        () = tokio::time::sleep(self.target.reconnect.max_delay) => {}
                    }
                }
            }
        }

        self.fail_pending(|| CoreError::Cancelled);
        self.state.send_replace(ChannelState::Closed);
        debug!(resource = %resource, "delta feed stopped");
    }

    /// Returns `false` on shutdown.
    async fn wait_for_auth(&mut self, auth_rx: &mut watch::Receiver<AuthStatus>) -> bool {
        loop {
            if *auth_rx.borrow_and_update() == AuthStatus::Authenticated {
                return true;
            }
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return false,
                changed = auth_rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                command = self.commands.recv() => {
                    let Some((_, reply)) = command else { return false };
                    let _ = reply.send(Err(CoreError::NotAuthenticated));
                }
            }
        }
    }

    /// Run one channel from open until deauthentication, shutdown, or loss.
    async fn session(&mut self, auth_rx: &mut watch::Receiver<AuthStatus>) -> SessionEnd {
        let (channel, mut frames) = SubscriptionChannel::open(
            self.target.url.clone(),
            ControlMessage::new("subscribe"),
            self.target.reconnect.clone(),
            self.tokens.clone(),
            &self.cancel,
        );
        let mut channel_state = channel.subscribe_state();
        let mut state_live = true;

        let end = loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break SessionEnd::Shutdown,
                changed = auth_rx.changed() => {
                    if changed.is_err() {
                        break SessionEnd::Shutdown;
                    }
                    if *auth_rx.borrow_and_update() == AuthStatus::Unauthenticated {
                        break SessionEnd::Deauthenticated;
                    }
                }
                changed = channel_state.changed(), if state_live => {
                    if changed.is_ok() {
                        let state = *channel_state.borrow_and_update();
                        self.state.send_replace(state);
                    } else {
                        state_live = false;
                    }
                }
                frame = frames.recv() => match frame {
                    Some(text) => self.handle_frame(&text),
                    None if self.cancel.is_cancelled() => break SessionEnd::Shutdown,
                    None => break SessionEnd::ChannelLost,
                },
                command = self.commands.recv() => {
                    let Some((message, reply)) = command else { break SessionEnd::Shutdown };
                    self.dispatch(&channel, message, reply);
                }
            }
        };

        channel.close();
        self.state.send_replace(ChannelState::Closed);
        end
    }

    fn dispatch(&mut self, channel: &SubscriptionChannel, message: ControlMessage, reply: ReplySender) {
        // Forget requests whose callers stopped waiting.
        self.pending.retain(|_, waiting| !waiting.is_closed());

        let msg_id = message.msg_id.clone();
        match channel.send(message) {
            Ok(()) => {
                self.pending.insert(msg_id, reply);
            }
            Err(e) => {
                let _ = reply.send(Err(e.into()));
            }
        }
    }

    /// Decode, correlate, and apply one inbound frame. Never fails: bad
    /// frames are logged, surfaced as a notice, and dropped.
    fn handle_frame(&mut self, text: &str) {
        let resource = self.target.resource.as_str();
        let frame = match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(frame)) => frame,
            Ok(_) => {
                self.malformed("frame is not a JSON object", text);
                return;
            }
            Err(e) => {
                self.malformed(&e.to_string(), text);
                return;
            }
        };

        let waiting = frame
            .get("msg_id")
            .and_then(Value::as_str)
            .and_then(|id| self.pending.remove(id));

        if let Some(rejection) = rejection(&frame) {
            warn!(resource, msg_id = ?frame.get("msg_id"), error = %rejection, "server rejected request");
            if let CoreError::Rejected { message, .. } = &rejection {
                self.notifier.error(format!("Request on {resource} failed"), message.clone());
            }
            if let Some(waiting) = waiting {
                let _ = waiting.send(Err(rejection));
            }
            return;
        }

        match UpdateBatch::<T>::from_frame(resource, &frame) {
            Ok(Some(batch)) => {
                let stats = self.collection.apply(batch);
                debug!(resource, len = self.collection.len(), removed = stats.removed, "update batch applied");
            }
            Ok(None) => trace!(resource, "frame carried no update batch"),
            Err(e) => {
                self.malformed(&e.to_string(), text);
                if let Some(waiting) = waiting {
                    let _ = waiting.send(Err(e.into()));
                }
                return;
            }
        }

        if let Some(waiting) = waiting {
            let _ = waiting.send(Ok(frame));
        }
    }

    fn malformed(&self, reason: &str, text: &str) {
        let resource = &self.target.resource;
        warn!(resource = %resource, reason, len = text.len(), "dropping malformed frame");
        self.notifier
            .warning(format!("Malformed {resource} update"), reason.to_owned());
    }

    fn fail_pending(&mut self, err: impl Fn() -> CoreError) {
        for (_, waiting) in self.pending.drain() {
            let _ = waiting.send(Err(err()));
        }
    }
}

/// An error reply: `status` other than `"OK"`, or an `ErrorMessage` field.
fn rejection(frame: &Map<String, Value>) -> Option<CoreError> {
    let status = frame.get("status").and_then(Value::as_str);
    let message = frame.get("ErrorMessage").and_then(Value::as_str);
    if status.is_none_or(|s| s == "OK") && message.is_none() {
        return None;
    }

    Some(CoreError::Rejected {
        message: message
            .map(str::to_owned)
            .or_else(|| status.map(|s| format!("status {s}")))
            .unwrap_or_default(),
        description: frame
            .get("Description")
            .and_then(Value::as_str)
            .filter(|d| !d.is_empty())
            .map(str::to_owned),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn ok_replies_are_not_rejections() {
        assert!(rejection(&object(json!({"msg_id": "1", "status": "OK"}))).is_none());
        assert!(rejection(&object(json!({"new_workloads": []}))).is_none());
    }

    #[test]
    fn error_replies_carry_message_and_description() {
        let err = rejection(&object(json!({
            "msg_id": "1",
            "status": "ERROR",
            "ErrorMessage": "workload not found",
            "Description": "stop_workload failed"
        })))
        .unwrap();

        match err {
            CoreError::Rejected { message, description } => {
                assert_eq!(message, "workload not found");
                assert_eq!(description.as_deref(), Some("stop_workload failed"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bare_error_status_is_a_rejection() {
        let err = rejection(&object(json!({"status": "ERROR", "Description": ""}))).unwrap();
        assert!(matches!(
            err,
            CoreError::Rejected { ref message, description: None } if message == "status ERROR"
        ));
    }
}
