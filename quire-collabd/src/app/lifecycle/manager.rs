use super::frames::{AuthError, LifecycleError, ServerFrame};
use crate::app::envelope::{classify, filter_inbound, filter_outbound, Envelope, FilterContext};
use crate::app::holds::HoldService;
use crate::app::operations::OperationService;
use crate::app::reclamation::{ProjectTracker, TrackedProject};
use crate::app::timers::{TimerKind, TimerRegistry};
use crate::domain::connection::{
    Connection, ConnectionEventEnvelope, ConnectionId, ConnectionStatus,
};
use crate::domain::operation::{Operation, OperationKind};
use crate::domain::session::{ProjectId, SocketId, Uid};
use crate::ports::auth::{AuthRequest, Authenticator};
use crate::ports::bus::{BusEnvelope, BusPayload, MessageBus};
use crate::ports::store::{HoldStore, OperationStore, ProjectActivityStore};
use crate::telemetry::CollabMetrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};

const TOOL_START: &str = "start";
const TOOL_END: &str = "end";
const DEFAULT_CANCEL_MODE: &str = "mode";

#[derive(Clone, Debug)]
pub struct LifecycleSettings {
    pub auth_timeout: Duration,
    pub disconnect_timeout: Duration,
    pub message_timeout: Duration,
    pub health_check_timeout: Duration,
    pub tool_operation_timeout: Duration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(30),
            message_timeout: Duration::from_secs(15 * 60),
            health_check_timeout: Duration::from_secs(10),
            tool_operation_timeout: Duration::from_secs(30),
        }
    }
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

struct ConnectionEntry {
    connection: Connection,
    outbound: mpsc::UnboundedSender<ServerFrame>,
    /// In-flight tool operations keyed by operation id.
    tool_operations: HashMap<String, Operation>,
    /// Transport is gone; the disconnect timer decides the rest.
    departed: bool,
}

impl ConnectionEntry {
    fn filter_context(&self) -> FilterContext {
        FilterContext {
            status: self.connection.status(),
            pending: self.connection.auth_pending(),
            has_uid: self.connection.uid().is_some(),
        }
    }

    fn is_live_member(&self, uid: &Uid) -> bool {
        !self.departed && self.connection.uid().is_some_and(|own| own.same_member(uid))
    }
}

/// Owns every local connection: handshake, frame dispatch, fan-out and teardown.
pub struct ConnectionManager<S>
where
    S: OperationStore + HoldStore + ProjectActivityStore + 'static,
{
    settings: LifecycleSettings,
    store: Arc<S>,
    operations: OperationService<S>,
    holds: HoldService<S>,
    bus: Arc<dyn MessageBus>,
    authenticator: Arc<dyn Authenticator>,
    timers: TimerRegistry,
    connections: RwLock<HashMap<ConnectionId, ConnectionEntry>>,
    metrics: Option<Arc<CollabMetrics>>,
    me: Weak<Self>,
}

impl<S> ConnectionManager<S>
where
    S: OperationStore + HoldStore + ProjectActivityStore + 'static,
{
    pub fn new(
        settings: LifecycleSettings,
        store: Arc<S>,
        bus: Arc<dyn MessageBus>,
        authenticator: Arc<dyn Authenticator>,
        metrics: Option<Arc<CollabMetrics>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            settings,
            operations: OperationService::new(Arc::clone(&store), metrics.clone()),
            holds: HoldService::new(Arc::clone(&store), metrics.clone()),
            store,
            bus,
            authenticator,
            timers: TimerRegistry::new(),
            connections: RwLock::new(HashMap::new()),
            metrics,
            me: me.clone(),
        })
    }

    pub fn operations(&self) -> &OperationService<S> {
        &self.operations
    }

    pub fn holds(&self) -> &HoldService<S> {
        &self.holds
    }

    /// Registers a fresh transport and arms its auth timer.
    pub async fn accept(&self) -> (ConnectionId, mpsc::UnboundedReceiver<ServerFrame>) {
        let connection = Connection::new(SocketId::generate());
        let id = connection.id();
        let (outbound, receiver) = mpsc::unbounded_channel();
        self.connections.write().await.insert(
            id,
            ConnectionEntry {
                connection,
                outbound,
                tool_operations: HashMap::new(),
                departed: false,
            },
        );
        self.start_close_timer(id, TimerKind::Auth, self.settings.auth_timeout, "auth timeout");
        debug!(connection = %id, "connection accepted");
        (id, receiver)
    }

    /// Entry point for every inbound text frame.
    pub async fn handle_text(&self, id: ConnectionId, text: &str) -> LifecycleResult<()> {
        let body = match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(body)) => body,
            Ok(_) => {
                warn!(connection = %id, "dropping non-object frame");
                self.record_rejected("not_an_object");
                return Ok(());
            }
            Err(err) => {
                warn!(connection = %id, %err, "dropping malformed frame");
                self.record_rejected("malformed_json");
                return Ok(());
            }
        };
        if body.is_empty() {
            self.touch(id).await;
            return Ok(());
        }

        let envelope = match classify(&body) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(connection = %id, %err, "dropping invalid frame");
                self.record_rejected("wrong_input_message");
                return Ok(());
            }
        };
        let Some(ctx) = self.filter_context(id).await else {
            debug!(connection = %id, "frame for unknown connection dropped");
            return Ok(());
        };
        let Some(envelope) = filter_inbound(ctx, envelope) else {
            debug!(connection = %id, ?ctx, "frame filtered out");
            return Ok(());
        };

        self.touch(id).await;
        if ctx.has_uid {
            self.restart_message_timer(id);
        }
        match envelope {
            Envelope::KeepAlive => Ok(()),
            Envelope::Auth(body) => self.handle_auth(id, body).await,
            Envelope::Destroy { auxiliary, .. } => self.handle_destroy(id, auxiliary).await,
            Envelope::Operations(operations) => self.handle_operations(id, operations).await,
        }
    }

    async fn handle_auth(&self, id: ConnectionId, body: Map<String, Value>) -> LifecycleResult<()> {
        self.timers.stop(id, &TimerKind::Auth);
        let socket_id = {
            let mut connections = self.connections.write().await;
            let entry = connections
                .get_mut(&id)
                .ok_or(LifecycleError::UnknownConnection(id))?;
            let event = entry
                .connection
                .begin_auth()
                .map_err(AuthError::Transition)?;
            self.record_event(&event);
            entry.connection.socket_id().clone()
        };

        let request: AuthRequest = match serde_json::from_value(Value::Object(body)) {
            Ok(request) => request,
            Err(err) => {
                self.abort_auth(id).await;
                return Err(AuthError::Malformed(err.to_string()).into());
            }
        };
        let uid = match self.authenticator.authorize(&request, &socket_id).await {
            Ok(Some(uid)) => uid,
            Ok(None) => return self.reject(id).await,
            Err(err) => {
                self.abort_auth(id).await;
                return Err(AuthError::Collaborator(err.to_string()).into());
            }
        };

        let status = {
            let mut connections = self.connections.write().await;
            let entry = connections
                .get_mut(&id)
                .ok_or(LifecycleError::UnknownConnection(id))?;
            match entry.connection.authorize(uid.clone()) {
                Ok(event) => {
                    self.record_event(&event);
                    entry.connection.status()
                }
                Err(reason) => {
                    drop(connections);
                    self.abort_auth(id).await;
                    return Err(AuthError::Transition(reason).into());
                }
            }
        };

        self.reclaim_departed(id, &uid).await;
        let auth = json!({
            "uid": uid.to_string(),
            "userId": uid.user_id(),
            "projectId": uid.project_id(),
            "status": "authorized",
        });
        self.send_json(id, &json!({ "auth": auth.clone() })).await;
        self.restart_message_timer(id);
        info!(connection = %id, %uid, "connection authorized");

        self.publish(BusEnvelope::new(uid.clone(), BusPayload::Auth(auth), status))
            .await?;
        self.send_snapshot(id, &uid, &request).await
    }

    /// Sends what the client is missing: the full session on first join, or
    /// the project log after `lastIndex` on resume.
    async fn send_snapshot(
        &self,
        id: ConnectionId,
        uid: &Uid,
        request: &AuthRequest,
    ) -> LifecycleResult<()> {
        let operations = match request.extra.get("lastIndex").and_then(Value::as_u64) {
            Some(last_seen) => self.operations.missing(uid, last_seen).await?,
            None => self.operations.all_operations(uid).await?,
        };
        if !operations.is_empty() {
            self.send_payload(id, &BusPayload::Operations(operations))
                .await;
        }
        Ok(())
    }

    async fn abort_auth(&self, id: ConnectionId) {
        if let Some(entry) = self.connections.write().await.get_mut(&id) {
            match entry.connection.fail_auth() {
                Ok(event) => self.record_event(&event),
                Err(reason) => debug!(connection = %id, %reason, "auth abort ignored"),
            }
        }
        self.start_close_timer(id, TimerKind::Auth, self.settings.auth_timeout, "auth timeout");
    }

    async fn reject(&self, id: ConnectionId) -> LifecycleResult<()> {
        if let Some(entry) = self.connections.write().await.get_mut(&id) {
            match entry.connection.destroy("unauthorized") {
                Ok(event) => self.record_event(&event),
                Err(reason) => debug!(connection = %id, %reason, "reject on destroyed connection"),
            }
        }
        info!(connection = %id, "authorization rejected");
        self.send_json(id, &json!({ "destroy": { "reason": "unauthorized" } }))
            .await;
        self.send(id, ServerFrame::Close).await;
        Ok(())
    }

    /// Drops departed connections of the same member without releasing holds.
    async fn reclaim_departed(&self, id: ConnectionId, uid: &Uid) {
        let reclaimed: Vec<(ConnectionId, Option<Uid>, HashMap<String, Operation>)> = {
            let mut connections = self.connections.write().await;
            let ids: Vec<ConnectionId> = connections
                .iter()
                .filter(|(other, entry)| {
                    **other != id
                        && entry.departed
                        && entry.connection.uid().is_some_and(|own| own.same_member(uid))
                })
                .map(|(other, _)| *other)
                .collect();
            ids.into_iter()
                .filter_map(|other| {
                    connections.remove(&other).map(|entry| {
                        (other, entry.connection.uid().cloned(), entry.tool_operations)
                    })
                })
                .collect()
        };
        for (other, old_uid, tool_operations) in reclaimed {
            self.timers.stop_all(other);
            if let Some(old_uid) = old_uid {
                self.flush_tool_operations(other, &old_uid, tool_operations).await;
                if let Err(err) = self.operations.clear_client(&old_uid).await {
                    warn!(connection = %other, %err, "failed to clear reclaimed client session");
                }
            }
            info!(connection = %other, replaced_by = %id, "departed connection reclaimed");
        }
    }

    async fn handle_destroy(
        &self,
        id: ConnectionId,
        auxiliary: Map<String, Value>,
    ) -> LifecycleResult<()> {
        let (uid, tool_operations) = {
            let mut connections = self.connections.write().await;
            let entry = connections
                .get_mut(&id)
                .ok_or(LifecycleError::UnknownConnection(id))?;
            let event = entry
                .connection
                .destroy("client request")
                .map_err(LifecycleError::State)?;
            self.record_event(&event);
            (
                entry.connection.uid().cloned(),
                std::mem::take(&mut entry.tool_operations),
            )
        };

        if let Some(uid) = &uid {
            self.flush_tool_operations(id, uid, tool_operations).await;
            let persisted = auxiliary
                .get("params")
                .and_then(|params| params.get("persisted"))
                .and_then(Value::as_u64);
            if let Some(index) = persisted {
                self.store
                    .acknowledge_persisted(uid.project_id(), index)
                    .await
                    .map_err(|e| LifecycleError::Store(e.to_string()))?;
            }
        }

        self.send(id, ServerFrame::Close).await;
        self.evict(id, "destroy").await.map(|_| ())
    }

    async fn handle_operations(
        &self,
        id: ConnectionId,
        operations: Vec<Operation>,
    ) -> LifecycleResult<()> {
        let uid = {
            let connections = self.connections.read().await;
            connections
                .get(&id)
                .ok_or(LifecycleError::UnknownConnection(id))?
                .connection
                .uid()
                .cloned()
        };
        let Some(uid) = uid else {
            debug!(connection = %id, dropped = operations.len(), "operations before authorization dropped");
            return Ok(());
        };

        let status = {
            let mut connections = self.connections.write().await;
            let entry = connections
                .get_mut(&id)
                .ok_or(LifecycleError::UnknownConnection(id))?;
            let event = entry
                .connection
                .enter_operations()
                .map_err(LifecycleError::State)?;
            if let Some(event) = event {
                self.record_event(&event);
            }
            entry.connection.status()
        };

        let mut processed = Vec::with_capacity(operations.len());
        let mut failure = None;
        for operation in operations {
            match self.apply_operation(id, &uid, operation).await {
                Ok(mut results) => processed.append(&mut results),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        if !processed.is_empty() {
            self.publish(BusEnvelope::new(
                uid,
                BusPayload::Operations(processed),
                status,
            ))
            .await?;
        }
        failure.map_or(Ok(()), Err)
    }

    async fn apply_operation(
        &self,
        id: ConnectionId,
        uid: &Uid,
        operation: Operation,
    ) -> LifecycleResult<Vec<Operation>> {
        let tool_key = operation.id().map(ToString::to_string);
        let starts_tool = operation.sub_type() == Some(TOOL_START);

        let results = match operation.kind() {
            OperationKind::Hold | OperationKind::Users => vec![self.holds.handle(uid, operation).await?],
            OperationKind::Cancel => {
                let mode = operation
                    .property("mode")
                    .and_then(Value::as_str)
                    .unwrap_or(DEFAULT_CANCEL_MODE)
                    .to_string();
                let outcome = self
                    .operations
                    .cancel_operations(uid, operation.id().cloned(), &mode)
                    .await?;
                let removed: Vec<Value> = outcome
                    .removed
                    .iter()
                    .filter_map(|op| op.index)
                    .map(Value::from)
                    .collect();
                self.send_payload(id, &BusPayload::Operations(outcome.operations))
                    .await;
                let mut notice = operation;
                notice.set_property("removed", Value::Array(removed));
                vec![notice]
            }
            _ => vec![self.operations.save_operation(uid, operation).await?],
        };

        if let Some(key) = tool_key {
            match (starts_tool, results.first()) {
                (true, Some(saved)) => self.open_tool_operation(id, key, saved.clone()).await,
                _ => self.acknowledge_tool_operation(id, key).await,
            }
        }
        Ok(results)
    }

    async fn open_tool_operation(&self, id: ConnectionId, key: String, start: Operation) {
        if let Some(entry) = self.connections.write().await.get_mut(&id) {
            entry.tool_operations.insert(key.clone(), start);
        }
        let manager = self.me.clone();
        let timer_key = key.clone();
        self.timers.start(
            id,
            TimerKind::ToolOperation(key),
            self.settings.tool_operation_timeout,
            async move {
                if let Some(manager) = manager.upgrade() {
                    if let Err(err) = manager.force_complete(id, &timer_key).await {
                        warn!(connection = %id, operation = %timer_key, %err, "tool operation force-complete failed");
                    }
                }
            },
        );
    }

    async fn acknowledge_tool_operation(&self, id: ConnectionId, key: String) {
        let acknowledged = self
            .connections
            .write()
            .await
            .get_mut(&id)
            .is_some_and(|entry| entry.tool_operations.remove(&key).is_some());
        if acknowledged {
            self.timers.stop(id, &TimerKind::ToolOperation(key));
        }
    }

    async fn force_complete(&self, id: ConnectionId, key: &str) -> LifecycleResult<()> {
        let pending = {
            let mut connections = self.connections.write().await;
            connections.get_mut(&id).and_then(|entry| {
                let start = entry.tool_operations.remove(key)?;
                entry.connection.uid().cloned().map(|uid| (uid, start))
            })
        };
        match pending {
            Some((uid, start)) => {
                warn!(connection = %id, operation = key, "tool operation not acknowledged in time");
                self.complete_tool_operation(&uid, start).await
            }
            None => Ok(()),
        }
    }

    /// Force-completes every tool operation a connection left open.
    async fn flush_tool_operations(
        &self,
        id: ConnectionId,
        uid: &Uid,
        pending: HashMap<String, Operation>,
    ) {
        for (key, start) in pending {
            self.timers.stop(id, &TimerKind::ToolOperation(key.clone()));
            if let Err(err) = self.complete_tool_operation(uid, start).await {
                warn!(connection = %id, operation = %key, %err, "failed to flush tool operation");
            }
        }
    }

    /// Saves and broadcasts a forced `end` for an unacknowledged tool operation.
    async fn complete_tool_operation(&self, uid: &Uid, start: Operation) -> LifecycleResult<()> {
        let mut closing = start
            .with_sub_type(TOOL_END)
            .with_property("forced", json!(true));
        closing.index = None;
        closing.timestamp = None;
        let saved = self.operations.save_operation(uid, closing).await?;
        self.publish(BusEnvelope::new(
            uid.clone(),
            BusPayload::Operations(vec![saved]),
            Some(ConnectionStatus::Operations),
        ))
        .await
    }

    /// Transport closed: authorized connections get a grace period, the rest
    /// are forgotten immediately.
    pub async fn on_close(&self, id: ConnectionId) {
        self.timers.stop_all(id);
        let grace = {
            let mut connections = self.connections.write().await;
            let Some(entry) = connections.get_mut(&id) else {
                return;
            };
            let keep = entry.connection.uid().is_some()
                && !matches!(entry.connection.status(), Some(ConnectionStatus::Destroy));
            entry.departed = keep;
            keep
        };

        if grace {
            let manager = self.me.clone();
            self.timers.start(
                id,
                TimerKind::Disconnect,
                self.settings.disconnect_timeout,
                async move {
                    if let Some(manager) = manager.upgrade() {
                        if let Err(err) = manager.evict(id, "disconnect timeout").await {
                            warn!(connection = %id, %err, "eviction after disconnect failed");
                        }
                    }
                },
            );
            debug!(connection = %id, "connection departed; grace period started");
        } else if let Err(err) = self.evict(id, "closed").await {
            warn!(connection = %id, %err, "eviction after close failed");
        }
    }

    /// Forgets the connection and tears down its session state. Returns
    /// `false` when the connection was already gone.
    pub async fn evict(&self, id: ConnectionId, reason: &str) -> LifecycleResult<bool> {
        self.timers.stop_all(id);
        let Some(entry) = self.connections.write().await.remove(&id) else {
            return Ok(false);
        };
        let _ = entry.outbound.send(ServerFrame::Close);
        if let Some(metrics) = &self.metrics {
            metrics.record_eviction(reason);
        }
        let Some(uid) = entry.connection.uid().cloned() else {
            debug!(connection = %id, reason, "unauthorized connection forgotten");
            return Ok(true);
        };

        self.flush_tool_operations(id, &uid, entry.tool_operations).await;
        self.operations.clear_client(&uid).await?;
        let member_still_live = self
            .connections
            .read()
            .await
            .values()
            .any(|other| other.is_live_member(&uid));
        if !member_still_live {
            let released = self
                .holds
                .release_user(uid.project_id(), uid.user_id())
                .await?;
            debug!(%uid, released, "holds released");
        }

        self.publish(BusEnvelope::new(
            uid.clone(),
            BusPayload::Destroy(json!({
                "uid": uid.to_string(),
                "userId": uid.user_id(),
                "reason": reason,
            })),
            Some(ConnectionStatus::Destroy),
        ))
        .await?;
        info!(connection = %id, %uid, reason, "connection evicted");
        Ok(true)
    }

    /// Evicts every local connection of an idle project and drops its holds.
    pub async fn evict_project(&self, project: &ProjectId) -> usize {
        let ids: Vec<ConnectionId> = self
            .connections
            .read()
            .await
            .iter()
            .filter(|(_, entry)| {
                entry
                    .connection
                    .uid()
                    .is_some_and(|uid| uid.project_id() == project)
            })
            .map(|(id, _)| *id)
            .collect();
        let mut evicted = 0;
        for id in ids {
            match self.evict(id, "idle project").await {
                Ok(true) => evicted += 1,
                Ok(false) => {}
                Err(err) => warn!(connection = %id, %err, "idle eviction failed"),
            }
        }
        if let Err(err) = self.holds.release_project(project).await {
            warn!(%project, %err, "failed to release project holds");
        }
        evicted
    }

    /// The socket task sent a ping; the pong must arrive in time.
    pub fn on_health_probe(&self, id: ConnectionId) {
        self.start_close_timer(
            id,
            TimerKind::HealthCheck,
            self.settings.health_check_timeout,
            "health check timeout",
        );
    }

    pub fn on_pong(&self, id: ConnectionId) {
        self.timers.stop(id, &TimerKind::HealthCheck);
    }

    /// Writes a bus envelope to every local connection of its project.
    pub async fn deliver(&self, envelope: &BusEnvelope) {
        let project = envelope.uid.project_id();
        let connections = self.connections.read().await;
        for (id, entry) in connections.iter() {
            if entry.departed {
                continue;
            }
            let Some(uid) = entry.connection.uid() else {
                continue;
            };
            if uid.project_id() != project {
                continue;
            }
            let from_self = *uid == envelope.uid;
            if from_self && !matches!(envelope.payload, BusPayload::Operations(_)) {
                continue;
            }
            let Some(payload) = filter_outbound(entry.filter_context(), envelope.payload.clone())
            else {
                continue;
            };
            match serde_json::to_string(&payload) {
                Ok(text) => {
                    let _ = entry.outbound.send(ServerFrame::Text(text));
                }
                Err(err) => warn!(connection = %id, %err, "failed to encode outbound frame"),
            }
        }
    }

    /// Feeds bus traffic to `deliver` until the bus closes or the manager is dropped.
    pub fn spawn_bus_listener(&self) -> JoinHandle<()> {
        let mut receiver = self.bus.subscribe();
        let manager = self.me.clone();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(envelope) => {
                        let Some(manager) = manager.upgrade() else {
                            break;
                        };
                        manager.deliver(&envelope).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "bus listener lagged; envelopes dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("bus listener stopped");
        })
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn connection_snapshot(&self, id: ConnectionId) -> Option<Connection> {
        self.connections
            .read()
            .await
            .get(&id)
            .map(|entry| entry.connection.clone())
    }

    async fn filter_context(&self, id: ConnectionId) -> Option<FilterContext> {
        self.connections
            .read()
            .await
            .get(&id)
            .map(ConnectionEntry::filter_context)
    }

    async fn touch(&self, id: ConnectionId) {
        if let Some(entry) = self.connections.write().await.get_mut(&id) {
            entry.connection.touch();
        }
    }

    fn restart_message_timer(&self, id: ConnectionId) {
        self.start_close_timer(
            id,
            TimerKind::Message,
            self.settings.message_timeout,
            "message timeout",
        );
    }

    fn start_close_timer(
        &self,
        id: ConnectionId,
        kind: TimerKind,
        after: Duration,
        reason: &'static str,
    ) {
        let manager = self.me.clone();
        self.timers.start(id, kind, after, async move {
            if let Some(manager) = manager.upgrade() {
                info!(connection = %id, reason, "closing connection");
                manager.send(id, ServerFrame::Close).await;
            }
        });
    }

    async fn publish(&self, envelope: BusEnvelope) -> LifecycleResult<()> {
        self.bus
            .publish(envelope)
            .await
            .map_err(|e| LifecycleError::Bus(e.to_string()))
    }

    async fn send(&self, id: ConnectionId, frame: ServerFrame) -> bool {
        self.connections
            .read()
            .await
            .get(&id)
            .is_some_and(|entry| entry.outbound.send(frame).is_ok())
    }

    async fn send_json(&self, id: ConnectionId, value: &Value) {
        self.send(id, ServerFrame::Text(value.to_string())).await;
    }

    async fn send_payload(&self, id: ConnectionId, payload: &BusPayload) {
        match serde_json::to_string(payload) {
            Ok(text) => {
                self.send(id, ServerFrame::Text(text)).await;
            }
            Err(err) => warn!(connection = %id, %err, "failed to encode frame"),
        }
    }

    fn record_event(&self, envelope: &ConnectionEventEnvelope) {
        debug!(
            connection = %envelope.connection_id,
            event = envelope.event.name(),
            occurred_at = %envelope.occurred_at,
            "connection transition"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_connection_event(envelope.event.name());
        }
    }

    fn record_rejected(&self, reason: &'static str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_frame_rejected(reason);
        }
    }
}

#[async_trait]
impl<S> ProjectTracker for ConnectionManager<S>
where
    S: OperationStore + HoldStore + ProjectActivityStore + 'static,
{
    async fn tracked_projects(&self) -> Vec<TrackedProject> {
        let connections = self.connections.read().await;
        let mut youngest: HashMap<ProjectId, DateTime<Utc>> = HashMap::new();
        for entry in connections.values() {
            let Some(uid) = entry.connection.uid() else {
                continue;
            };
            let created_at = entry.connection.created_at();
            youngest
                .entry(uid.project_id().clone())
                .and_modify(|current| *current = (*current).max(created_at))
                .or_insert(created_at);
        }
        youngest
            .into_iter()
            .map(|(project_id, youngest_created_at)| TrackedProject {
                project_id,
                youngest_created_at,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::auth::{SessionDirectory, SessionGrant};
    use crate::adapters::bus::BroadcastBus;
    use crate::adapters::store::InMemoryCollabStore;
    use crate::domain::connection::ConnectionPhase;
    use crate::domain::hold::ElementId;
    use crate::domain::session::{SessionKey, UserId};
    use tokio::time;

    type Manager = ConnectionManager<InMemoryCollabStore>;

    fn grant(hash: &str, user: &str) -> SessionGrant {
        SessionGrant {
            session_hash: hash.into(),
            user_id: UserId::new(user).unwrap(),
            project_id: ProjectId::new("p1").unwrap(),
        }
    }

    fn manager() -> (Arc<Manager>, Arc<InMemoryCollabStore>) {
        let store = Arc::new(InMemoryCollabStore::new());
        let directory = SessionDirectory::from_grants([grant("h-alice", "alice"), grant("h-bob", "bob")]);
        let manager = ConnectionManager::new(
            LifecycleSettings::default(),
            Arc::clone(&store),
            Arc::new(BroadcastBus::default()),
            Arc::new(directory),
            None,
        );
        manager.spawn_bus_listener();
        (manager, store)
    }

    async fn next_json(rx: &mut mpsc::UnboundedReceiver<ServerFrame>) -> Value {
        loop {
            match rx.recv().await.expect("frame") {
                ServerFrame::Text(text) => return serde_json::from_str(&text).unwrap(),
                ServerFrame::Close => panic!("unexpected close"),
            }
        }
    }

    async fn authorize(
        manager: &Manager,
        hash: &str,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<ServerFrame>, Uid) {
        let (id, mut rx) = manager.accept().await;
        let frame = json!({ "auth": { "sessionHash": hash } }).to_string();
        manager.handle_text(id, &frame).await.unwrap();
        let reply = next_json(&mut rx).await;
        assert_eq!(reply["auth"]["status"], "authorized");
        let uid: Uid = reply["auth"]["uid"].as_str().unwrap().parse().unwrap();
        (id, rx, uid)
    }

    fn project_key() -> SessionKey {
        SessionKey::Project(ProjectId::new("p1").unwrap())
    }

    fn drain_closed(rx: &mut mpsc::UnboundedReceiver<ServerFrame>) -> bool {
        let mut closed = false;
        while let Ok(frame) = rx.try_recv() {
            closed |= frame == ServerFrame::Close;
        }
        closed
    }

    #[tokio::test]
    async fn auth_then_operations_persists_and_enters_operations() {
        let (manager, store) = manager();
        let (id, mut rx, _) = authorize(&manager, "h-alice").await;

        let frame = json!({ "operations": [{ "channel": "project", "properties": { "type": "text" } }] });
        manager.handle_text(id, &frame.to_string()).await.unwrap();

        let echoed = next_json(&mut rx).await;
        assert_eq!(echoed["operations"][0]["index"], 1);
        assert_eq!(store.ordered_refs(&project_key()).await.unwrap().len(), 1);
        let connection = manager.connection_snapshot(id).await.unwrap();
        assert_eq!(connection.status(), Some(ConnectionStatus::Operations));
        assert_eq!(connection.phase(), ConnectionPhase::Operations);
    }

    #[tokio::test]
    async fn operations_before_auth_are_dropped_silently() {
        let (manager, store) = manager();
        let (id, _rx) = manager.accept().await;
        let frame = json!({ "operations": [
            { "channel": "client", "properties": { "type": "track" } },
            { "channel": "project", "properties": { "type": "text" } }
        ] });
        manager.handle_text(id, &frame.to_string()).await.unwrap();
        assert!(store.operations(&project_key()).await.unwrap().is_empty());
        assert_eq!(manager.connection_snapshot(id).await.unwrap().status(), None);
    }

    #[tokio::test]
    async fn malformed_and_mixed_frames_keep_the_connection() {
        let (manager, _) = manager();
        let (id, _rx, _) = authorize(&manager, "h-alice").await;
        manager.handle_text(id, "{not json").await.unwrap();
        manager
            .handle_text(id, &json!({ "auth": {}, "operations": [] }).to_string())
            .await
            .unwrap();
        manager.handle_text(id, "{}").await.unwrap();
        assert_eq!(manager.connection_count().await, 1);
    }

    #[tokio::test]
    async fn unknown_session_is_rejected_and_closed() {
        let (manager, _) = manager();
        let (id, mut rx) = manager.accept().await;
        let frame = json!({ "auth": { "sessionHash": "nope" } }).to_string();
        manager.handle_text(id, &frame).await.unwrap();
        assert_eq!(next_json(&mut rx).await["destroy"]["reason"], "unauthorized");
        assert_eq!(rx.recv().await, Some(ServerFrame::Close));

        manager.on_close(id).await;
        assert_eq!(manager.connection_count().await, 0);
    }

    #[tokio::test]
    async fn peers_receive_auth_but_not_their_own() {
        let (manager, _) = manager();
        let (_alice, mut alice_rx, _) = authorize(&manager, "h-alice").await;
        let (_bob, mut bob_rx, bob_uid) = authorize(&manager, "h-bob").await;

        let seen = next_json(&mut alice_rx).await;
        assert_eq!(seen["auth"]["uid"], bob_uid.to_string());
        time::sleep(Duration::from_millis(20)).await;
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn auth_timer_closes_idle_handshake() {
        let (manager, _) = manager();
        let (_id, mut rx) = manager.accept().await;
        time::sleep(LifecycleSettings::default().auth_timeout + Duration::from_secs(1)).await;
        assert_eq!(rx.recv().await, Some(ServerFrame::Close));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_connection_closes_after_message_timeout() {
        let (manager, _) = manager();
        let (_id, mut rx, _) = authorize(&manager, "h-alice").await;
        let message_timeout = LifecycleSettings::default().message_timeout;

        time::sleep(message_timeout - Duration::from_secs(1)).await;
        assert!(!drain_closed(&mut rx));
        time::sleep(Duration::from_secs(2)).await;
        assert!(drain_closed(&mut rx));
    }

    #[tokio::test(start_paused = true)]
    async fn accepted_frame_pushes_message_deadline_back() {
        let (manager, _) = manager();
        let (id, mut rx, _) = authorize(&manager, "h-alice").await;
        let message_timeout = LifecycleSettings::default().message_timeout;

        time::sleep(message_timeout - Duration::from_secs(60)).await;
        let frame = json!({ "operations": [{ "channel": "client", "properties": { "type": "track" } }] });
        manager.handle_text(id, &frame.to_string()).await.unwrap();
        time::sleep(Duration::from_secs(120)).await;
        assert!(!drain_closed(&mut rx));

        time::sleep(message_timeout).await;
        assert!(drain_closed(&mut rx));
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_does_not_push_message_deadline_back() {
        let (manager, _) = manager();
        let (id, mut rx, _) = authorize(&manager, "h-alice").await;
        let message_timeout = LifecycleSettings::default().message_timeout;

        time::sleep(message_timeout - Duration::from_secs(60)).await;
        manager.handle_text(id, "{}").await.unwrap();
        time::sleep(Duration::from_secs(120)).await;
        assert!(drain_closed(&mut rx));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_health_probe_closes_connection() {
        let (manager, _) = manager();
        let (id, mut rx, _) = authorize(&manager, "h-alice").await;
        manager.on_health_probe(id);
        time::sleep(LifecycleSettings::default().health_check_timeout + Duration::from_secs(1)).await;
        assert!(drain_closed(&mut rx));
    }

    #[tokio::test(start_paused = true)]
    async fn pong_cancels_health_close() {
        let (manager, _) = manager();
        let (id, mut rx, _) = authorize(&manager, "h-alice").await;
        manager.on_health_probe(id);
        manager.on_pong(id);
        time::sleep(LifecycleSettings::default().health_check_timeout * 2).await;
        assert!(!drain_closed(&mut rx));
        assert_eq!(manager.connection_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_within_grace_keeps_holds() {
        let (manager, _) = manager();
        let (id, _rx, _) = authorize(&manager, "h-alice").await;
        let hold = json!({ "operations": [{ "channel": "client", "properties": { "type": "hold", "elements": ["e1"] } }] });
        manager.handle_text(id, &hold.to_string()).await.unwrap();

        manager.on_close(id).await;
        let (_again, _rx2, _) = authorize(&manager, "h-alice").await;
        time::sleep(LifecycleSettings::default().disconnect_timeout * 2).await;

        let project = ProjectId::new("p1").unwrap();
        let holds = manager.holds().holds(&project).await.unwrap();
        assert_eq!(holds.len(), 1);
        assert!(holds[0].covers(&ElementId::new("e1").unwrap()));
        assert_eq!(manager.connection_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_timeout_evicts_and_releases_holds() {
        let (manager, _) = manager();
        let (alice, _alice_rx, _) = authorize(&manager, "h-alice").await;
        let (_bob, mut bob_rx, _) = authorize(&manager, "h-bob").await;
        let hold = json!({ "operations": [{ "channel": "client", "properties": { "type": "hold", "elements": ["e1"] } }] });
        manager.handle_text(alice, &hold.to_string()).await.unwrap();

        manager.on_close(alice).await;
        time::sleep(LifecycleSettings::default().disconnect_timeout + Duration::from_secs(1)).await;

        let project = ProjectId::new("p1").unwrap();
        assert!(manager.holds().holds(&project).await.unwrap().is_empty());
        assert_eq!(manager.connection_count().await, 1);
        let mut saw_destroy = false;
        while let Ok(ServerFrame::Text(text)) = bob_rx.try_recv() {
            let frame: Value = serde_json::from_str(&text).unwrap();
            saw_destroy |= frame["destroy"]["userId"] == "alice";
        }
        assert!(saw_destroy);
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_tool_operation_is_force_completed() {
        let (manager, store) = manager();
        let (id, _rx, _) = authorize(&manager, "h-alice").await;
        let start = json!({ "operations": [{
            "channel": "project",
            "properties": { "type": "line", "subType": "start", "id": { "clientId": "c1", "localId": 7 } }
        }] });
        manager.handle_text(id, &start.to_string()).await.unwrap();
        time::sleep(LifecycleSettings::default().tool_operation_timeout + Duration::from_secs(1)).await;

        let log = store.operations(&project_key()).await.unwrap();
        assert_eq!(log.len(), 2);
        let forced = log.values().last().unwrap();
        assert_eq!(forced.sub_type(), Some("end"));
        assert_eq!(forced.property("forced"), Some(&json!(true)));
    }

    #[tokio::test(start_paused = true)]
    async fn tool_operation_of_dropped_transport_is_force_completed() {
        let (manager, store) = manager();
        let (alice, _alice_rx, _) = authorize(&manager, "h-alice").await;
        let (_bob, mut bob_rx, _) = authorize(&manager, "h-bob").await;
        let start = json!({ "operations": [{
            "channel": "project",
            "properties": { "type": "line", "subType": "start", "id": { "clientId": "c1", "localId": 9 } }
        }] });
        manager.handle_text(alice, &start.to_string()).await.unwrap();

        manager.on_close(alice).await;
        time::sleep(LifecycleSettings::default().disconnect_timeout + Duration::from_secs(1)).await;

        assert_eq!(manager.connection_count().await, 1);
        let log = store.operations(&project_key()).await.unwrap();
        assert_eq!(log.len(), 2);
        let forced = log.values().last().unwrap();
        assert_eq!(forced.sub_type(), Some("end"));
        assert_eq!(forced.property("forced"), Some(&json!(true)));

        let mut saw_forced_end = false;
        while let Ok(ServerFrame::Text(text)) = bob_rx.try_recv() {
            let frame: Value = serde_json::from_str(&text).unwrap();
            saw_forced_end |= frame["operations"][0]["properties"]["forced"] == json!(true);
        }
        assert!(saw_forced_end);
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledged_tool_operation_is_not_forced() {
        let (manager, store) = manager();
        let (id, _rx, _) = authorize(&manager, "h-alice").await;
        let id_value = json!({ "clientId": "c1", "localId": 8 });
        let start = json!({ "operations": [{ "properties": { "type": "line", "subType": "start", "id": id_value } }] });
        let end = json!({ "operations": [{ "properties": { "type": "line", "subType": "end", "id": id_value } }] });
        manager.handle_text(id, &start.to_string()).await.unwrap();
        manager.handle_text(id, &end.to_string()).await.unwrap();
        time::sleep(LifecycleSettings::default().tool_operation_timeout * 2).await;

        let log = store.operations(&project_key()).await.unwrap();
        assert_eq!(log.len(), 2);
        assert!(log.values().all(|op| op.property("forced").is_none()));
    }

    #[tokio::test]
    async fn destroy_frame_closes_and_evicts() {
        let (manager, store) = manager();
        let (id, mut rx, uid) = authorize(&manager, "h-alice").await;
        let ops = json!({ "operations": [
            { "channel": "client", "properties": { "type": "track" } },
            { "channel": "project", "properties": { "type": "text" } }
        ] });
        manager.handle_text(id, &ops.to_string()).await.unwrap();
        manager
            .handle_text(id, &json!({ "destroy": true, "params": { "persisted": 1 } }).to_string())
            .await
            .unwrap();

        let mut closed = false;
        while let Some(frame) = rx.recv().await {
            if frame == ServerFrame::Close {
                closed = true;
                break;
            }
        }
        assert!(closed);
        assert_eq!(manager.connection_count().await, 0);
        let client_key = SessionKey::for_channel(&uid, crate::domain::operation::Channel::Client);
        assert!(store.operations(&client_key).await.unwrap().is_empty());
        let project = ProjectId::new("p1").unwrap();
        assert!(store
            .batch_empty_check(&[project.clone()])
            .await
            .unwrap()
            .contains(&project));
    }

    #[tokio::test]
    async fn failing_operation_reports_error_after_partial_batch() {
        let (manager, store) = manager();
        let (id, mut rx, _) = authorize(&manager, "h-alice").await;
        let ops = json!({ "operations": [
            { "channel": "project", "properties": { "type": "text" } },
            { "channel": "client", "properties": { "type": "users" } }
        ] });
        let err = manager
            .handle_text(id, &ops.to_string())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_implemented");
        assert_eq!(store.operations(&project_key()).await.unwrap().len(), 1);
        assert_eq!(next_json(&mut rx).await["operations"][0]["index"], 1);
    }

    #[tokio::test]
    async fn replayed_indices_never_outgrow_the_log() {
        let (manager, store) = manager();
        let (id, mut rx, uid) = authorize(&manager, "h-alice").await;
        let save = json!({ "operations": [{ "channel": "project", "properties": { "type": "text" } }] });
        manager.handle_text(id, &save.to_string()).await.unwrap();
        next_json(&mut rx).await;

        let replay = json!({ "operations": [
            { "channel": "project", "index": 1, "properties": { "type": "text", "subType": "x" } },
            { "channel": "project", "index": 999, "properties": { "type": "text" } }
        ] });
        let err = manager
            .handle_text(id, &replay.to_string())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "unknown_operation");

        let live = store.operations(&project_key()).await.unwrap().len();
        let refs = store.ordered_refs(&project_key()).await.unwrap().len();
        assert_eq!((live, refs), (1, 1));
        let ordered = manager.operations().ordered_operations(&uid, true).await.unwrap();
        assert_eq!(ordered.len(), 1);
    }

    #[tokio::test]
    async fn cancel_rolls_back_and_resends_session() {
        let (manager, store) = manager();
        let (id, mut rx, _) = authorize(&manager, "h-alice").await;
        let before = json!({ "operations": [{ "channel": "project", "properties": { "type": "text" }, "timestamp": 100 }] });
        let mode = json!({ "operations": [{ "channel": "user", "properties": { "type": "mode" }, "timestamp": 200 }] });
        let after = json!({ "operations": [{ "channel": "project", "properties": { "type": "text" }, "timestamp": 300 }] });
        for frame in [before, mode, after] {
            manager.handle_text(id, &frame.to_string()).await.unwrap();
            next_json(&mut rx).await;
        }

        let cancel = json!({ "operations": [{ "channel": "project", "properties": { "type": "cancel" } }] });
        manager.handle_text(id, &cancel.to_string()).await.unwrap();
        let session = next_json(&mut rx).await;
        assert_eq!(session["operations"].as_array().unwrap().len(), 2);
        let notice = next_json(&mut rx).await;
        assert_eq!(notice["operations"][0]["properties"]["removed"], json!([2]));
        let log = store.operations(&project_key()).await.unwrap();
        assert!(log.values().all(|op| op.timestamp.unwrap() <= 200));
    }

    #[tokio::test]
    async fn tracker_reports_projects_and_evict_project_clears_them() {
        let (manager, _) = manager();
        let (_alice, _rx1, _) = authorize(&manager, "h-alice").await;
        let (_bob, _rx2, _) = authorize(&manager, "h-bob").await;
        let tracked = manager.tracked_projects().await;
        assert_eq!(tracked.len(), 1);
        assert_eq!(tracked[0].project_id, ProjectId::new("p1").unwrap());

        assert_eq!(manager.evict_project(&ProjectId::new("p1").unwrap()).await, 2);
        assert_eq!(manager.connection_count().await, 0);
    }
}
