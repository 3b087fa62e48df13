use crate::domain::operation::{
    cut_position, order_content, rebuild, Channel, Operation, OperationId, OperationKind,
    OperationRef,
};
use crate::domain::session::{ProjectId, SessionKey, Uid};
use crate::ports::store::OperationStore;
use crate::telemetry::CollabMetrics;
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum OperationError {
    #[error("unknown channel: {0}")]
    UnknownChannel(String),
    #[error("operation cannot be canceled: {0}")]
    CannotBeCanceled(String),
    #[error("no operation stored at index {index} on {channel}")]
    UnknownIndex { channel: String, index: u64 },
    #[error("store error: {0}")]
    Store(String),
}

pub type OperationResult<T> = Result<T, OperationError>;

fn store_error(err: anyhow::Error) -> OperationError {
    OperationError::Store(err.to_string())
}

/// Result of rolling the project log back to a mode change.
#[derive(Clone, Debug, PartialEq)]
pub struct CancelOutcome {
    pub request_id: Option<OperationId>,
    pub removed: Vec<Operation>,
    pub operations: Vec<Operation>,
}

pub struct OperationService<S: OperationStore> {
    store: Arc<S>,
    metrics: Option<Arc<CollabMetrics>>,
}

impl<S: OperationStore> OperationService<S> {
    pub fn new(store: Arc<S>, metrics: Option<Arc<CollabMetrics>>) -> Self {
        Self { store, metrics }
    }

    /// Stores an operation on its channel and references it once in the
    /// session's ordered list. Operations that already carry an index are
    /// only referenced, through the stored copy, and must exist.
    pub async fn save_operation(&self, uid: &Uid, operation: Operation) -> OperationResult<Operation> {
        let channel = operation
            .channel()
            .map_err(OperationError::UnknownChannel)?;
        let key = SessionKey::for_channel(uid, channel);
        let mut operation = operation;
        operation.channel = Some(channel.name().to_string());
        if operation.timestamp.is_none() {
            operation.timestamp = Some(Utc::now().timestamp_millis());
        }

        if let Some(index) = operation.index {
            let stored = self.store.operations(&key).await.map_err(store_error)?;
            operation = match stored.get(&index) {
                Some(existing) => existing.clone(),
                None => {
                    debug!(%key, index, "replayed operation has no stored counterpart");
                    return Err(OperationError::UnknownIndex {
                        channel: channel.name().to_string(),
                        index,
                    });
                }
            };
        } else {
            let outcome = self
                .store
                .append(&key, operation.clone())
                .await
                .map_err(store_error)?;
            operation.index = Some(outcome.index);
            if let Some(superseded) = outcome.superseded {
                self.store
                    .remove_ref(&key, &OperationRef::new(channel, &superseded))
                    .await
                    .map_err(store_error)?;
            }
            if let Some(metrics) = &self.metrics {
                metrics.record_operation_saved(channel.name());
            }
        }

        let inserted = self
            .store
            .push_ref(&key, OperationRef::new(channel, &operation))
            .await
            .map_err(store_error)?;
        if !inserted {
            debug!(%key, index = ?operation.index, "operation already referenced");
        }

        if channel == Channel::Project && operation.kind() == OperationKind::Pages {
            self.store
                .set_last_page_operation(uid.project_id(), operation.clone())
                .await
                .map_err(store_error)?;
        }

        Ok(operation)
    }

    /// Project content in rebuild order.
    pub async fn ordered_operations(&self, uid: &Uid, reverse: bool) -> OperationResult<Vec<Operation>> {
        let key = SessionKey::Project(uid.project_id().clone());
        let refs = self.store.ordered_refs(&key).await.map_err(store_error)?;
        let operations = self.store.operations(&key).await.map_err(store_error)?;
        Ok(order_content(&refs, &operations, reverse))
    }

    /// Everything a connection needs to rebuild its view.
    pub async fn all_operations(&self, uid: &Uid) -> OperationResult<Vec<Operation>> {
        let mut all = self.ordered_operations(uid, true).await?;
        for channel in [Channel::Client, Channel::User] {
            let key = SessionKey::for_channel(uid, channel);
            let operations = self.store.operations(&key).await.map_err(store_error)?;
            all.extend(operations.into_values());
        }
        let last_page = self
            .store
            .last_page_operation(uid.project_id())
            .await
            .map_err(store_error)?;
        if let Some(page) = last_page {
            let already_listed = page.index.is_some()
                && all
                    .iter()
                    .any(|op| op.index == page.index && op.kind() == OperationKind::Pages);
            if !already_listed {
                all.push(page);
            }
        }
        Ok(all)
    }

    /// Rolls the project log back to the user's latest `mode` change.
    pub async fn cancel_operations(
        &self,
        uid: &Uid,
        request_id: Option<OperationId>,
        mode: &str,
    ) -> OperationResult<CancelOutcome> {
        let user_key = SessionKey::for_channel(uid, Channel::User);
        let user_operations = self.store.operations(&user_key).await.map_err(store_error)?;
        let mode_timestamp = user_operations
            .values()
            .rev()
            .filter(|op| op.properties.kind.eq_ignore_ascii_case(mode))
            .find_map(|op| op.timestamp)
            .ok_or_else(|| {
                OperationError::CannotBeCanceled(format!("no {mode} change recorded for {uid}"))
            })?;

        let project = uid.project_id();
        let project_key = SessionKey::Project(project.clone());
        let log: Vec<Operation> = self
            .store
            .operations(&project_key)
            .await
            .map_err(store_error)?
            .into_values()
            .collect();
        let outcome = rebuild(&log, cut_position(&log, mode_timestamp));

        if let Some(from_index) = outcome.truncate_from() {
            self.store
                .truncate_log(project, from_index, outcome.removed.len())
                .await
                .map_err(store_error)?;
        }
        self.store
            .clear_and_replay(&project_key, outcome.kept_refs())
            .await
            .map_err(store_error)?;

        if let Some(metrics) = &self.metrics {
            metrics.record_operations_canceled(outcome.removed.len() as u64);
        }
        debug!(%uid, mode, removed = outcome.removed.len(), "project log rolled back");

        Ok(CancelOutcome {
            request_id,
            removed: outcome.removed,
            operations: self.all_operations(uid).await?,
        })
    }

    /// Project log entries with `from <= index <= to`.
    pub async fn range(
        &self,
        project: &ProjectId,
        from: u64,
        to: Option<u64>,
    ) -> OperationResult<Vec<Operation>> {
        self.store
            .range(project, from, to)
            .await
            .map_err(store_error)
    }

    /// Project operations a reconnecting client has not seen yet.
    pub async fn missing(&self, uid: &Uid, last_seen_index: u64) -> OperationResult<Vec<Operation>> {
        self.range(uid.project_id(), last_seen_index.saturating_add(1), None)
            .await
    }

    pub async fn clear_client(&self, uid: &Uid) -> OperationResult<()> {
        self.store
            .clear_session(&SessionKey::for_channel(uid, Channel::Client))
            .await
            .map_err(store_error)
    }
}
