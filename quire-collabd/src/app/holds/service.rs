use crate::domain::hold::{ElementId, Hold};
use crate::domain::operation::{Operation, OperationKind};
use crate::domain::session::{ProjectId, Uid, UserId};
use crate::ports::store::HoldStore;
use crate::telemetry::CollabMetrics;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum HoldError {
    #[error("not implemented yet: {0}")]
    NotImplemented(String),
    #[error("unhandled operation type: {0}")]
    UnhandledOperationType(String),
    #[error("invalid hold request: {0}")]
    Invalid(String),
    #[error("store error: {0}")]
    Store(String),
}

pub type HoldResult<T> = Result<T, HoldError>;

/// Operation kinds routed to the collaboration handlers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CollabKind {
    Hold,
    Users,
}

impl CollabKind {
    pub const ALL: [CollabKind; 2] = [CollabKind::Hold, CollabKind::Users];

    pub fn from_operation(kind: &OperationKind) -> Option<Self> {
        match kind {
            OperationKind::Hold => Some(CollabKind::Hold),
            OperationKind::Users => Some(CollabKind::Users),
            _ => None,
        }
    }
}

#[async_trait]
trait CollabHandler<S: HoldStore>: Send + Sync {
    async fn handle(
        &self,
        store: &S,
        metrics: Option<&CollabMetrics>,
        uid: &Uid,
        operation: Operation,
    ) -> HoldResult<Operation>;
}

struct HoldHandler;

#[async_trait]
impl<S: HoldStore> CollabHandler<S> for HoldHandler {
    async fn handle(
        &self,
        store: &S,
        metrics: Option<&CollabMetrics>,
        uid: &Uid,
        operation: Operation,
    ) -> HoldResult<Operation> {
        let elements = requested_elements(&operation)?;
        let project = uid.project_id();
        let existing = store
            .find_holder(project, &elements)
            .await
            .map_err(|e| HoldError::Store(e.to_string()))?;
        let holder = match existing {
            Some(holder) if &holder != uid.user_id() => holder,
            _ => store
                .acquire_hold(project, uid.user_id(), &elements)
                .await
                .map_err(|e| HoldError::Store(e.to_string()))?,
        };
        let granted = &holder == uid.user_id();
        if let Some(metrics) = metrics {
            metrics.record_hold_request(granted);
        }
        debug!(%project, %holder, granted, elements = elements.len(), "hold resolved");
        let mut operation = operation;
        operation.set_property("holder", json!(holder.as_str()));
        Ok(operation)
    }
}

struct UsersHandler;

#[async_trait]
impl<S: HoldStore> CollabHandler<S> for UsersHandler {
    async fn handle(
        &self,
        _store: &S,
        _metrics: Option<&CollabMetrics>,
        _uid: &Uid,
        _operation: Operation,
    ) -> HoldResult<Operation> {
        // TODO: per-user presence operations need a store contract before they can be served.
        Err(HoldError::NotImplemented("users operations".into()))
    }
}

fn requested_elements(operation: &Operation) -> HoldResult<Vec<ElementId>> {
    let Some(Value::Array(items)) = operation.property("elements") else {
        return Err(HoldError::Invalid("elements must be an array".into()));
    };
    if items.is_empty() {
        return Err(HoldError::Invalid("elements cannot be empty".into()));
    }
    items
        .iter()
        .map(ElementId::from_value)
        .collect::<Result<Vec<_>, _>>()
        .map_err(HoldError::Invalid)
}

pub struct HoldService<S: HoldStore + 'static> {
    store: Arc<S>,
    handlers: HashMap<CollabKind, Box<dyn CollabHandler<S>>>,
    metrics: Option<Arc<CollabMetrics>>,
}

impl<S: HoldStore + 'static> HoldService<S> {
    pub fn new(store: Arc<S>, metrics: Option<Arc<CollabMetrics>>) -> Self {
        let handlers = CollabKind::ALL
            .into_iter()
            .map(|kind| {
                let handler: Box<dyn CollabHandler<S>> = match kind {
                    CollabKind::Hold => Box::new(HoldHandler),
                    CollabKind::Users => Box::new(UsersHandler),
                };
                (kind, handler)
            })
            .collect();
        Self {
            store,
            handlers,
            metrics,
        }
    }

    pub async fn handle(&self, uid: &Uid, operation: Operation) -> HoldResult<Operation> {
        let kind = operation.kind();
        let handler = CollabKind::from_operation(&kind)
            .and_then(|collab| self.handlers.get(&collab))
            .ok_or_else(|| HoldError::UnhandledOperationType(kind.name().to_string()))?;
        handler
            .handle(self.store.as_ref(), self.metrics.as_deref(), uid, operation)
            .await
    }

    pub async fn release_user(&self, project: &ProjectId, user: &UserId) -> HoldResult<usize> {
        self.store
            .release_user(project, user)
            .await
            .map_err(|e| HoldError::Store(e.to_string()))
    }

    pub async fn release_project(&self, project: &ProjectId) -> HoldResult<usize> {
        self.store
            .release_project(project)
            .await
            .map_err(|e| HoldError::Store(e.to_string()))
    }

    pub async fn holds(&self, project: &ProjectId) -> HoldResult<Vec<Hold>> {
        self.store
            .holds(project)
            .await
            .map_err(|e| HoldError::Store(e.to_string()))
    }
}
