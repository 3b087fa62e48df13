use crate::domain::hold::{ElementId, Hold};
use crate::domain::operation::{Operation, OperationRef};
use crate::domain::session::{ProjectId, SessionKey, UserId};
use crate::ports::store::{AppendOutcome, HoldStore, OperationStore, ProjectActivityStore};
use crate::telemetry::CollabMetrics;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{trace, warn};

/// Decorator timing every store call and logging failures.
pub struct InstrumentedStore<S> {
    inner: S,
    metrics: Option<Arc<CollabMetrics>>,
}

impl<S> InstrumentedStore<S> {
    pub fn new(inner: S, metrics: Option<Arc<CollabMetrics>>) -> Self {
        Self { inner, metrics }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn observe<T, F>(&self, method: &'static str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let result = call.await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        match &result {
            Ok(_) => trace!(method, elapsed_ms, "store call"),
            Err(err) => warn!(method, elapsed_ms, %err, "store call failed"),
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_store_call(method, elapsed_ms, result.is_ok());
        }
        result
    }
}

#[async_trait]
impl<S: OperationStore> OperationStore for InstrumentedStore<S> {
    async fn append(&self, key: &SessionKey, operation: Operation) -> Result<AppendOutcome> {
        self.observe("append", self.inner.append(key, operation))
            .await
    }

    async fn operations(&self, key: &SessionKey) -> Result<BTreeMap<u64, Operation>> {
        self.observe("operations", self.inner.operations(key)).await
    }

    async fn ordered_refs(&self, key: &SessionKey) -> Result<Vec<OperationRef>> {
        self.observe("ordered_refs", self.inner.ordered_refs(key))
            .await
    }

    async fn push_ref(&self, key: &SessionKey, reference: OperationRef) -> Result<bool> {
        self.observe("push_ref", self.inner.push_ref(key, reference))
            .await
    }

    async fn remove_ref(&self, key: &SessionKey, reference: &OperationRef) -> Result<()> {
        self.observe("remove_ref", self.inner.remove_ref(key, reference))
            .await
    }

    async fn range(&self, project: &ProjectId, from: u64, to: Option<u64>) -> Result<Vec<Operation>> {
        self.observe("range", self.inner.range(project, from, to))
            .await
    }

    async fn truncate_log(&self, project: &ProjectId, from_index: u64, count: usize) -> Result<usize> {
        self.observe(
            "truncate_log",
            self.inner.truncate_log(project, from_index, count),
        )
        .await
    }

    async fn clear_and_replay(&self, key: &SessionKey, refs: Vec<OperationRef>) -> Result<()> {
        self.observe("clear_and_replay", self.inner.clear_and_replay(key, refs))
            .await
    }

    async fn last_page_operation(&self, project: &ProjectId) -> Result<Option<Operation>> {
        self.observe(
            "last_page_operation",
            self.inner.last_page_operation(project),
        )
        .await
    }

    async fn set_last_page_operation(&self, project: &ProjectId, operation: Operation) -> Result<()> {
        self.observe(
            "set_last_page_operation",
            self.inner.set_last_page_operation(project, operation),
        )
        .await
    }

    async fn clear_session(&self, key: &SessionKey) -> Result<()> {
        self.observe("clear_session", self.inner.clear_session(key))
            .await
    }
}

#[async_trait]
impl<S: HoldStore> HoldStore for InstrumentedStore<S> {
    async fn find_holder(&self, project: &ProjectId, elements: &[ElementId]) -> Result<Option<UserId>> {
        self.observe("find_holder", self.inner.find_holder(project, elements))
            .await
    }

    async fn acquire_hold(
        &self,
        project: &ProjectId,
        user: &UserId,
        elements: &[ElementId],
    ) -> Result<UserId> {
        self.observe(
            "acquire_hold",
            self.inner.acquire_hold(project, user, elements),
        )
        .await
    }

    async fn release_user(&self, project: &ProjectId, user: &UserId) -> Result<usize> {
        self.observe("release_user", self.inner.release_user(project, user))
            .await
    }

    async fn release_project(&self, project: &ProjectId) -> Result<usize> {
        self.observe("release_project", self.inner.release_project(project))
            .await
    }

    async fn holds(&self, project: &ProjectId) -> Result<Vec<Hold>> {
        self.observe("holds", self.inner.holds(project)).await
    }
}

#[async_trait]
impl<S: ProjectActivityStore> ProjectActivityStore for InstrumentedStore<S> {
    async fn batch_empty_check(&self, projects: &[ProjectId]) -> Result<HashSet<ProjectId>> {
        self.observe(
            "batch_empty_check",
            self.inner.batch_empty_check(projects),
        )
        .await
    }

    async fn acknowledge_persisted(&self, project: &ProjectId, index: u64) -> Result<()> {
        self.observe(
            "acknowledge_persisted",
            self.inner.acknowledge_persisted(project, index),
        )
        .await
    }
}
