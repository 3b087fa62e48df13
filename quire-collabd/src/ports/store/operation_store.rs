use crate::domain::operation::{Operation, OperationRef};
use crate::domain::session::{ProjectId, SessionKey};
use async_trait::async_trait;
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq)]
pub struct AppendOutcome {
    /// Index assigned to the stored operation.
    pub index: u64,
    /// USER upserts return the operation of the same type they replaced.
    pub superseded: Option<Operation>,
}

/// Ordered operation storage partitioned by session key.
#[async_trait]
pub trait OperationStore: Send + Sync {
    /// Atomic append; indices grow monotonically per key and are never reused.
    async fn append(&self, key: &SessionKey, operation: Operation)
        -> anyhow::Result<AppendOutcome>;
    async fn operations(&self, key: &SessionKey) -> anyhow::Result<BTreeMap<u64, Operation>>;
    async fn ordered_refs(&self, key: &SessionKey) -> anyhow::Result<Vec<OperationRef>>;
    /// Returns `false` when the ref was already present.
    async fn push_ref(&self, key: &SessionKey, reference: OperationRef) -> anyhow::Result<bool>;
    async fn remove_ref(&self, key: &SessionKey, reference: &OperationRef) -> anyhow::Result<()>;
    /// Project log entries with `from <= index <= to`.
    async fn range(
        &self,
        project: &ProjectId,
        from: u64,
        to: Option<u64>,
    ) -> anyhow::Result<Vec<Operation>>;
    /// Drops up to `count` project log entries starting at `from_index`.
    async fn truncate_log(
        &self,
        project: &ProjectId,
        from_index: u64,
        count: usize,
    ) -> anyhow::Result<usize>;
    async fn clear_and_replay(
        &self,
        key: &SessionKey,
        refs: Vec<OperationRef>,
    ) -> anyhow::Result<()>;
    async fn last_page_operation(&self, project: &ProjectId) -> anyhow::Result<Option<Operation>>;
    async fn set_last_page_operation(
        &self,
        project: &ProjectId,
        operation: Operation,
    ) -> anyhow::Result<()>;
    async fn clear_session(&self, key: &SessionKey) -> anyhow::Result<()>;
}
