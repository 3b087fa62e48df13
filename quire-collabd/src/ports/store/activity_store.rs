use crate::domain::session::ProjectId;
use async_trait::async_trait;
use std::collections::HashSet;

#[async_trait]
pub trait ProjectActivityStore: Send + Sync {
    /// Projects among `projects` with no pending operations.
    async fn batch_empty_check(&self, projects: &[ProjectId]) -> anyhow::Result<HashSet<ProjectId>>;
    /// Marks every project log entry up to `index` as flushed downstream.
    async fn acknowledge_persisted(&self, project: &ProjectId, index: u64) -> anyhow::Result<()>;
}
