use crate::domain::hold::{ElementId, Hold};
use crate::domain::session::{ProjectId, UserId};
use async_trait::async_trait;

/// Element holds shared by every process editing a project.
#[async_trait]
pub trait HoldStore: Send + Sync {
    async fn find_holder(
        &self,
        project: &ProjectId,
        elements: &[ElementId],
    ) -> anyhow::Result<Option<UserId>>;
    /// Check-and-set: returns the user that holds the elements afterwards.
    async fn acquire_hold(
        &self,
        project: &ProjectId,
        user: &UserId,
        elements: &[ElementId],
    ) -> anyhow::Result<UserId>;
    async fn release_user(&self, project: &ProjectId, user: &UserId) -> anyhow::Result<usize>;
    async fn release_project(&self, project: &ProjectId) -> anyhow::Result<usize>;
    async fn holds(&self, project: &ProjectId) -> anyhow::Result<Vec<Hold>>;
}
