use crate::domain::hold::{ElementId, Hold};
use crate::domain::operation::{Operation, OperationRef};
use crate::domain::session::{ProjectId, SessionKey, UserId};
use crate::ports::store::{AppendOutcome, HoldStore, OperationStore, ProjectActivityStore};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tokio::sync::RwLock;

const DEFAULT_OPERATION_TTL: Duration = Duration::from_secs(15 * 60);

#[derive(Default)]
struct SessionLog {
    operations: BTreeMap<u64, Operation>,
    refs: Vec<OperationRef>,
    last_index: u64,
}

#[derive(Default)]
struct StoreState {
    sessions: HashMap<SessionKey, SessionLog>,
    last_pages: HashMap<ProjectId, Operation>,
    holds: HashMap<ProjectId, HashMap<ElementId, UserId>>,
    persisted: HashMap<ProjectId, u64>,
}

/// Single-process store backing operations, holds and project activity.
pub struct InMemoryCollabStore {
    state: RwLock<StoreState>,
    operation_ttl: Duration,
}

impl Default for InMemoryCollabStore {
    fn default() -> Self {
        Self::with_operation_ttl(DEFAULT_OPERATION_TTL)
    }
}

impl InMemoryCollabStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Project operations older than `ttl`, or acknowledged as persisted,
    /// no longer count as pending.
    pub fn with_operation_ttl(operation_ttl: Duration) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            operation_ttl,
        }
    }
}

#[async_trait]
impl OperationStore for InMemoryCollabStore {
    async fn append(&self, key: &SessionKey, operation: Operation) -> Result<AppendOutcome> {
        let mut state = self.state.write().await;
        let log = state.sessions.entry(key.clone()).or_default();
        let replaced = match key {
            SessionKey::User { .. } => log
                .operations
                .iter()
                .find(|(_, existing)| existing.properties.kind == operation.properties.kind)
                .map(|(index, _)| *index),
            _ => None,
        };
        let superseded = replaced.and_then(|index| log.operations.remove(&index));
        log.last_index += 1;
        let index = log.last_index;
        let mut operation = operation;
        operation.index = Some(index);
        log.operations.insert(index, operation);
        Ok(AppendOutcome { index, superseded })
    }

    async fn operations(&self, key: &SessionKey) -> Result<BTreeMap<u64, Operation>> {
        let state = self.state.read().await;
        Ok(state
            .sessions
            .get(key)
            .map(|log| log.operations.clone())
            .unwrap_or_default())
    }

    async fn ordered_refs(&self, key: &SessionKey) -> Result<Vec<OperationRef>> {
        let state = self.state.read().await;
        Ok(state
            .sessions
            .get(key)
            .map(|log| log.refs.clone())
            .unwrap_or_default())
    }

    async fn push_ref(&self, key: &SessionKey, reference: OperationRef) -> Result<bool> {
        let mut state = self.state.write().await;
        let log = state.sessions.entry(key.clone()).or_default();
        if log.refs.contains(&reference) {
            return Ok(false);
        }
        log.refs.push(reference);
        Ok(true)
    }

    async fn remove_ref(&self, key: &SessionKey, reference: &OperationRef) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(log) = state.sessions.get_mut(key) {
            log.refs.retain(|existing| existing != reference);
        }
        Ok(())
    }

    async fn range(&self, project: &ProjectId, from: u64, to: Option<u64>) -> Result<Vec<Operation>> {
        let state = self.state.read().await;
        let key = SessionKey::Project(project.clone());
        let Some(log) = state.sessions.get(&key) else {
            return Ok(Vec::new());
        };
        let upper = to.unwrap_or(u64::MAX);
        if upper < from {
            return Ok(Vec::new());
        }
        Ok(log
            .operations
            .range(from..=upper)
            .map(|(_, operation)| operation.clone())
            .collect())
    }

    async fn truncate_log(&self, project: &ProjectId, from_index: u64, count: usize) -> Result<usize> {
        let mut state = self.state.write().await;
        let key = SessionKey::Project(project.clone());
        let Some(log) = state.sessions.get_mut(&key) else {
            return Ok(0);
        };
        let doomed: Vec<u64> = log
            .operations
            .range(from_index..)
            .take(count)
            .map(|(index, _)| *index)
            .collect();
        for index in &doomed {
            log.operations.remove(index);
        }
        Ok(doomed.len())
    }

    async fn clear_and_replay(&self, key: &SessionKey, refs: Vec<OperationRef>) -> Result<()> {
        let mut state = self.state.write().await;
        let log = state.sessions.entry(key.clone()).or_default();
        log.refs.clear();
        for reference in refs {
            if !log.refs.contains(&reference) {
                log.refs.push(reference);
            }
        }
        Ok(())
    }

    async fn last_page_operation(&self, project: &ProjectId) -> Result<Option<Operation>> {
        Ok(self.state.read().await.last_pages.get(project).cloned())
    }

    async fn set_last_page_operation(&self, project: &ProjectId, operation: Operation) -> Result<()> {
        self.state
            .write()
            .await
            .last_pages
            .insert(project.clone(), operation);
        Ok(())
    }

    async fn clear_session(&self, key: &SessionKey) -> Result<()> {
        self.state.write().await.sessions.remove(key);
        Ok(())
    }
}

#[async_trait]
impl HoldStore for InMemoryCollabStore {
    async fn find_holder(&self, project: &ProjectId, elements: &[ElementId]) -> Result<Option<UserId>> {
        let state = self.state.read().await;
        let Some(holds) = state.holds.get(project) else {
            return Ok(None);
        };
        Ok(elements
            .iter()
            .find_map(|element| holds.get(element).cloned()))
    }

    async fn acquire_hold(
        &self,
        project: &ProjectId,
        user: &UserId,
        elements: &[ElementId],
    ) -> Result<UserId> {
        let mut state = self.state.write().await;
        let holds = state.holds.entry(project.clone()).or_default();
        if let Some(other) = elements
            .iter()
            .filter_map(|element| holds.get(element))
            .find(|holder| *holder != user)
        {
            return Ok(other.clone());
        }
        for element in elements {
            holds.insert(element.clone(), user.clone());
        }
        Ok(user.clone())
    }

    async fn release_user(&self, project: &ProjectId, user: &UserId) -> Result<usize> {
        let mut state = self.state.write().await;
        let Some(holds) = state.holds.get_mut(project) else {
            return Ok(0);
        };
        let before = holds.len();
        holds.retain(|_, holder| holder != user);
        let released = before - holds.len();
        if holds.is_empty() {
            state.holds.remove(project);
        }
        Ok(released)
    }

    async fn release_project(&self, project: &ProjectId) -> Result<usize> {
        let mut state = self.state.write().await;
        Ok(state
            .holds
            .remove(project)
            .map(|holds| holds.len())
            .unwrap_or(0))
    }

    async fn holds(&self, project: &ProjectId) -> Result<Vec<Hold>> {
        let state = self.state.read().await;
        let Some(holds) = state.holds.get(project) else {
            return Ok(Vec::new());
        };
        let mut by_holder: BTreeMap<UserId, Vec<ElementId>> = BTreeMap::new();
        for (element, holder) in holds {
            by_holder
                .entry(holder.clone())
                .or_default()
                .push(element.clone());
        }
        by_holder
            .into_iter()
            .map(|(holder, elements)| {
                Hold::new(project.clone(), holder, elements).map_err(|err| anyhow!(err))
            })
            .collect()
    }
}

#[async_trait]
impl ProjectActivityStore for InMemoryCollabStore {
    async fn batch_empty_check(&self, projects: &[ProjectId]) -> Result<HashSet<ProjectId>> {
        let ttl_ms = i64::try_from(self.operation_ttl.as_millis()).unwrap_or(i64::MAX);
        let horizon = Utc::now().timestamp_millis().saturating_sub(ttl_ms);
        let state = self.state.read().await;
        Ok(projects
            .iter()
            .filter(|project| {
                let watermark = state.persisted.get(*project).copied().unwrap_or(0);
                let key = SessionKey::Project((*project).clone());
                state.sessions.get(&key).map_or(true, |log| {
                    !log.operations.range(watermark.saturating_add(1)..).any(|(_, operation)| {
                        operation
                            .timestamp
                            .map_or(true, |timestamp| timestamp > horizon)
                    })
                })
            })
            .cloned()
            .collect())
    }

    async fn acknowledge_persisted(&self, project: &ProjectId, index: u64) -> Result<()> {
        let mut state = self.state.write().await;
        let watermark = state.persisted.entry(project.clone()).or_default();
        *watermark = (*watermark).max(index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::operation::Channel;

    fn project() -> ProjectId {
        ProjectId::new("p1").unwrap()
    }

    fn user(name: &str) -> UserId {
        UserId::new(name).unwrap()
    }

    fn elements(ids: &[&str]) -> Vec<ElementId> {
        ids.iter().map(|id| ElementId::new(*id).unwrap()).collect()
    }

    #[tokio::test]
    async fn project_append_assigns_monotonic_indices() {
        let store = InMemoryCollabStore::new();
        let key = SessionKey::Project(project());
        let first = store
            .append(&key, Operation::new(Channel::Project, "text"))
            .await
            .unwrap();
        let second = store
            .append(&key, Operation::new(Channel::Project, "text"))
            .await
            .unwrap();
        assert_eq!((first.index, second.index), (1, 2));

        store.truncate_log(&project(), 2, 1).await.unwrap();
        let third = store
            .append(&key, Operation::new(Channel::Project, "text"))
            .await
            .unwrap();
        assert_eq!(third.index, 3);
        let stored = store.operations(&key).await.unwrap();
        assert_eq!(stored.keys().copied().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(stored[&3].index, Some(3));
    }

    #[tokio::test]
    async fn user_append_upserts_by_type() {
        let store = InMemoryCollabStore::new();
        let key = SessionKey::User {
            user: user("u1"),
            project: project(),
        };
        store
            .append(&key, Operation::new(Channel::User, "mode"))
            .await
            .unwrap();
        let outcome = store
            .append(&key, Operation::new(Channel::User, "mode"))
            .await
            .unwrap();
        assert_eq!(outcome.superseded.and_then(|op| op.index), Some(1));
        assert_eq!(store.operations(&key).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn refs_are_deduplicated() {
        let store = InMemoryCollabStore::new();
        let key = SessionKey::Project(project());
        let op = Operation::new(Channel::Project, "text").with_index(4);
        let reference = OperationRef::new(Channel::Project, &op);
        assert!(store.push_ref(&key, reference.clone()).await.unwrap());
        assert!(!store.push_ref(&key, reference.clone()).await.unwrap());
        assert_eq!(store.ordered_refs(&key).await.unwrap().len(), 1);
        store.remove_ref(&key, &reference).await.unwrap();
        assert!(store.ordered_refs(&key).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn range_is_inclusive() {
        let store = InMemoryCollabStore::new();
        let key = SessionKey::Project(project());
        for _ in 0..5 {
            store
                .append(&key, Operation::new(Channel::Project, "text"))
                .await
                .unwrap();
        }
        let slice = store.range(&project(), 2, Some(4)).await.unwrap();
        assert_eq!(
            slice.iter().filter_map(|op| op.index).collect::<Vec<_>>(),
            vec![2, 3, 4]
        );
        assert_eq!(store.range(&project(), 4, None).await.unwrap().len(), 2);
        assert!(store.range(&project(), 4, Some(1)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn first_holder_wins() {
        let store = InMemoryCollabStore::new();
        let winner = store
            .acquire_hold(&project(), &user("a"), &elements(&["e1", "e2"]))
            .await
            .unwrap();
        assert_eq!(winner, user("a"));
        let contested = store
            .acquire_hold(&project(), &user("b"), &elements(&["e2", "e3"]))
            .await
            .unwrap();
        assert_eq!(contested, user("a"));
        assert_eq!(
            store
                .find_holder(&project(), &elements(&["e3"]))
                .await
                .unwrap(),
            None
        );
        let holds = store.holds(&project()).await.unwrap();
        assert_eq!(holds.len(), 1);
        assert_eq!(holds[0].holder(), &user("a"));

        assert_eq!(store.release_user(&project(), &user("a")).await.unwrap(), 2);
        assert!(store.holds(&project()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_check_honours_ttl() {
        let fresh = InMemoryCollabStore::with_operation_ttl(Duration::from_secs(3600));
        let key = SessionKey::Project(project());
        let stamped = Operation::new(Channel::Project, "text")
            .with_timestamp(Utc::now().timestamp_millis());
        fresh.append(&key, stamped.clone()).await.unwrap();
        let idle = ProjectId::new("idle").unwrap();
        let empty = fresh
            .batch_empty_check(&[project(), idle.clone()])
            .await
            .unwrap();
        assert_eq!(empty, HashSet::from([idle]));

        let expired = InMemoryCollabStore::with_operation_ttl(Duration::ZERO);
        let old = stamped.with_timestamp(Utc::now().timestamp_millis() - 1_000);
        expired.append(&key, old).await.unwrap();
        let empty = expired.batch_empty_check(&[project()]).await.unwrap();
        assert!(empty.contains(&project()));
    }

    #[tokio::test]
    async fn acknowledged_operations_are_not_pending() {
        let store = InMemoryCollabStore::with_operation_ttl(Duration::from_secs(3600));
        let key = SessionKey::Project(project());
        for _ in 0..2 {
            store
                .append(
                    &key,
                    Operation::new(Channel::Project, "text")
                        .with_timestamp(Utc::now().timestamp_millis()),
                )
                .await
                .unwrap();
        }
        store.acknowledge_persisted(&project(), 1).await.unwrap();
        assert!(store.batch_empty_check(&[project()]).await.unwrap().is_empty());

        store.acknowledge_persisted(&project(), 2).await.unwrap();
        store.acknowledge_persisted(&project(), 1).await.unwrap();
        assert!(store
            .batch_empty_check(&[project()])
            .await
            .unwrap()
            .contains(&project()));
    }
}
