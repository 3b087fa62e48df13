use crate::domain::session::ProjectId;
use crate::ports::store::ProjectActivityStore;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

const CHANNEL_CAPACITY: usize = 4;

/// A project with at least one local connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackedProject {
    pub project_id: ProjectId,
    /// Creation time of the project's most recent connection.
    pub youngest_created_at: DateTime<Utc>,
}

#[async_trait]
pub trait ProjectTracker: Send + Sync {
    async fn tracked_projects(&self) -> Vec<TrackedProject>;
}

pub type EvictionCallback = Arc<dyn Fn(ProjectId) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct IdleSweep {
    tracker: Arc<dyn ProjectTracker>,
    activity: Arc<dyn ProjectActivityStore>,
    evict: EvictionCallback,
    max_session_age: Duration,
}

impl IdleSweep {
    pub fn new(
        tracker: Arc<dyn ProjectTracker>,
        activity: Arc<dyn ProjectActivityStore>,
        evict: EvictionCallback,
        max_session_age: Duration,
    ) -> Self {
        Self {
            tracker,
            activity,
            evict,
            max_session_age,
        }
    }

    /// One pass: a single batch query, then eviction of every project that is
    /// empty and whose youngest connection is older than the max session age.
    pub async fn sweep_once(&self) -> anyhow::Result<Vec<ProjectId>> {
        let tracked = self.tracker.tracked_projects().await;
        if tracked.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<ProjectId> = tracked.iter().map(|p| p.project_id.clone()).collect();
        let empty = self
            .activity
            .batch_empty_check(&ids)
            .await
            .context("batch empty check failed")?;

        let now = Utc::now();
        let idle: Vec<ProjectId> = tracked
            .into_iter()
            .filter(|project| empty.contains(&project.project_id))
            .filter(|project| {
                now.signed_duration_since(project.youngest_created_at)
                    .to_std()
                    .is_ok_and(|age| age > self.max_session_age)
            })
            .map(|project| project.project_id)
            .collect();

        for project in &idle {
            info!(%project, "evicting idle project");
            (self.evict)(project.clone()).await;
        }
        debug!(checked = ids.len(), evicted = idle.len(), "idle sweep finished");
        Ok(idle)
    }
}

#[derive(Clone)]
pub struct SweepHandle {
    tx: mpsc::Sender<SweepCommand>,
}

impl SweepHandle {
    pub async fn shutdown(&self) {
        let _ = self.tx.send(SweepCommand::Shutdown).await;
    }
}

enum SweepCommand {
    Shutdown,
}

pub fn spawn_sweep_task(sweep: Arc<IdleSweep>, interval: Duration) -> SweepHandle {
    let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
    let handle = SweepHandle { tx };
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                Some(cmd) = rx.recv() => match cmd {
                    SweepCommand::Shutdown => {
                        info!("idle sweep received shutdown signal");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if let Err(err) = sweep.sweep_once().await {
                        warn!(%err, "idle sweep failed");
                    }
                }
            }
        }
    });
    handle
}
