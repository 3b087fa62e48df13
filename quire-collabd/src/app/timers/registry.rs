use crate::domain::connection::ConnectionId;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Auth,
    Disconnect,
    Message,
    HealthCheck,
    /// Keyed by the operation id of the in-flight tool operation.
    ToolOperation(String),
}

struct TimerEntry {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct TimerTable {
    next_generation: u64,
    timers: HashMap<(ConnectionId, TimerKind), TimerEntry>,
}

/// Named timeouts per connection. Starting a timer replaces the live one
/// of the same kind; an expired timer removes itself before its callback runs.
#[derive(Clone, Default)]
pub struct TimerRegistry {
    table: Arc<Mutex<TimerTable>>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start<F>(&self, connection: ConnectionId, kind: TimerKind, after: Duration, on_expire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let key = (connection, kind);
        let mut table = self.table.lock().expect("timer registry poisoned");
        table.next_generation += 1;
        let generation = table.next_generation;

        let shared = Arc::clone(&self.table);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            time::sleep(after).await;
            {
                let mut table = shared.lock().expect("timer registry poisoned");
                match table.timers.get(&task_key) {
                    Some(entry) if entry.generation == generation => {
                        table.timers.remove(&task_key);
                    }
                    _ => return,
                }
            }
            on_expire.await;
        });

        if let Some(previous) = table.timers.insert(key, TimerEntry { generation, handle }) {
            previous.handle.abort();
        }
    }

    pub fn stop(&self, connection: ConnectionId, kind: &TimerKind) -> bool {
        let mut table = self.table.lock().expect("timer registry poisoned");
        match table.timers.remove(&(connection, kind.clone())) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self, connection: ConnectionId) -> usize {
        let mut table = self.table.lock().expect("timer registry poisoned");
        let keys: Vec<_> = table
            .timers
            .keys()
            .filter(|(owner, _)| *owner == connection)
            .cloned()
            .collect();
        for key in &keys {
            if let Some(entry) = table.timers.remove(key) {
                entry.handle.abort();
            }
        }
        keys.len()
    }

    pub fn is_active(&self, connection: ConnectionId, kind: &TimerKind) -> bool {
        self.table
            .lock()
            .expect("timer registry poisoned")
            .timers
            .contains_key(&(connection, kind.clone()))
    }

    pub fn active_count(&self, connection: ConnectionId) -> usize {
        self.table
            .lock()
            .expect("timer registry poisoned")
            .timers
            .keys()
            .filter(|(owner, _)| *owner == connection)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: &Arc<AtomicUsize>) -> impl Future<Output = ()> + Send + 'static {
        let counter = Arc::clone(counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn expired_timer_fires_once_and_clears_itself() {
        let registry = TimerRegistry::new();
        let connection = ConnectionId::new();
        let fired = Arc::new(AtomicUsize::new(0));
        registry.start(connection, TimerKind::Auth, Duration::from_secs(5), counting(&fired));
        assert!(registry.is_active(connection, &TimerKind::Auth));

        time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!registry.is_active(connection, &TimerKind::Auth));
    }

    #[tokio::test(start_paused = true)]
    async fn starting_same_kind_replaces_previous_timer() {
        let registry = TimerRegistry::new();
        let connection = ConnectionId::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        registry.start(connection, TimerKind::Message, Duration::from_secs(5), counting(&first));
        registry.start(connection, TimerKind::Message, Duration::from_secs(10), counting(&second));
        assert_eq!(registry.active_count(connection), 1);

        time::sleep(Duration::from_secs(11)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_and_stop_all_cancel_pending_callbacks() {
        let registry = TimerRegistry::new();
        let connection = ConnectionId::new();
        let other = ConnectionId::new();
        let fired = Arc::new(AtomicUsize::new(0));
        registry.start(connection, TimerKind::Auth, Duration::from_secs(1), counting(&fired));
        registry.start(connection, TimerKind::Message, Duration::from_secs(1), counting(&fired));
        registry.start(
            connection,
            TimerKind::ToolOperation("c1:1".into()),
            Duration::from_secs(1),
            counting(&fired),
        );
        registry.start(other, TimerKind::Auth, Duration::from_secs(1), counting(&fired));

        assert!(registry.stop(connection, &TimerKind::Auth));
        assert!(!registry.stop(connection, &TimerKind::Auth));
        assert_eq!(registry.stop_all(connection), 2);
        assert_eq!(registry.active_count(connection), 0);

        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
