use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

use crate::error::Result;

pub type TaskHandler = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub name: String,
    pub interval_secs: u64,
    pub running: bool,
    pub last_run: Option<i64>,
    pub last_error: Option<String>,
}

struct TaskInner {
    tasks: RwLock<HashMap<String, TaskStatus>>,
    warmup_tx: watch::Sender<bool>,
    shutdown_tx: broadcast::Sender<()>,
}

/// Interval scheduler for background work. Every task runs in its own
/// tokio task: an immediate first run, then fixed-interval ticks until
/// shutdown. Handler errors and panics are recorded in `last_error` and
/// never stop the ticker.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<TaskInner>,
}

impl TaskManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>) -> Self {
        let (warmup_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(TaskInner {
                tasks: RwLock::new(HashMap::new()),
                warmup_tx,
                shutdown_tx,
            }),
        }
    }

    /// Schedule a task that starts immediately.
    pub fn register(&self, name: &str, interval: Duration, handler: TaskHandler) {
        self.inner.insert_status(name, interval);
        let inner = self.inner.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            run_loop(inner, name, interval, handler, false).await;
        });
    }

    /// Schedule a task that waits for the warmup-done signal before its
    /// first run.
    pub fn start_after_warmup(&self, name: &str, interval: Duration, handler: TaskHandler) {
        self.inner.insert_status(name, interval);
        let inner = self.inner.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            run_loop(inner, name, interval, handler, true).await;
        });
    }

    /// Unblock every `start_after_warmup` task. Safe to call more than
    /// once.
    pub fn signal_warmup_done(&self) {
        self.inner.warmup_tx.send_replace(true);
        info!("warmup-done signalled");
    }

    pub fn warmup_signalled(&self) -> bool {
        *self.inner.warmup_tx.borrow()
    }

    pub fn get_status(&self) -> Vec<TaskStatus> {
        let mut list: Vec<TaskStatus> =
            self.inner.tasks.read().unwrap().values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }
}

impl TaskInner {
    fn insert_status(&self, name: &str, interval: Duration) {
        self.tasks.write().unwrap().insert(
            name.to_string(),
            TaskStatus {
                name: name.to_string(),
                interval_secs: interval.as_secs(),
                running: false,
                last_run: None,
                last_error: None,
            },
        );
    }
}

async fn run_loop(
    inner: Arc<TaskInner>,
    name: String,
    interval: Duration,
    handler: TaskHandler,
    gated: bool,
) {
    let mut shutdown = inner.shutdown_tx.subscribe();

    if gated {
        let mut rx = inner.warmup_tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                break;
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = shutdown.recv() => {
                    info!(task = %name, "shutdown before warmup gate opened");
                    return;
                }
            }
        }
    }

    let mut ticker = tokio::time::interval(interval);
    // First tick fires immediately, which doubles as the immediate
    // first run.
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_once(&inner, &name, &handler).await;
            }
            _ = shutdown.recv() => {
                info!(task = %name, "task loop stopped");
                return;
            }
        }
    }
}

async fn run_once(inner: &TaskInner, name: &str, handler: &TaskHandler) {
    if let Some(status) = inner.tasks.write().unwrap().get_mut(name) {
        status.running = true;
    }

    // The handler runs in its own tokio task so a panic surfaces as a
    // JoinError instead of tearing down the ticker loop.
    let outcome = tokio::spawn(handler()).await;
    let last_error = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => {
            warn!(task = name, err = %e, "task run failed");
            Some(e.to_string())
        }
        Err(join_err) if join_err.is_panic() => {
            error!(task = name, "task panicked");
            Some("panicked".to_string())
        }
        Err(_) => Some("cancelled".to_string()),
    };

    if let Some(status) = inner.tasks.write().unwrap().get_mut(name) {
        status.running = false;
        status.last_run = Some(chrono::Utc::now().timestamp());
        status.last_error = last_error;
    }
}

/// Convenience wrapper building a `TaskHandler` from an async closure
/// factory.
pub fn handler<F, Fut>(f: F) -> TaskHandler
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()) as BoxFuture<'static, Result<()>>)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager() -> TaskManager {
        let (tx, _) = broadcast::channel(1);
        TaskManager::new(tx)
    }

    #[tokio::test]
    async fn immediate_first_run() {
        let mgr = manager();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        mgr.register(
            "tick",
            Duration::from_secs(3600),
            handler(move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let status = mgr.get_status();
        assert_eq!(status.len(), 1);
        assert!(status[0].last_run.is_some());
        assert!(status[0].last_error.is_none());
    }

    #[tokio::test]
    async fn errors_are_recorded_and_do_not_stop_the_loop() {
        let mgr = manager();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        mgr.register(
            "flaky",
            Duration::from_millis(50),
            handler(move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(crate::error::SentinelError::Cache("boom".into()))
                }
            }),
        );
        tokio::time::sleep(Duration::from_millis(180)).await;
        assert!(counter.load(Ordering::SeqCst) >= 2, "ticker kept going");
        let status = mgr.get_status();
        assert_eq!(status[0].last_error.as_deref(), Some("cache error: boom"));
    }

    #[tokio::test]
    async fn panics_are_contained() {
        let mgr = manager();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        mgr.register(
            "panicky",
            Duration::from_millis(50),
            handler(move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    panic!("kaboom");
                }
            }),
        );
        tokio::time::sleep(Duration::from_millis(180)).await;
        assert!(counter.load(Ordering::SeqCst) >= 2);
        assert_eq!(mgr.get_status()[0].last_error.as_deref(), Some("panicked"));
    }

    #[tokio::test]
    async fn gated_tasks_wait_for_warmup() {
        let mgr = manager();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        mgr.start_after_warmup(
            "gated",
            Duration::from_secs(3600),
            handler(move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0, "must not run before the signal");

        mgr.signal_warmup_done();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn signal_is_idempotent() {
        let mgr = manager();
        mgr.signal_warmup_done();
        mgr.signal_warmup_done();
        assert!(mgr.warmup_signalled());
    }

    #[tokio::test]
    async fn shutdown_stops_loops() {
        let (tx, _) = broadcast::channel(1);
        let mgr = TaskManager::new(tx.clone());
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        mgr.register(
            "stoppable",
            Duration::from_millis(40),
            handler(move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
        tokio::time::sleep(Duration::from_millis(60)).await;
        let _ = tx.send(());
        tokio::time::sleep(Duration::from_millis(60)).await;
        let after_shutdown = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(counter.load(Ordering::SeqCst), after_shutdown);
    }
}
