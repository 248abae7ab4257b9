use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info};

use crate::analytics::Analytics;
use crate::cache::CacheManager;
use crate::error::Result;
use crate::model_status::ModelStatusEngine;
use crate::tasks::TaskManager;

/// Phase names, in execution order.
pub const STEPS: [&str; 8] = [
    "restore",
    "check",
    "leaderboard",
    "dashboard",
    "user_activity",
    "ip_monitoring",
    "ip_distribution",
    "model_status",
];

/// Progress after entering warmup and after each completed phase.
/// Monotone by construction.
const PROGRESS: [u8; 9] = [5, 10, 15, 40, 55, 65, 80, 90, 100];

/// Pacing between calls inside a phase; deliberate DB-load control.
const PHASE_PACING: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Serialize)]
pub struct StepStatus {
    pub name: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WarmupStatus {
    pub status: String,
    pub phase: usize,
    pub progress: u8,
    pub total: usize,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub current_task: String,
    pub message: String,
    pub steps: Vec<StepStatus>,
}

impl WarmupStatus {
    fn pending() -> Self {
        Self {
            status: "pending".to_string(),
            phase: 0,
            progress: 0,
            total: STEPS.len(),
            started_at: None,
            completed_at: None,
            current_task: String::new(),
            message: String::new(),
            steps: STEPS
                .iter()
                .map(|name| StepStatus { name: name.to_string(), status: "pending".to_string() })
                .collect(),
        }
    }
}

/// Warmup progress, written only by the orchestrator and read by any
/// observer. Snapshots clone the steps so readers never alias the
/// internal slice.
pub struct WarmupState {
    inner: RwLock<WarmupStatus>,
}

impl Default for WarmupState {
    fn default() -> Self {
        Self { inner: RwLock::new(WarmupStatus::pending()) }
    }
}

impl WarmupState {
    pub fn snapshot(&self) -> WarmupStatus {
        self.inner.read().unwrap().clone()
    }

    fn begin(&self) {
        let mut status = self.inner.write().unwrap();
        *status = WarmupStatus::pending();
        status.status = "initializing".to_string();
        status.progress = PROGRESS[0];
        status.started_at = Some(chrono::Utc::now().timestamp());
        status.message = "warmup started".to_string();
    }

    fn enter_phase(&self, idx: usize) {
        let mut status = self.inner.write().unwrap();
        status.phase = idx + 1;
        status.current_task = STEPS[idx].to_string();
        status.message = format!("running {}", STEPS[idx]);
    }

    fn finish_phase(&self, idx: usize, ok: bool) {
        let mut status = self.inner.write().unwrap();
        status.steps[idx].status = if ok { "done" } else { "error" }.to_string();
        status.progress = PROGRESS[idx + 1];
    }

    fn complete(&self) {
        let mut status = self.inner.write().unwrap();
        status.status = "ready".to_string();
        status.progress = 100;
        status.completed_at = Some(chrono::Utc::now().timestamp());
        status.current_task = String::new();
        status.message = "warmup complete".to_string();
    }
}

/// Runs the eight warmup phases in sequence. Failing phases are marked
/// and skipped past; the run always reaches `ready` so the service
/// never wedges on a cold cache.
pub struct WarmupOrchestrator {
    analytics: Arc<Analytics>,
    cache: Arc<CacheManager>,
    model_status: Arc<ModelStatusEngine>,
    tasks: TaskManager,
    pub state: Arc<WarmupState>,
}

impl WarmupOrchestrator {
    pub fn new(
        analytics: Arc<Analytics>,
        cache: Arc<CacheManager>,
        model_status: Arc<ModelStatusEngine>,
        tasks: TaskManager,
    ) -> Self {
        Self {
            analytics,
            cache,
            model_status,
            tasks,
            state: Arc::new(WarmupState::default()),
        }
    }

    async fn phase<F>(&self, idx: usize, work: F)
    where
        F: std::future::Future<Output = Result<()>>,
    {
        self.state.enter_phase(idx);
        match work.await {
            Ok(()) => {
                info!(phase = STEPS[idx], "warmup phase done");
                self.state.finish_phase(idx, true);
            }
            Err(e) => {
                error!(phase = STEPS[idx], err = %e, "warmup phase failed");
                self.state.finish_phase(idx, false);
            }
        }
    }

    /// Run all phases. Idempotent: a re-run resets every step and the
    /// completion timestamp before starting over.
    pub async fn run(&self) -> Result<()> {
        self.state.begin();

        self.phase(0, async {
            let restored = self.cache.restore_from_mirror().await?;
            info!(restored, "cache mirror restored");
            Ok(())
        })
        .await;

        self.phase(1, async {
            if !self.cache.probe().await {
                return Err(crate::error::SentinelError::Cache(
                    "cache probe round-trip failed".into(),
                ));
            }
            Ok(())
        })
        .await;

        self.phase(2, async {
            for secs in [86_400i64, 7 * 86_400, 30 * 86_400] {
                self.analytics.leaderboard_window(secs, 50, "COUNT(*)").await?;
                tokio::time::sleep(PHASE_PACING).await;
            }
            Ok(())
        })
        .await;

        self.phase(3, async {
            self.analytics.overview("7d", false).await?;
            for period in ["7d", "24h", "3d"] {
                self.analytics.usage(period).await?;
            }
            self.analytics.model_usage("7d", 20).await?;
            self.analytics.daily_trends(7).await?;
            self.analytics.daily_trends(3).await?;
            self.analytics.top_users("7d", 20).await?;
            self.analytics.hourly_trends(24).await?;
            self.analytics.channels().await?;
            Ok(())
        })
        .await;

        self.phase(4, async {
            if self.analytics.scale_class().await.is_large() {
                self.analytics.prime_user_listings().await?;
            }
            Ok(())
        })
        .await;

        self.phase(5, async {
            for window in ["1h", "24h", "7d"] {
                self.analytics.shared_ips(window, 3, 50).await?;
                self.analytics.multi_ip_tokens(window, 3, 50).await?;
                self.analytics.multi_ip_users(window, 3, 50).await?;
            }
            Ok(())
        })
        .await;

        self.phase(6, async {
            for window in ["1h", "6h", "24h", "7d"] {
                self.analytics.ip_distribution(window).await?;
            }
            Ok(())
        })
        .await;

        self.phase(7, async {
            self.model_status.available_models(true).await?;
            Ok(())
        })
        .await;

        self.state.complete();
        self.tasks.signal_warmup_done();
        Ok(())
    }

    /// Re-run the hot dashboard set; the cache_refresh task's body.
    pub async fn refresh_hot_set(&self) -> Result<()> {
        self.analytics.overview("7d", true).await?;
        for period in ["7d", "24h", "3d"] {
            self.analytics.usage(period).await?;
        }
        self.analytics.model_usage("7d", 20).await?;
        self.analytics.daily_trends(7).await?;
        self.analytics.top_users("7d", 20).await?;
        self.analytics.hourly_trends(24).await?;
        self.analytics.channels().await?;
        for secs in [86_400i64, 7 * 86_400] {
            self.analytics.leaderboard_window(secs, 50, "COUNT(*)").await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_is_pending() {
        let state = WarmupState::default();
        let snap = state.snapshot();
        assert_eq!(snap.status, "pending");
        assert_eq!(snap.progress, 0);
        assert_eq!(snap.steps.len(), 8);
        assert!(snap.steps.iter().all(|s| s.status == "pending"));
        assert!(snap.completed_at.is_none());
    }

    #[test]
    fn progress_is_monotone() {
        for pair in PROGRESS.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        assert_eq!(PROGRESS[PROGRESS.len() - 1], 100);
        assert_eq!(PROGRESS.len(), STEPS.len() + 1);
    }

    #[test]
    fn phase_lifecycle_updates_progress() {
        let state = WarmupState::default();
        state.begin();
        assert_eq!(state.snapshot().status, "initializing");
        assert_eq!(state.snapshot().progress, 5);

        state.enter_phase(0);
        assert_eq!(state.snapshot().current_task, "restore");
        state.finish_phase(0, true);
        assert_eq!(state.snapshot().progress, 10);
        assert_eq!(state.snapshot().steps[0].status, "done");

        state.enter_phase(1);
        state.finish_phase(1, false);
        assert_eq!(state.snapshot().steps[1].status, "error");
        assert_eq!(state.snapshot().progress, 15);

        state.complete();
        let snap = state.snapshot();
        assert_eq!(snap.status, "ready");
        assert_eq!(snap.progress, 100);
        assert!(snap.completed_at.is_some());
    }

    #[test]
    fn rerun_resets_steps() {
        let state = WarmupState::default();
        state.begin();
        for i in 0..8 {
            state.enter_phase(i);
            state.finish_phase(i, true);
        }
        state.complete();
        assert!(state.snapshot().completed_at.is_some());

        state.begin();
        let snap = state.snapshot();
        assert_eq!(snap.status, "initializing");
        assert!(snap.completed_at.is_none());
        assert!(snap.steps.iter().all(|s| s.status == "pending"));
    }

    #[test]
    fn snapshot_is_detached() {
        let state = WarmupState::default();
        let snap = state.snapshot();
        state.begin();
        // The earlier snapshot must not observe the transition.
        assert_eq!(snap.status, "pending");
    }
}
