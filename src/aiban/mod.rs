use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::analytics::{window_seconds, Analytics, UserFeatures};
use crate::db::{GatewayDb, LocalStore, SqlValue};
use crate::error::{Result, SentinelError};

pub mod settings;
pub mod verdict;

pub use settings::AiBanSettings;
pub use verdict::{ApiHealth, ChatApi, OpenAiChat, Verdict};

/// What the pipeline decided for one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Skip,
    SkippedWhitelist,
    Kept,
    WouldBan,
    Ban,
}

/// Rule-based score plus optional AI verdict driving automated bans.
///
/// Scan state machine: idle -> scanning -> per candidate
/// (feature-extract -> local-score -> optional AI verdict -> decision ->
/// audit write) -> done. One scan runs at a time.
pub struct AiBanPipeline {
    analytics: Arc<Analytics>,
    db: Arc<GatewayDb>,
    local: LocalStore,
    settings: RwLock<AiBanSettings>,
    pub health: ApiHealth,
    scanning: AtomicBool,
}

struct ScanGuard<'a>(&'a AtomicBool);

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn local_score(settings: &AiBanSettings, features: &UserFeatures) -> f64 {
    let sum: f64 = features
        .flags
        .iter()
        .map(|flag| settings.weights.for_flag(flag))
        .sum();
    sum.min(1.0)
}

fn decide(
    settings: &AiBanSettings,
    features: &UserFeatures,
    score: f64,
    verdict: Option<&Verdict>,
) -> Action {
    if score < settings.ban_threshold {
        return Action::Skip;
    }
    if features.whitelisted {
        return Action::SkippedWhitelist;
    }
    if settings.dry_run {
        return Action::WouldBan;
    }
    match verdict {
        Some(v) => {
            if v.is_ban() && v.confidence >= settings.ai.min_confidence {
                Action::Ban
            } else {
                Action::Kept
            }
        }
        None => Action::Ban,
    }
}

fn verdict_prompts(settings: &AiBanSettings, features: &UserFeatures) -> (String, String) {
    let system = "You review LLM-gateway usage features and decide whether an account is \
                  abusive. Respond with a single JSON object: \
                  {\"decision\": \"ban\" | \"keep\", \"confidence\": 0.0-1.0, \"reason\": \"...\"}."
        .to_string();
    let mut user = serde_json::to_string_pretty(features).unwrap_or_default();
    if !settings.ai.custom_prompt.is_empty() {
        user = format!("{}\n\n{}", settings.ai.custom_prompt, user);
    }
    (system, user)
}

impl AiBanPipeline {
    pub async fn new(
        analytics: Arc<Analytics>,
        db: Arc<GatewayDb>,
        local: LocalStore,
    ) -> Result<Self> {
        let settings = AiBanSettings::load(&local).await?;
        Ok(Self {
            analytics,
            db,
            local,
            settings: RwLock::new(settings),
            health: ApiHealth::default(),
            scanning: AtomicBool::new(false),
        })
    }

    pub async fn settings(&self) -> AiBanSettings {
        self.settings.read().await.clone()
    }

    pub async fn update_settings(&self, mut new: AiBanSettings) -> Result<()> {
        // A redacted key in the payload means "keep the stored one".
        if new.ai.api_key == "***" {
            new.ai.api_key = self.settings.read().await.ai.api_key.clone();
        }
        new.save(&self.local).await?;
        *self.settings.write().await = new;
        Ok(())
    }

    async fn ai_verdict(
        &self,
        settings: &AiBanSettings,
        features: &UserFeatures,
    ) -> Option<Verdict> {
        if !settings.ai.enabled || self.health.is_paused() {
            return None;
        }
        let client = match OpenAiChat::from_settings(&settings.ai) {
            Ok(c) => c,
            Err(e) => {
                warn!(err = %e, "verdict client misconfigured");
                return None;
            }
        };
        let (system, user) = verdict_prompts(settings, features);
        match client.chat(&system, &user).await {
            Ok(text) => match verdict::parse_verdict(&text) {
                Ok(v) => {
                    self.health.record_success();
                    Some(v)
                }
                Err(e) => {
                    warn!(user_id = features.user_id, err = %e, "verdict unparseable");
                    self.health.record_failure();
                    None
                }
            },
            Err(e) => {
                warn!(user_id = features.user_id, err = %e, "verdict call failed");
                self.health.record_failure();
                None
            }
        }
    }

    /// Assess one user without applying any action.
    pub async fn assess(&self, user_id: i64, window: Option<&str>) -> Result<Value> {
        let settings = self.settings().await;
        let window_name = window.unwrap_or(&settings.window);
        let secs = window_seconds(window_name)
            .ok_or_else(|| SentinelError::InvalidParam(format!("unknown window: {window_name}")))?;

        let features = self.analytics.user_features(user_id, secs).await?;
        let score = local_score(&settings, &features);
        let verdict = if score >= settings.ban_threshold {
            self.ai_verdict(&settings, &features).await
        } else {
            None
        };

        Ok(json!({
            "features": features,
            "risk_score": score,
            "ban_threshold": settings.ban_threshold,
            "verdict": verdict,
            "would_ban": decide(&settings, &features, score, verdict.as_ref())
                != Action::Skip,
        }))
    }

    /// Run a full scan. Only one scan runs at a time; a second request
    /// while scanning is a conflict.
    pub async fn scan(
        &self,
        window: Option<&str>,
        limit: Option<usize>,
        operator: &str,
    ) -> Result<Value> {
        let settings = self.settings().await;
        if !settings.enabled {
            return Err(SentinelError::Conflict("AI ban pipeline is disabled".into()));
        }
        if self.scanning.swap(true, Ordering::SeqCst) {
            return Err(SentinelError::Conflict("a scan is already running".into()));
        }
        let _guard = ScanGuard(&self.scanning);

        let window_name = window.unwrap_or(&settings.window).to_string();
        let secs = window_seconds(&window_name)
            .ok_or_else(|| SentinelError::InvalidParam(format!("unknown window: {window_name}")))?;
        let limit = limit.unwrap_or(settings.scan_limit);
        let scan_id = Uuid::new_v4().to_string();
        let started = std::time::Instant::now();

        info!(scan_id = %scan_id, window = %window_name, limit, dry_run = settings.dry_run, "ban scan started");

        let candidates = self.analytics.suspicious_users(secs, limit).await?;
        let candidates = candidates.as_array().cloned().unwrap_or_default();

        let mut scanned = 0usize;
        let mut flagged = 0usize;
        let mut banned = 0usize;
        let mut would_ban = 0usize;
        let mut whitelisted = 0usize;
        let mut kept = 0usize;

        for candidate in &candidates {
            let user_id = candidate["user_id"].as_i64().unwrap_or(0);
            let requests = candidate["request_count"].as_i64().unwrap_or(0);
            if user_id == 0 || requests < settings.min_requests {
                continue;
            }
            scanned += 1;

            let features = match self.analytics.user_features(user_id, secs).await {
                Ok(f) => f,
                Err(e) => {
                    warn!(user_id, err = %e, "feature extraction failed");
                    continue;
                }
            };
            let score = local_score(&settings, &features);
            if score < settings.ban_threshold {
                continue;
            }
            flagged += 1;

            let verdict = if settings.dry_run {
                None
            } else {
                self.ai_verdict(&settings, &features).await
            };
            let action = decide(&settings, &features, score, verdict.as_ref());

            let details = json!({
                "flags": features.flags,
                "requests_per_minute": features.requests_per_minute,
                "unique_ips": features.unique_ips,
                "failure_rate": features.failure_rate,
                "verdict": verdict,
                "window": window_name,
            })
            .to_string();

            match action {
                Action::Skip => {}
                Action::SkippedWhitelist => {
                    whitelisted += 1;
                    self.local
                        .audit_insert(
                            &scan_id,
                            "skipped_whitelist",
                            user_id,
                            &features.username,
                            &details,
                            operator,
                            score,
                        )
                        .await?;
                }
                Action::Kept => {
                    kept += 1;
                    self.local
                        .audit_insert(
                            &scan_id,
                            "kept",
                            user_id,
                            &features.username,
                            &details,
                            operator,
                            score,
                        )
                        .await?;
                }
                Action::WouldBan => {
                    would_ban += 1;
                    self.local
                        .audit_insert(
                            &scan_id,
                            "would_ban",
                            user_id,
                            &features.username,
                            &details,
                            operator,
                            score,
                        )
                        .await?;
                }
                Action::Ban => {
                    let applied = self
                        .apply_ban(user_id, settings.disable_tokens)
                        .await
                        .unwrap_or_else(|e| {
                            warn!(user_id, err = %e, "ban failed");
                            false
                        });
                    if applied {
                        banned += 1;
                        self.local
                            .audit_insert(
                                &scan_id,
                                "banned",
                                user_id,
                                &features.username,
                                &details,
                                operator,
                                score,
                            )
                            .await?;
                    }
                }
            }
        }

        let report = json!({
            "scan_id": scan_id,
            "window": window_name,
            "dry_run": settings.dry_run,
            "candidates": candidates.len(),
            "scanned": scanned,
            "flagged": flagged,
            "banned": banned,
            "would_ban": would_ban,
            "skipped_whitelist": whitelisted,
            "kept": kept,
            "duration_ms": started.elapsed().as_millis() as u64,
        });
        info!(scan_id = %report["scan_id"].as_str().unwrap_or(""), banned, would_ban, "ban scan finished");
        Ok(report)
    }

    /// Scheduler entry point: swallow the disabled/busy conflicts.
    pub async fn run_periodic_scan(&self) -> Result<()> {
        match self.scan(None, None, "scheduler").await {
            Ok(_) => Ok(()),
            Err(SentinelError::Conflict(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Gateway-side ban. The status update and token disable share one
    /// transaction; the audit row lands in the local store afterwards.
    async fn apply_ban(&self, user_id: i64, disable_tokens: bool) -> Result<bool> {
        let mut tx = self.db.begin().await?;
        let affected = tx
            .execute(
                "UPDATE users SET status = 2 WHERE id = ? AND status = 1",
                &[SqlValue::Int(user_id)],
            )
            .await?;
        if affected == 1 && disable_tokens {
            tx.execute(
                "UPDATE tokens SET status = 3 WHERE user_id = ? AND status = 1",
                &[SqlValue::Int(user_id)],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(affected == 1)
    }

    /// Manual ban from the admin surface.
    pub async fn ban_user(&self, user_id: i64, reason: &str, operator: &str) -> Result<bool> {
        let settings = self.settings().await;
        let applied = self.apply_ban(user_id, settings.disable_tokens).await?;
        let action = if applied { "banned" } else { "already_banned" };
        self.local
            .audit_insert("manual", action, user_id, "", reason, operator, 0.0)
            .await?;
        Ok(applied)
    }

    pub async fn unban_user(&self, user_id: i64, operator: &str) -> Result<bool> {
        let mut tx = self.db.begin().await?;
        let affected = tx
            .execute(
                "UPDATE users SET status = 1 WHERE id = ? AND status = 2",
                &[SqlValue::Int(user_id)],
            )
            .await?;
        tx.commit().await?;
        self.local
            .audit_insert("manual", "unbanned", user_id, "", "", operator, 0.0)
            .await?;
        Ok(affected == 1)
    }

    /// Probe the configured endpoint with a trivial prompt.
    pub async fn test_connection(&self) -> Result<Value> {
        let settings = self.settings().await;
        let client = OpenAiChat::from_settings(&settings.ai)?;
        let started = std::time::Instant::now();
        let reply = client
            .chat("You are a health check. Reply with the single word: ok", "ping")
            .await?;
        Ok(json!({
            "ok": true,
            "model": settings.ai.model,
            "reply": reply.chars().take(100).collect::<String>(),
            "latency_ms": started.elapsed().as_millis() as u64,
        }))
    }

    pub fn reset_api_health(&self) {
        self.health.reset();
    }

    pub fn api_health_status(&self) -> Value {
        json!({
            "paused": self.health.is_paused(),
            "consecutive_failures": self.health.failures(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features_with_flags(flags: &[&str], whitelisted: bool) -> UserFeatures {
        UserFeatures {
            user_id: 1,
            username: "tester".into(),
            window_seconds: 3600,
            total_requests: 100,
            success_requests: 60,
            failure_requests: 40,
            failure_rate: 0.4,
            empty_rate: 0.0,
            requests_per_minute: 8.0,
            avg_quota_per_request: 10.0,
            avg_use_time: 500.0,
            quota_used: 1000,
            unique_ips: 12,
            unique_tokens: 3,
            flags: flags.iter().map(|s| s.to_string()).collect(),
            whitelisted,
            checkin_count: 0,
        }
    }

    #[test]
    fn score_sums_flag_weights_and_caps() {
        let settings = AiBanSettings::default();
        let f = features_with_flags(&["HIGH_RPM", "MANY_IPS"], false);
        let score = local_score(&settings, &f);
        assert!((score - 0.45).abs() < 1e-9);

        let all = features_with_flags(
            &["HIGH_RPM", "MANY_IPS", "HIGH_FAILURE_RATE", "IP_RAPID_SWITCH", "IP_HOPPING", "CHECKIN_ANOMALY"],
            false,
        );
        assert_eq!(local_score(&settings, &all), 1.0);

        let none = features_with_flags(&[], false);
        assert_eq!(local_score(&settings, &none), 0.0);
    }

    #[test]
    fn low_score_skips() {
        let settings = AiBanSettings::default();
        let f = features_with_flags(&["HIGH_RPM"], false);
        assert_eq!(decide(&settings, &f, 0.25, None), Action::Skip);
    }

    #[test]
    fn whitelist_overrides_everything() {
        let settings = AiBanSettings::default();
        let f = features_with_flags(&["HIGH_RPM", "IP_HOPPING", "MANY_IPS"], true);
        assert_eq!(decide(&settings, &f, 1.0, None), Action::SkippedWhitelist);
    }

    #[test]
    fn dry_run_only_records() {
        let settings = AiBanSettings::default();
        assert!(settings.dry_run);
        let f = features_with_flags(&["HIGH_RPM", "IP_HOPPING", "MANY_IPS"], false);
        assert_eq!(decide(&settings, &f, 0.9, None), Action::WouldBan);
    }

    #[test]
    fn live_mode_without_ai_bans_on_score() {
        let mut settings = AiBanSettings::default();
        settings.dry_run = false;
        let f = features_with_flags(&["HIGH_RPM", "IP_HOPPING", "MANY_IPS"], false);
        assert_eq!(decide(&settings, &f, 0.9, None), Action::Ban);
    }

    #[test]
    fn ai_verdict_gates_the_ban() {
        let mut settings = AiBanSettings::default();
        settings.dry_run = false;
        settings.ai.min_confidence = 0.8;
        let f = features_with_flags(&["HIGH_RPM", "IP_HOPPING", "MANY_IPS"], false);

        let confident_ban = Verdict {
            decision: "ban".into(),
            confidence: 0.95,
            reason: "abuse".into(),
        };
        assert_eq!(decide(&settings, &f, 0.9, Some(&confident_ban)), Action::Ban);

        let hesitant_ban = Verdict {
            decision: "ban".into(),
            confidence: 0.5,
            reason: "maybe".into(),
        };
        assert_eq!(decide(&settings, &f, 0.9, Some(&hesitant_ban)), Action::Kept);

        let keep = Verdict { decision: "keep".into(), confidence: 0.99, reason: "fine".into() };
        assert_eq!(decide(&settings, &f, 0.9, Some(&keep)), Action::Kept);
    }

    #[test]
    fn prompts_embed_features_and_custom_prompt() {
        let mut settings = AiBanSettings::default();
        settings.ai.custom_prompt = "Our users often share lab machines.".into();
        let f = features_with_flags(&["HIGH_RPM"], false);
        let (system, user) = verdict_prompts(&settings, &f);
        assert!(system.contains("JSON"));
        assert!(user.starts_with("Our users often share lab machines."));
        assert!(user.contains("\"requests_per_minute\""));
        assert!(user.contains("HIGH_RPM"));
    }
}
