use serde::{Deserialize, Serialize};

use crate::db::LocalStore;
use crate::error::Result;

const SETTINGS_KEY: &str = "settings";

/// Weight each risk flag contributes to the local score. The score is
/// the capped sum over present flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub high_rpm: f64,
    pub many_ips: f64,
    pub high_failure_rate: f64,
    pub ip_rapid_switch: f64,
    pub ip_hopping: f64,
    pub checkin_anomaly: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            high_rpm: 0.25,
            many_ips: 0.20,
            high_failure_rate: 0.20,
            ip_rapid_switch: 0.25,
            ip_hopping: 0.30,
            checkin_anomaly: 0.20,
        }
    }
}

impl ScoreWeights {
    pub fn for_flag(&self, flag: &str) -> f64 {
        match flag {
            "HIGH_RPM" => self.high_rpm,
            "MANY_IPS" => self.many_ips,
            "HIGH_FAILURE_RATE" => self.high_failure_rate,
            "IP_RAPID_SWITCH" => self.ip_rapid_switch,
            "IP_HOPPING" => self.ip_hopping,
            "CHECKIN_ANOMALY" => self.checkin_anomaly,
            _ => 0.0,
        }
    }
}

/// Upstream chat endpoint consulted for verdicts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiEndpointSettings {
    pub enabled: bool,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub custom_prompt: String,
    pub timeout_secs: u64,
    /// Verdicts below this confidence never ban.
    pub min_confidence: f64,
}

impl Default for AiEndpointSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: String::new(),
            api_key: String::new(),
            model: String::new(),
            custom_prompt: String::new(),
            timeout_secs: 30,
            min_confidence: 0.8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiBanSettings {
    pub enabled: bool,
    /// Log intended actions without applying them.
    pub dry_run: bool,
    pub window: String,
    pub scan_limit: usize,
    /// Candidates with fewer requests in the window are never assessed.
    pub min_requests: i64,
    /// Local score at or above this marks a user for action.
    pub ban_threshold: f64,
    pub disable_tokens: bool,
    pub weights: ScoreWeights,
    pub ai: AiEndpointSettings,
}

impl Default for AiBanSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            dry_run: true,
            window: "1h".to_string(),
            scan_limit: 50,
            min_requests: 20,
            ban_threshold: 0.7,
            disable_tokens: false,
            weights: ScoreWeights::default(),
            ai: AiEndpointSettings::default(),
        }
    }
}

impl AiBanSettings {
    pub async fn load(store: &LocalStore) -> Result<Self> {
        match store.aiban_config_get(SETTINGS_KEY).await? {
            Some(raw) => Ok(serde_json::from_str(&raw).unwrap_or_default()),
            None => Ok(Self::default()),
        }
    }

    pub async fn save(&self, store: &LocalStore) -> Result<()> {
        store
            .aiban_config_set(SETTINGS_KEY, &serde_json::to_string(self)?)
            .await
    }

    /// Redacted copy for API responses.
    pub fn public(&self) -> Self {
        let mut out = self.clone();
        if !out.ai.api_key.is_empty() {
            out.ai.api_key = "***".to_string();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::local::test_store;

    #[test]
    fn defaults_are_safe() {
        let s = AiBanSettings::default();
        assert!(!s.enabled);
        assert!(s.dry_run);
        assert!(s.ban_threshold > 0.0);
        assert!(!s.ai.enabled);
    }

    #[test]
    fn weights_cover_every_flag() {
        let w = ScoreWeights::default();
        for flag in [
            "HIGH_RPM",
            "MANY_IPS",
            "HIGH_FAILURE_RATE",
            "IP_RAPID_SWITCH",
            "IP_HOPPING",
            "CHECKIN_ANOMALY",
        ] {
            assert!(w.for_flag(flag) > 0.0, "{flag} has no weight");
        }
        assert_eq!(w.for_flag("UNKNOWN"), 0.0);
    }

    #[tokio::test]
    async fn settings_roundtrip() {
        let store = test_store();
        let loaded = AiBanSettings::load(&store).await.unwrap();
        assert!(!loaded.enabled);

        let mut edited = loaded;
        edited.enabled = true;
        edited.window = "3h".to_string();
        edited.ai.model = "gpt-4o-mini".to_string();
        edited.save(&store).await.unwrap();

        let reloaded = AiBanSettings::load(&store).await.unwrap();
        assert!(reloaded.enabled);
        assert_eq!(reloaded.window, "3h");
        assert_eq!(reloaded.ai.model, "gpt-4o-mini");
    }

    #[test]
    fn public_redacts_the_key() {
        let mut s = AiBanSettings::default();
        s.ai.api_key = "sk-secret".to_string();
        assert_eq!(s.public().ai.api_key, "***");
        assert_eq!(AiBanSettings::default().public().ai.api_key, "");
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: AiBanSettings = serde_json::from_str("{\"enabled\": true}").unwrap();
        assert!(s.enabled);
        assert!(s.dry_run);
        assert_eq!(s.scan_limit, 50);
    }
}
