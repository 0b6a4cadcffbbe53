use std::env;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Active profile from `SLOTSWAP_PROFILE` (uppercased, empty = default).
pub fn active_profile() -> String {
    env_or("SLOTSWAP_PROFILE", "").to_uppercase()
}

// ── AWS ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AwsConfig {
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    pub endpoint_url: Option<String>,
}

impl AwsConfig {
    /// Build from environment variables (call `load_dotenv()` first).
    pub fn from_env() -> Self {
        Self::from_env_profiled(&active_profile())
    }

    pub fn from_env_profiled(p: &str) -> Self {
        Self {
            region: profiled_env_or(p, "AWS_REGION", "us-east-1"),
            access_key_id: profiled_env_opt(p, "AWS_ACCESS_KEY_ID"),
            secret_access_key: profiled_env_opt(p, "AWS_SECRET_ACCESS_KEY"),
            session_token: profiled_env_opt(p, "AWS_SESSION_TOKEN"),
            endpoint_url: profiled_env_opt(p, "QUEUE_AWS_ENDPOINT_URL"),
        }
    }

    pub fn has_static_credentials(&self) -> bool {
        self.access_key_id.is_some() && self.secret_access_key.is_some()
    }
}

// ── Notification queue ────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub queue_url: String,
    pub dlq_url: Option<String>,
    pub visibility_timeout_secs: u32,
    /// Upper bound for a single long poll (SQS allows at most 20).
    pub wait_time_secs: u32,
}

impl QueueConfig {
    pub fn from_env() -> Self {
        Self::from_env_profiled(&active_profile())
    }

    pub fn from_env_profiled(p: &str) -> Self {
        Self {
            queue_url: profiled_env_or(p, "QUEUE_URL", ""),
            dlq_url: profiled_env_opt(p, "QUEUE_DLQ_URL"),
            visibility_timeout_secs: profiled_env_u32(p, "QUEUE_VISIBILITY_TIMEOUT_SECS", 60),
            wait_time_secs: profiled_env_u32(p, "QUEUE_WAIT_TIME_SECS", 20).min(20),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.queue_url.is_empty()
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_url: String::new(),
            dlq_url: None,
            visibility_timeout_secs: 60,
            wait_time_secs: 20,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiled_lookup_prefers_prefixed_key() {
        // Unique key names so parallel tests never collide.
        env::set_var("SLOTSWAP_TEST_A_REGION_KEY", "plain");
        env::set_var("STAGE_SLOTSWAP_TEST_A_REGION_KEY", "staged");
        assert_eq!(
            profiled_env_or("STAGE", "SLOTSWAP_TEST_A_REGION_KEY", "x"),
            "staged"
        );
        assert_eq!(profiled_env_or("", "SLOTSWAP_TEST_A_REGION_KEY", "x"), "plain");
        assert_eq!(profiled_env_or("", "SLOTSWAP_TEST_A_MISSING", "x"), "x");
    }

    #[test]
    fn queue_config_defaults() {
        let q = QueueConfig::default();
        assert!(!q.is_configured());
        assert_eq!(q.visibility_timeout_secs, 60);
        assert_eq!(q.wait_time_secs, 20);
    }

    #[test]
    fn aws_static_credentials() {
        let mut aws = AwsConfig::default();
        assert!(!aws.has_static_credentials());
        aws.access_key_id = Some("id".into());
        aws.secret_access_key = Some("secret".into());
        assert!(aws.has_static_credentials());
    }
}
