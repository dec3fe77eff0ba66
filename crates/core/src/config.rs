use std::env;
use std::path::PathBuf;

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
pub fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

pub fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

pub fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

pub fn profiled_env_usize(profile: &str, key: &str, default: usize) -> usize {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

/// Process-level settings shared by every binary in the workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    /// Directory for journals and checkpoints.
    pub data_dir: PathBuf,
    /// Edit log file. Defaults to `{data_dir}/routine_load.journal`.
    pub journal_path: PathBuf,
    /// Cluster used when a job definition does not name one.
    pub default_cluster: String,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `ROUTINE_LOAD_PROFILE`. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("ROUTINE_LOAD_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        let data_dir = PathBuf::from(profiled_env_or(p, "DATA_DIR", "data"));
        let journal_path = profiled_env_opt(p, "JOURNAL_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("routine_load.journal"));
        Self {
            profile: p.to_string(),
            data_dir,
            journal_path,
            default_cluster: profiled_env_or(p, "DEFAULT_CLUSTER", "default_cluster"),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  data_dir:  {}", self.data_dir.display());
        tracing::info!("  journal:   {}", self.journal_path.display());
        tracing::info!("  cluster:   {}", self.default_cluster);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn journal_defaults_under_data_dir() {
        // Profile name chosen so no real env var can shadow it.
        let config = Config::for_profile("ZZ_CORE_CONFIG_TEST");
        assert_eq!(config.profile, "ZZ_CORE_CONFIG_TEST");
        assert_eq!(config.journal_path, config.data_dir.join("routine_load.journal"));
    }

    #[test]
    fn profiled_lookup_prefers_prefixed_key() {
        env::set_var("ZZ_PREFIX_TEST_ROUTINE_KEY", "prefixed");
        env::set_var("ROUTINE_KEY_UNPREFIXED_ONLY", "plain");
        assert_eq!(
            profiled_env_opt("ZZ_PREFIX_TEST", "ROUTINE_KEY"),
            Some("prefixed".to_string())
        );
        assert_eq!(
            profiled_env_or("ZZ_PREFIX_TEST", "ROUTINE_KEY_UNPREFIXED_ONLY", "fallback"),
            "plain"
        );
        assert_eq!(profiled_env_u64("ZZ_PREFIX_TEST", "ROUTINE_KEY_MISSING", 9), 9);
    }

    #[test]
    fn profile_label_defaults() {
        let config = Config::for_profile("");
        assert_eq!(config.profile_label(), "default");
    }
}
