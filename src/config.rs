//! Orchestrator tunables with environment overrides.

use std::time::Duration;

/// Timeouts and TTLs governing one deployment of the orchestrator.
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// How long a checkpoint survives without being refreshed.
    pub checkpoint_ttl: Duration,
    /// Session lock TTL; the crash backstop for release.
    pub lock_ttl: Duration,
    /// How long an acquirer waits on a held lock before giving up.
    pub lock_wait: Duration,
    /// Per tool call execution timeout.
    pub tool_timeout: Duration,
    /// How long cached responses serve idempotent replays.
    pub response_cache_ttl: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            checkpoint_ttl: Duration::from_secs(24 * 60 * 60),
            lock_ttl: Duration::from_secs(60),
            lock_wait: Duration::from_secs(5),
            tool_timeout: Duration::from_secs(30),
            response_cache_ttl: Duration::from_secs(60 * 60),
        }
    }
}

impl OrchestratorConfig {
    /// Defaults overlaid with `TURNLOOM_*` environment variables, loading a
    /// `.env` file when present. Values are whole seconds; unparseable
    /// values fall back to the default.
    #[must_use]
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut config = Self::default();
        config.checkpoint_ttl = env_secs("TURNLOOM_CHECKPOINT_TTL_SECS", config.checkpoint_ttl);
        config.lock_ttl = env_secs("TURNLOOM_LOCK_TTL_SECS", config.lock_ttl);
        config.lock_wait = env_secs("TURNLOOM_LOCK_WAIT_SECS", config.lock_wait);
        config.tool_timeout = env_secs("TURNLOOM_TOOL_TIMEOUT_SECS", config.tool_timeout);
        config.response_cache_ttl =
            env_secs("TURNLOOM_RESPONSE_CACHE_TTL_SECS", config.response_cache_ttl);
        config
    }

    #[must_use]
    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }
}

fn env_secs(var: &str, default: Duration) -> Duration {
    std::env::var(var)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}
