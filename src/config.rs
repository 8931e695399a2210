//! Engine configuration
//!
//! Environment-backed configuration for the judge engine, installed once at
//! startup and read through a process-wide handle.

use std::sync::OnceLock;
use tracing::warn;

/// Marker appended when captured or emitted text is cut at a cap.
pub const TRUNCATION_MARKER: &str = "...[truncated]";

/// Per-stream capture cap in characters.
pub const MAX_STREAM_CHARS: usize = 64_000;

/// Cap for any single text field landing in the verdict, in characters.
pub const MAX_FIELD_CHARS: usize = 16_000;

/// Largest report artifact the converter will accept, in bytes.
pub const MAX_TRX_BYTES: u64 = 2_000_000;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Container runtime CLI (default: docker)
    pub sandbox_binary: String,
    /// Pinned sandbox image both phases run in
    pub image: String,
    /// Prefix for container names (`<prefix>-restore-<id>`, `<prefix>-test-<id>`)
    pub container_prefix: String,
    /// Non-root uid the sandboxed process runs as
    pub uid: u32,
    /// Non-root gid the sandboxed process runs as
    pub gid: u32,
    /// Wall-clock deadline for the restore phase in seconds
    pub restore_timeout_secs: u64,
    /// Wall-clock deadline for the test phase in seconds
    pub test_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sandbox_binary: "docker".into(),
            image: "mcr.microsoft.com/dotnet/sdk:8.0".into(),
            container_prefix: "tracepoint".into(),
            uid: 1000,
            gid: 1000,
            restore_timeout_secs: 60,
            test_timeout_secs: 6,
        }
    }
}

impl EngineConfig {
    /// Load configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            sandbox_binary: env_or("JUDGE_SANDBOX_BINARY", defaults.sandbox_binary),
            image: env_or("JUDGE_SANDBOX_IMAGE", defaults.image),
            container_prefix: env_or("JUDGE_CONTAINER_PREFIX", defaults.container_prefix),
            uid: env_or_parse("JUDGE_SANDBOX_UID", defaults.uid),
            gid: env_or_parse("JUDGE_SANDBOX_GID", defaults.gid),
            restore_timeout_secs: env_or_parse(
                "JUDGE_RESTORE_TIMEOUT_SECS",
                defaults.restore_timeout_secs,
            ),
            test_timeout_secs: env_or_parse("JUDGE_TEST_TIMEOUT_SECS", defaults.test_timeout_secs),
        }
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_or_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Global engine configuration
static ENGINE_CONFIG: OnceLock<EngineConfig> = OnceLock::new();

/// Install the engine configuration; fails if already installed.
pub fn init_config(config: EngineConfig) -> anyhow::Result<()> {
    ENGINE_CONFIG
        .set(config)
        .map_err(|_| anyhow::anyhow!("Engine configuration already initialized"))
}

/// Get the engine configuration
pub fn get_config() -> &'static EngineConfig {
    ENGINE_CONFIG.get().unwrap_or_else(|| {
        static DEFAULT: OnceLock<EngineConfig> = OnceLock::new();

        warn!("Engine configuration not initialized, using defaults");
        DEFAULT.get_or_init(EngineConfig::default)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.sandbox_binary, "docker");
        assert_eq!(config.container_prefix, "tracepoint");
        assert_eq!(config.restore_timeout_secs, 60);
        assert_eq!(config.test_timeout_secs, 6);
        assert_eq!((config.uid, config.gid), (1000, 1000));
    }

    #[test]
    fn test_get_config_falls_back_to_default() {
        let config = get_config();
        assert_eq!(config.sandbox_binary, EngineConfig::default().sandbox_binary);
    }
}
