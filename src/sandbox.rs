//! Sandbox command construction
//!
//! Builds the container-runtime argument vectors for the two pipeline phases
//! and provides best-effort cleanup of containers left behind by a timeout.
//! The engine drives the runtime purely through its command-line contract.

use std::path::Path;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::workspace::REPORT_FILE_NAME;

/// Budget for each cleanup command issued after a timeout.
const CLEANUP_BUDGET: Duration = Duration::from_secs(5);

/// Pipeline phase; each maps to one container invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Restore,
    Test,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Restore => "restore",
            Phase::Test => "test",
        }
    }
}

/// Submission-scoped container name: `<prefix>-<phase>-<id>`.
pub fn container_name(config: &EngineConfig, phase: Phase, submission_id: &str) -> String {
    format!(
        "{}-{}-{}",
        config.container_prefix,
        phase.as_str(),
        submission_id
    )
}

/// Argument vector for the restore phase. Networked so dependencies can be
/// fetched; no init process.
pub fn restore_args(
    config: &EngineConfig,
    submission_id: &str,
    work_dir: &Path,
    cache_dir: &Path,
) -> Vec<String> {
    let mut args = common_args(config, Phase::Restore, submission_id, work_dir, cache_dir);
    args.push(config.image.clone());
    args.extend(["dotnet", "restore"].map(String::from));
    args
}

/// Argument vector for the test phase. Network disabled, an init process as
/// PID 1 to reap zombies, and the report artifact directed to the fixed name
/// the locator looks for.
pub fn test_args(
    config: &EngineConfig,
    submission_id: &str,
    work_dir: &Path,
    cache_dir: &Path,
) -> Vec<String> {
    let mut args = common_args(config, Phase::Test, submission_id, work_dir, cache_dir);
    args.push(config.image.clone());
    args.extend(["dotnet", "test", "--no-restore", "--logger"].map(String::from));
    args.push(format!("trx;LogFileName={}", REPORT_FILE_NAME));
    args
}

fn common_args(
    config: &EngineConfig,
    phase: Phase,
    submission_id: &str,
    work_dir: &Path,
    cache_dir: &Path,
) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        container_name(config, phase, submission_id),
    ];

    if phase == Phase::Test {
        args.push("--network".to_string());
        args.push("none".to_string());
        args.push("--init".to_string());
    }

    args.extend([
        "--user".to_string(),
        format!("{}:{}", config.uid, config.gid),
        "--cpus=1".to_string(),
        // Swap stays disabled: memory and memory-swap are pinned equal.
        "--memory=512m".to_string(),
        "--memory-swap=512m".to_string(),
        "--pids-limit=128".to_string(),
        "-v".to_string(),
        format!("{}:/workspace", work_dir.display()),
        "-v".to_string(),
        format!("{}:/nuget", cache_dir.display()),
        "-e".to_string(),
        "NUGET_PACKAGES=/nuget".to_string(),
        "-e".to_string(),
        "DOTNET_SKIP_WORKLOAD_INTEGRITY_CHECK=1".to_string(),
        "-e".to_string(),
        "DOTNET_CLI_TELEMETRY_OPTOUT=1".to_string(),
        "-e".to_string(),
        "DOTNET_NOLOGO=1".to_string(),
        "-w".to_string(),
        "/workspace".to_string(),
    ]);

    args
}

/// Best-effort teardown of a container left behind by a timed-out phase.
/// Issues kill then forced remove by name; every failure is logged and
/// swallowed.
pub async fn cleanup_container(config: &EngineConfig, name: &str) {
    for cleanup_args in [vec!["kill", name], vec!["rm", "-f", name]] {
        let invocation = format!("{} {}", config.sandbox_binary, cleanup_args.join(" "));
        let result = tokio::time::timeout(
            CLEANUP_BUDGET,
            Command::new(&config.sandbox_binary)
                .args(&cleanup_args)
                .output(),
        )
        .await;

        match result {
            Ok(Ok(output)) if output.status.success() => {
                debug!("Container cleanup succeeded: {}", invocation);
            }
            Ok(Ok(output)) => {
                debug!(
                    "Container cleanup exited with {}: {}",
                    output.status, invocation
                );
            }
            Ok(Err(e)) => {
                warn!("Container cleanup failed to run ({}): {}", invocation, e);
            }
            Err(_) => {
                warn!(
                    "Container cleanup did not finish within {:?}: {}",
                    CLEANUP_BUDGET, invocation
                );
            }
        }
    }
}
