//! Submission pipeline
//!
//! Drives one submission through workspace provisioning, the two sandboxed
//! phases, artifact discovery, and report conversion. Every failure mode is
//! recovered into exactly one canonical verdict; the pipeline never returns
//! an error, only a document and an exit code.

use std::path::Path;
use std::time::Duration;

use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::{get_config, EngineConfig, MAX_TRX_BYTES};
use crate::executor::{CommandRunner, ProcessOutcome};
use crate::report;
use crate::sandbox::{self, Phase};
use crate::verdict::{self, Status};
use crate::workspace::{self, WorkspacePaths, REPORT_FILE_NAME};

/// Output signatures indicating the sandbox killed the run for resource
/// exhaustion. Matched case-insensitively against stderr plus stdout.
const RESOURCE_LIMIT_NEEDLES: [&str; 5] = [
    "out of memory",
    "outofmemoryexception",
    "killed",
    "test host process crashed",
    "test run aborted",
];

/// Exit code the sandbox reports when the kernel OOM killer fires.
const OOM_EXIT_CODE: i32 = 137;

/// Heuristic for a run that died to a resource limit without leaving a
/// report behind.
pub fn looks_resource_limited(outcome: &ProcessOutcome) -> bool {
    if outcome.exit_code == OOM_EXIT_CODE {
        return true;
    }
    let haystack = format!("{}\n{}", outcome.stderr, outcome.stdout).to_lowercase();
    RESOURCE_LIMIT_NEEDLES
        .iter()
        .any(|needle| haystack.contains(needle))
}

/// Judge one submission. Resolves the repository root from the current
/// directory, then runs restore, test, locate, and convert. Always returns
/// exactly one verdict document plus the process exit code.
pub async fn run_submission(
    runner: &dyn CommandRunner,
    submission_id: &str,
    keep: bool,
) -> (Value, i32) {
    let workspace = workspace::create_workspace(submission_id);
    judge_in_workspace(runner, submission_id, keep, workspace).await
}

/// As [`run_submission`] but resolving the repository root from `start`.
pub async fn run_submission_at(
    runner: &dyn CommandRunner,
    submission_id: &str,
    keep: bool,
    start: &Path,
) -> (Value, i32) {
    let workspace = workspace::create_workspace_at(start, submission_id);
    judge_in_workspace(runner, submission_id, keep, workspace).await
}

async fn judge_in_workspace(
    runner: &dyn CommandRunner,
    submission_id: &str,
    keep: bool,
    workspace: anyhow::Result<WorkspacePaths>,
) -> (Value, i32) {
    let paths = match workspace {
        Ok(paths) => paths,
        Err(e) => {
            error!("Workspace provisioning failed: {:#}", e);
            return verdict::runner_error(
                submission_id,
                "workspace_init",
                None,
                Some(verdict::EXIT_WORKSPACE_INIT),
            );
        }
    };

    let result = drive_phases(runner, get_config(), submission_id, &paths).await;

    // Cleanup always runs after the verdict is decided, on every path.
    workspace::cleanup_workspace(&paths.work_dir, keep);

    result
}

async fn drive_phases(
    runner: &dyn CommandRunner,
    config: &EngineConfig,
    submission_id: &str,
    paths: &WorkspacePaths,
) -> (Value, i32) {
    // RESTORE: networked dependency fetch.
    let restore_args = sandbox::restore_args(
        config,
        submission_id,
        &paths.work_dir,
        &paths.package_cache_dir,
    );
    let restore = match runner
        .run(
            &config.sandbox_binary,
            &restore_args,
            &paths.repo_root,
            Duration::from_secs(config.restore_timeout_secs),
        )
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("Failed to launch restore sandbox: {:#}", e);
            return verdict::runner_error(submission_id, "restore", None, Some(1));
        }
    };

    if restore.timed_out {
        warn!(
            "Restore phase exceeded {}s deadline",
            config.restore_timeout_secs
        );
        let name = sandbox::container_name(config, Phase::Restore, submission_id);
        sandbox::cleanup_container(config, &name).await;
        return verdict::timed_out(submission_id);
    }
    if restore.exit_code != 0 {
        warn!("Restore phase failed with exit code {}", restore.exit_code);
        return verdict::runner_error(submission_id, "restore", Some(&restore), None);
    }
    info!("Restore phase completed");

    // TEST: network off, init process on.
    let test_args = sandbox::test_args(
        config,
        submission_id,
        &paths.work_dir,
        &paths.package_cache_dir,
    );
    let test = match runner
        .run(
            &config.sandbox_binary,
            &test_args,
            &paths.repo_root,
            Duration::from_secs(config.test_timeout_secs),
        )
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("Failed to launch test sandbox: {:#}", e);
            return verdict::runner_error(submission_id, "test", None, Some(1));
        }
    };

    if test.timed_out {
        warn!("Test phase exceeded {}s deadline", config.test_timeout_secs);
        let name = sandbox::container_name(config, Phase::Test, submission_id);
        sandbox::cleanup_container(config, &name).await;
        return verdict::timed_out(submission_id);
    }
    info!("Test phase exited with code {}", test.exit_code);

    // LOCATE: the report can land anywhere beneath the workspace.
    let Some(trx_path) = workspace::find_artifact(&paths.work_dir, REPORT_FILE_NAME) else {
        if looks_resource_limited(&test) {
            warn!("No report and output signals resource exhaustion");
            return verdict::resource_limit_process(
                submission_id,
                "Process hit a sandbox resource limit before producing a test report",
                &test,
            );
        }
        warn!("Test phase left no report artifact");
        return verdict::runner_error(
            submission_id,
            "test_missing_trx",
            Some(&test),
            Some(fallback_exit(test.exit_code, verdict::EXIT_MISSING_ARTIFACT)),
        );
    };

    let trx_bytes = std::fs::metadata(&trx_path).map(|m| m.len()).unwrap_or(0);
    if trx_bytes > MAX_TRX_BYTES {
        warn!(
            "Report artifact is {} bytes, over the {} byte cap",
            trx_bytes, MAX_TRX_BYTES
        );
        return verdict::resource_limit_artifact(
            submission_id,
            "Test report artifact exceeded the size limit",
            trx_bytes,
            MAX_TRX_BYTES,
            test.exit_code,
        );
    }

    // CONVERT
    match report::convert_report(
        submission_id,
        &Status::Completed.to_string(),
        Some(&trx_path),
        Some(test.stderr.as_str()),
        None,
    ) {
        Ok(converted) => match serde_json::to_value(&converted) {
            Ok(doc) => {
                info!("Submission {} judged: completed", submission_id);
                (doc, test.exit_code)
            }
            Err(e) => {
                error!("Failed to serialize verdict: {}", e);
                verdict::runner_error(
                    submission_id,
                    "trx_parse",
                    Some(&test),
                    Some(fallback_exit(test.exit_code, verdict::EXIT_PARSE_FAILURE)),
                )
            }
        },
        Err(e) => {
            error!("Report conversion failed: {:#}", e);
            verdict::runner_error(
                submission_id,
                "trx_parse",
                Some(&test),
                Some(fallback_exit(test.exit_code, verdict::EXIT_PARSE_FAILURE)),
            )
        }
    }
}

/// A non-zero child exit code wins over the phase-specific fallback.
fn fallback_exit(child_exit: i32, fallback: i32) -> i32 {
    if child_exit != 0 {
        child_exit
    } else {
        fallback
    }
}
