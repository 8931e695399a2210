//! Canonical verdict model
//!
//! The verdict vocabulary shared by every pipeline exit path, plus the
//! builders for the non-success documents. Non-success verdicts are partial
//! skeletons: keys with no value are omitted entirely. The completed path
//! uses the typed model and emits every key, with nulls where applicable.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::config::{MAX_FIELD_CHARS, TRUNCATION_MARKER};
use crate::executor::ProcessOutcome;

/// Exit code reported when a phase deadline expires.
pub const EXIT_TIMED_OUT: i32 = 124;
/// Exit code for resource-limit verdicts when the child exited cleanly.
pub const EXIT_RESOURCE_LIMIT: i32 = 137;
/// Exit code when the template tree cannot be found.
pub const EXIT_WORKSPACE_INIT: i32 = 1;
/// Fallback exit code when the test phase succeeds but leaves no report.
pub const EXIT_MISSING_ARTIFACT: i32 = 2;
/// Fallback exit code when the report cannot be parsed.
pub const EXIT_PARSE_FAILURE: i32 = 3;

/// Boundary status of a judged submission.
///
/// `CompileError` is reserved for the outer service; the engine never emits
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Completed,
    CompileError,
    TimedOut,
    RunnerError,
    ResourceLimit,
}

impl Status {
    /// Normalize a free-form status token. Unknown tokens collapse to
    /// `completed`.
    pub fn from_token(token: &str) -> Self {
        match token.to_ascii_lowercase().as_str() {
            "compile_error" => Status::CompileError,
            "timed_out" => Status::TimedOut,
            "runner_error" => Status::RunnerError,
            "resource_limit" => Status::ResourceLimit,
            _ => Status::Completed,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Completed => "completed",
            Status::CompileError => "compile_error",
            Status::TimedOut => "timed_out",
            Status::RunnerError => "runner_error",
            Status::ResourceLimit => "resource_limit",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of a test run or of a single test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Passed,
    Failed,
    Skipped,
    Unknown,
}

impl Outcome {
    /// Map an engine-native outcome token. `NotExecuted` counts as skipped
    /// and `Timeout` as failed; anything unrecognized or missing is unknown.
    pub fn from_trx(token: Option<&str>) -> Self {
        match token {
            Some("Passed") => Outcome::Passed,
            Some("Failed") | Some("Timeout") => Outcome::Failed,
            Some("Skipped") | Some("NotExecuted") => Outcome::Skipped,
            _ => Outcome::Unknown,
        }
    }
}

/// Canonical verdict document for the completed path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub submission_id: String,
    pub status: Status,
    pub run: Option<RunSummary>,
    pub tests: Vec<TestResult>,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub test_run_id: Option<String>,
    pub overall_outcome: Outcome,
    pub created_at: Option<String>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub duration_ms: u64,
    pub counters: Counters,
}

impl RunSummary {
    /// Skeleton for a run with no parseable report.
    pub fn unknown() -> Self {
        Self {
            test_run_id: None,
            overall_outcome: Outcome::Unknown,
            created_at: None,
            started_at: None,
            finished_at: None,
            duration_ms: 0,
            counters: Counters::default(),
        }
    }
}

/// The nine fixed counters. `skipped` is the boundary name for the source's
/// `notExecuted`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub total: u64,
    pub executed: u64,
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub error: u64,
    pub timeout: u64,
    pub aborted: u64,
    pub inconclusive: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub id: String,
    pub name: Option<String>,
    pub class_name: Option<String>,
    pub fully_qualified_name: Option<String>,
    pub outcome: Outcome,
    pub duration_ms: u64,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub message: Option<String>,
    pub stack_trace: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub trx_path: Option<String>,
    pub note: Option<String>,
}

/// Cap a text field for the verdict; appends the truncation marker on
/// overflow.
pub fn truncate_field(text: &str) -> String {
    if text.chars().count() <= MAX_FIELD_CHARS {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(MAX_FIELD_CHARS).collect();
        out.push_str(TRUNCATION_MARKER);
        out
    }
}

/// Blank strings carry no information at the boundary; everything else is
/// field-capped.
pub fn non_blank(text: &str) -> Option<String> {
    if text.trim().is_empty() {
        None
    } else {
        Some(truncate_field(text))
    }
}

/// Timeout verdict. The document is exactly `{submissionId, status}`.
pub fn timed_out(submission_id: &str) -> (Value, i32) {
    let doc = json!({
        "submissionId": submission_id,
        "status": Status::TimedOut.to_string(),
    });
    (doc, EXIT_TIMED_OUT)
}

/// Process-level resource-limit verdict: the sandbox killed the run, or its
/// output carries an exhaustion signature.
pub fn resource_limit_process(
    submission_id: &str,
    note: &str,
    outcome: &ProcessOutcome,
) -> (Value, i32) {
    let exit = if outcome.exit_code != 0 {
        outcome.exit_code
    } else {
        EXIT_RESOURCE_LIMIT
    };
    let doc = json!({
        "submissionId": submission_id,
        "status": Status::ResourceLimit.to_string(),
        "diagnostics": {
            "note": truncate_field(note),
            "exitCode": outcome.exit_code,
            "stdout": truncate_field(&outcome.stdout),
            "stdoutTruncated": outcome.stdout_truncated,
            "stderr": truncate_field(&outcome.stderr),
            "stderrTruncated": outcome.stderr_truncated,
        },
    });
    (doc, exit)
}

/// Resource-limit verdict for a report artifact over the size cap.
pub fn resource_limit_artifact(
    submission_id: &str,
    note: &str,
    trx_bytes: u64,
    max_trx_bytes: u64,
    child_exit: i32,
) -> (Value, i32) {
    let exit = if child_exit != 0 {
        child_exit
    } else {
        EXIT_RESOURCE_LIMIT
    };
    let doc = json!({
        "submissionId": submission_id,
        "status": Status::ResourceLimit.to_string(),
        "diagnostics": {
            "note": truncate_field(note),
            "trxBytes": trx_bytes,
            "maxTrxBytes": max_trx_bytes,
            "exitCode": child_exit,
        },
    });
    (doc, exit)
}

/// Runner-error verdict for the given phase. The process exit code is the
/// explicit override when given, the child's exit code otherwise.
pub fn runner_error(
    submission_id: &str,
    phase: &str,
    outcome: Option<&ProcessOutcome>,
    exit_override: Option<i32>,
) -> (Value, i32) {
    let exit = exit_override
        .or(outcome.map(|o| o.exit_code))
        .unwrap_or(EXIT_WORKSPACE_INIT);

    let mut diagnostics = Map::new();
    diagnostics.insert("phase".into(), json!(phase));
    diagnostics.insert(
        "exitCode".into(),
        json!(outcome.map(|o| o.exit_code).unwrap_or(exit)),
    );
    if let Some(outcome) = outcome {
        diagnostics.insert("stdout".into(), json!(truncate_field(&outcome.stdout)));
        diagnostics.insert("stdoutTruncated".into(), json!(outcome.stdout_truncated));
        diagnostics.insert("stderr".into(), json!(truncate_field(&outcome.stderr)));
        diagnostics.insert("stderrTruncated".into(), json!(outcome.stderr_truncated));
    }

    let doc = json!({
        "submissionId": submission_id,
        "status": Status::RunnerError.to_string(),
        "diagnostics": Value::Object(diagnostics),
    });
    (doc, exit)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(exit_code: i32) -> ProcessOutcome {
        ProcessOutcome {
            exit_code,
            stdout: "out".into(),
            stderr: "err".into(),
            timed_out: false,
            stdout_truncated: false,
            stderr_truncated: false,
        }
    }

    #[test]
    fn test_status_from_token() {
        assert_eq!(Status::from_token("completed"), Status::Completed);
        assert_eq!(Status::from_token("TIMED_OUT"), Status::TimedOut);
        assert_eq!(Status::from_token("resource_limit"), Status::ResourceLimit);
        // Unknown tokens collapse to completed.
        assert_eq!(Status::from_token("banana"), Status::Completed);
        assert_eq!(Status::from_token(""), Status::Completed);
    }

    #[test]
    fn test_outcome_from_trx_remaps() {
        assert_eq!(Outcome::from_trx(Some("Passed")), Outcome::Passed);
        assert_eq!(Outcome::from_trx(Some("Failed")), Outcome::Failed);
        assert_eq!(Outcome::from_trx(Some("Timeout")), Outcome::Failed);
        assert_eq!(Outcome::from_trx(Some("Skipped")), Outcome::Skipped);
        assert_eq!(Outcome::from_trx(Some("NotExecuted")), Outcome::Skipped);
        assert_eq!(Outcome::from_trx(Some("Pending")), Outcome::Unknown);
        assert_eq!(Outcome::from_trx(None), Outcome::Unknown);
    }

    #[test]
    fn test_timed_out_document_is_minimal() {
        let (doc, exit) = timed_out("abc");
        assert_eq!(exit, EXIT_TIMED_OUT);
        assert_eq!(
            doc,
            serde_json::json!({"submissionId": "abc", "status": "timed_out"})
        );
        // No run, no tests on the timeout path.
        assert!(doc.get("run").is_none());
        assert!(doc.get("tests").is_none());
    }

    #[test]
    fn test_resource_limit_exit_code_rules() {
        let (_, exit) = resource_limit_process("id", "resource limit hit", &outcome(0));
        assert_eq!(exit, EXIT_RESOURCE_LIMIT);

        let (_, exit) = resource_limit_process("id", "resource limit hit", &outcome(9));
        assert_eq!(exit, 9);
    }

    #[test]
    fn test_resource_limit_artifact_diagnostics() {
        let (doc, exit) = resource_limit_artifact("id", "too big", 3_000_000, 2_000_000, 0);
        assert_eq!(exit, EXIT_RESOURCE_LIMIT);
        let diagnostics = &doc["diagnostics"];
        assert_eq!(diagnostics["trxBytes"], 3_000_000);
        assert_eq!(diagnostics["maxTrxBytes"], 2_000_000);
        assert_eq!(diagnostics["exitCode"], 0);
        assert!(doc.get("tests").is_none());
    }

    #[test]
    fn test_runner_error_with_outcome() {
        let (doc, exit) = runner_error("id", "restore", Some(&outcome(5)), None);
        assert_eq!(exit, 5);
        assert_eq!(doc["status"], "runner_error");
        assert_eq!(doc["diagnostics"]["phase"], "restore");
        assert_eq!(doc["diagnostics"]["exitCode"], 5);
        assert_eq!(doc["diagnostics"]["stdout"], "out");
        assert_eq!(doc["diagnostics"]["stderr"], "err");
    }

    #[test]
    fn test_runner_error_override_wins() {
        let (doc, exit) = runner_error("id", "test_missing_trx", Some(&outcome(0)), Some(2));
        assert_eq!(exit, 2);
        // Diagnostics still record the child's own exit code.
        assert_eq!(doc["diagnostics"]["exitCode"], 0);
    }

    #[test]
    fn test_runner_error_without_outcome() {
        let (doc, exit) = runner_error("id", "workspace_init", None, Some(EXIT_WORKSPACE_INIT));
        assert_eq!(exit, 1);
        assert_eq!(doc["diagnostics"]["phase"], "workspace_init");
        assert!(doc["diagnostics"].get("stdout").is_none());
    }

    #[test]
    fn test_truncate_field_caps_and_marks() {
        let long = "x".repeat(crate::config::MAX_FIELD_CHARS + 100);
        let capped = truncate_field(&long);
        assert!(capped.ends_with(TRUNCATION_MARKER));
        assert_eq!(
            capped.chars().count(),
            crate::config::MAX_FIELD_CHARS + TRUNCATION_MARKER.chars().count()
        );

        assert_eq!(truncate_field("short"), "short");
    }

    #[test]
    fn test_non_blank() {
        assert_eq!(non_blank("  \n\t "), None);
        assert_eq!(non_blank(""), None);
        assert_eq!(non_blank("hi"), Some("hi".to_string()));
    }

    #[test]
    fn test_completed_verdict_serializes_all_keys() {
        let verdict = Verdict {
            submission_id: "abc".into(),
            status: Status::Completed,
            run: Some(RunSummary::unknown()),
            tests: vec![],
            diagnostics: Diagnostics::default(),
        };
        let doc = serde_json::to_value(&verdict).unwrap();
        assert_eq!(doc["status"], "completed");
        assert_eq!(doc["run"]["overallOutcome"], "Unknown");
        assert_eq!(doc["run"]["counters"]["total"], 0);
        // The full document carries explicit nulls.
        assert!(doc["diagnostics"]["trxPath"].is_null());
        assert!(doc["run"]["testRunId"].is_null());
    }
}
