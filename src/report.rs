//! Test-report conversion
//!
//! Parses the engine-native TRX document produced inside the sandbox and
//! emits the canonical verdict. All boundary normalization lives here:
//! outcome remapping, counter renaming, duration and timestamp parsing,
//! field capping, and blank-to-null collapsing.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat};
use roxmltree::{Document, Node};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::verdict::{
    non_blank, Counters, Diagnostics, Outcome, RunSummary, Status, TestResult, Verdict,
};

/// Convert a report artifact into the canonical verdict.
///
/// When the artifact is missing the verdict carries an unknown-run skeleton
/// and an empty test list; any provided stderr/note overrides are capped and
/// recorded either way. Parse failures propagate to the caller.
pub fn convert_report(
    submission_id: &str,
    status_token: &str,
    trx_path: Option<&Path>,
    stderr: Option<&str>,
    note: Option<&str>,
) -> Result<Verdict> {
    let status = Status::from_token(status_token);
    let stderr = stderr.and_then(non_blank);
    let note = note.and_then(non_blank);

    let Some(path) = trx_path.filter(|p| p.exists()) else {
        debug!("No report artifact; emitting unknown-run skeleton");
        return Ok(Verdict {
            submission_id: submission_id.to_string(),
            status,
            run: Some(RunSummary::unknown()),
            tests: Vec::new(),
            diagnostics: Diagnostics {
                stdout: None,
                stderr,
                trx_path: None,
                note,
            },
        });
    };

    let xml = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read report {:?}", path))?;
    // roxmltree rejects DTDs outright and never resolves external entities.
    let doc = Document::parse(&xml).context("Malformed report XML")?;
    let root = doc.root_element();

    let test_run_id = root.attribute("id").and_then(non_blank);

    let times = child_elem(root, "Times");
    let created_at = normalize_timestamp(times.and_then(|t| t.attribute("creation")));
    let started_at = normalize_timestamp(times.and_then(|t| t.attribute("start")));
    let finished_at = normalize_timestamp(times.and_then(|t| t.attribute("finish")));
    let duration_ms = run_duration_ms(
        times.and_then(|t| t.attribute("start")),
        times.and_then(|t| t.attribute("finish")),
    );

    let summary = child_elem(root, "ResultSummary");
    let overall_outcome = Outcome::from_trx(summary.and_then(|s| s.attribute("outcome")));
    let counters = parse_counters(summary.and_then(|s| child_elem(s, "Counters")));
    let run_stdout = summary
        .and_then(|s| child_elem(s, "Output"))
        .and_then(|o| child_elem(o, "StdOut"))
        .and_then(|n| n.text())
        .and_then(non_blank);

    let definitions = collect_definitions(root);
    let tests = convert_results(root, &definitions);

    Ok(Verdict {
        submission_id: submission_id.to_string(),
        status,
        run: Some(RunSummary {
            test_run_id,
            overall_outcome,
            created_at,
            started_at,
            finished_at,
            duration_ms,
            counters,
        }),
        tests,
        diagnostics: Diagnostics {
            stdout: run_stdout,
            stderr,
            trx_path: Some(path.display().to_string()),
            note,
        },
    })
}

/// Class and fully-qualified names pulled from a `UnitTest` definition.
struct TestDefinition {
    class_name: Option<String>,
    fully_qualified_name: Option<String>,
}

fn collect_definitions(root: Node) -> HashMap<String, TestDefinition> {
    let mut definitions = HashMap::new();
    let Some(defs) = child_elem(root, "TestDefinitions") else {
        return definitions;
    };
    for unit in elements_named(defs, "UnitTest") {
        let Some(test_id) = unit.attribute("id") else {
            continue;
        };
        let method = child_elem(unit, "TestMethod");
        let class_name = method
            .and_then(|m| m.attribute("className"))
            .and_then(non_blank);
        let method_name = method.and_then(|m| m.attribute("name")).and_then(non_blank);
        let fully_qualified_name = match (&class_name, &method_name) {
            (Some(class), Some(name)) => Some(format!("{}.{}", class, name)),
            _ => None,
        };
        definitions.insert(
            test_id.to_string(),
            TestDefinition {
                class_name,
                fully_qualified_name,
            },
        );
    }
    definitions
}

fn convert_results(root: Node, definitions: &HashMap<String, TestDefinition>) -> Vec<TestResult> {
    let mut tests = Vec::new();
    let Some(results) = child_elem(root, "Results") else {
        return tests;
    };
    for result in elements_named(results, "UnitTestResult") {
        let execution_id = result.attribute("executionId");
        let test_id = result.attribute("testId");

        // An entry id is always present: execution id, then test id, then a
        // freshly minted one.
        let id = execution_id
            .and_then(non_blank)
            .or_else(|| test_id.and_then(non_blank))
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

        let error_info = child_elem(result, "Output").and_then(|o| child_elem(o, "ErrorInfo"));
        let message = error_info
            .and_then(|e| child_elem(e, "Message"))
            .and_then(|n| n.text())
            .and_then(non_blank);
        let stack_trace = error_info
            .and_then(|e| child_elem(e, "StackTrace"))
            .and_then(|n| n.text())
            .and_then(non_blank);

        let definition = test_id.and_then(|tid| definitions.get(tid));

        tests.push(TestResult {
            id,
            name: result.attribute("testName").and_then(non_blank),
            class_name: definition.and_then(|d| d.class_name.clone()),
            fully_qualified_name: definition.and_then(|d| d.fully_qualified_name.clone()),
            outcome: Outcome::from_trx(result.attribute("outcome")),
            duration_ms: parse_duration_ms(result.attribute("duration")),
            started_at: normalize_timestamp(result.attribute("startTime")),
            finished_at: normalize_timestamp(result.attribute("endTime")),
            message,
            stack_trace,
        });
    }
    tests
}

fn parse_counters(node: Option<Node>) -> Counters {
    let Some(node) = node else {
        return Counters::default();
    };
    let read = |name: &str| {
        node.attribute(name)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
    };
    Counters {
        total: read("total"),
        executed: read("executed"),
        passed: read("passed"),
        failed: read("failed"),
        // Boundary rename: the source calls this notExecuted.
        skipped: read("notExecuted"),
        error: read("error"),
        timeout: read("timeout"),
        aborted: read("aborted"),
        inconclusive: read("inconclusive"),
    }
}

/// First child element with the given local name, namespace ignored.
fn child_elem<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == name)
}

fn elements_named<'a, 'input>(
    node: Node<'a, 'input>,
    name: &'a str,
) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children()
        .filter(move |n| n.is_element() && n.tag_name().name() == name)
}

/// Parse an ISO-8601 round-trip timestamp and re-emit it normalized.
/// Unparseable input becomes nothing.
fn normalize_timestamp(value: Option<&str>) -> Option<String> {
    let raw = value?.trim();
    if raw.is_empty() {
        return None;
    }
    match DateTime::parse_from_rfc3339(raw) {
        Ok(parsed) => Some(parsed.to_rfc3339_opts(SecondsFormat::Micros, true)),
        Err(e) => {
            warn!("Unparseable timestamp {:?}: {}", raw, e);
            None
        }
    }
}

/// Run duration is finish minus start, clamped at zero; zero when either
/// endpoint is missing or unparseable.
fn run_duration_ms(start: Option<&str>, finish: Option<&str>) -> u64 {
    let (Some(start), Some(finish)) = (start, finish) else {
        return 0;
    };
    match (
        DateTime::parse_from_rfc3339(start.trim()),
        DateTime::parse_from_rfc3339(finish.trim()),
    ) {
        (Ok(start), Ok(finish)) => (finish - start).num_milliseconds().max(0) as u64,
        _ => 0,
    }
}

/// Parse an `HH:MM:SS.fffffff` duration into whole milliseconds, rounding
/// the fractional part. Unparseable input counts as zero.
fn parse_duration_ms(value: Option<&str>) -> u64 {
    let Some(raw) = value else {
        return 0;
    };
    let mut parts = raw.trim().splitn(3, ':');
    let (Some(hours), Some(minutes), Some(seconds)) = (parts.next(), parts.next(), parts.next())
    else {
        return 0;
    };
    let (Ok(hours), Ok(minutes), Ok(seconds)) = (
        hours.parse::<u64>(),
        minutes.parse::<u64>(),
        seconds.parse::<f64>(),
    ) else {
        return 0;
    };
    if !seconds.is_finite() || seconds < 0.0 {
        return 0;
    }
    (hours * 3600 + minutes * 60) * 1000 + (seconds * 1000.0).round() as u64
}
