//! Workspace management
//!
//! Materializes a per-submission workspace from the on-disk test-project
//! template, locates the report artifact after the test phase, and removes
//! the workspace when the pipeline is done.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

/// Template tree copied verbatim into each workspace.
pub const TEMPLATE_DIR_NAME: &str = "judge-template";
/// Sibling directory that, together with the template, marks the repo root.
pub const SERVER_DIR_NAME: &str = "server";
/// Directory under the OS temp dir holding all submission workspaces.
pub const WORK_ROOT_NAME: &str = "tracepoint-workspaces";
/// Per-submission package cache, bind-mounted into the sandbox.
pub const PACKAGE_CACHE_NAME: &str = "_nuget-cache";
/// Report artifact name the test phase is told to produce.
pub const REPORT_FILE_NAME: &str = "results.trx";

/// Per-submission workspace locations. Built once at pipeline start and
/// immutable afterwards.
#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub repo_root: PathBuf,
    pub template_dir: PathBuf,
    pub work_root: PathBuf,
    pub work_dir: PathBuf,
    pub package_cache_dir: PathBuf,
}

/// Walk upward from `start` looking for the repository root: the first
/// directory containing both the template tree and the server tree.
pub fn find_repo_root(start: &Path) -> Option<PathBuf> {
    let mut current = Some(start.to_path_buf());
    while let Some(dir) = current {
        if dir.join(TEMPLATE_DIR_NAME).is_dir() && dir.join(SERVER_DIR_NAME).is_dir() {
            return Some(dir);
        }
        current = dir.parent().map(Path::to_path_buf);
    }
    None
}

/// Create the workspace for a submission: resolve the repo root from the
/// current directory, copy the template, and create the package cache.
pub fn create_workspace(submission_id: &str) -> Result<WorkspacePaths> {
    let cwd = std::env::current_dir().context("Failed to resolve current directory")?;
    create_workspace_at(&cwd, submission_id)
}

pub fn create_workspace_at(start: &Path, submission_id: &str) -> Result<WorkspacePaths> {
    let repo_root = find_repo_root(start).ok_or_else(|| {
        anyhow::anyhow!(
            "No directory containing {}/ and {}/ found above {:?}",
            TEMPLATE_DIR_NAME,
            SERVER_DIR_NAME,
            start
        )
    })?;
    let template_dir = repo_root.join(TEMPLATE_DIR_NAME);

    let work_root = std::env::temp_dir().join(WORK_ROOT_NAME);
    let work_dir = work_root.join(submission_id);
    fs::create_dir_all(&work_dir)
        .with_context(|| format!("Failed to create workspace {:?}", work_dir))?;

    copy_dir_recursive(&template_dir, &work_dir)
        .with_context(|| format!("Failed to copy template from {:?}", template_dir))?;

    let package_cache_dir = work_dir.join(PACKAGE_CACHE_NAME);
    fs::create_dir_all(&package_cache_dir)
        .with_context(|| format!("Failed to create package cache {:?}", package_cache_dir))?;

    info!("Created workspace {:?} from {:?}", work_dir, template_dir);

    Ok(WorkspacePaths {
        repo_root,
        template_dir,
        work_root,
        work_dir,
        package_cache_dir,
    })
}

fn copy_dir_recursive(src: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src).with_context(|| format!("Failed to read {:?}", src))? {
        let entry = entry?;
        let dest_path = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &dest_path)?;
        } else {
            fs::copy(entry.path(), &dest_path)
                .with_context(|| format!("Failed to copy {:?}", entry.path()))?;
        }
    }
    Ok(())
}

/// Locate the report artifact beneath `root`. The most recently modified
/// file named exactly `preferred_name` wins; otherwise the most recent
/// `.trx` file anywhere beneath; otherwise nothing.
pub fn find_artifact(root: &Path, preferred_name: &str) -> Option<PathBuf> {
    let mut files: Vec<(PathBuf, SystemTime)> = Vec::new();
    collect_files(root, &mut files);

    let newest = |candidates: Vec<&(PathBuf, SystemTime)>| {
        candidates
            .into_iter()
            .max_by_key(|entry| entry.1)
            .map(|entry| entry.0.clone())
    };

    let exact: Vec<_> = files
        .iter()
        .filter(|(path, _)| path.file_name() == Some(std::ffi::OsStr::new(preferred_name)))
        .collect();
    if let Some(found) = newest(exact) {
        debug!("Found report artifact {:?}", found);
        return Some(found);
    }

    let by_extension: Vec<_> = files
        .iter()
        .filter(|(path, _)| {
            path.extension()
                .map(|ext| ext.eq_ignore_ascii_case("trx"))
                .unwrap_or(false)
        })
        .collect();
    let found = newest(by_extension);
    if let Some(path) = &found {
        debug!("Found report artifact by extension {:?}", path);
    }
    found
}

fn collect_files(dir: &Path, out: &mut Vec<(PathBuf, SystemTime)>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        match entry.file_type() {
            Ok(file_type) if file_type.is_dir() => collect_files(&path, out),
            Ok(file_type) if file_type.is_file() => {
                let mtime = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                out.push((path, mtime));
            }
            _ => {}
        }
    }
}

/// Remove the workspace after the verdict is emitted. With `keep` set the
/// workspace is retained for inspection. Deletion failures are logged and
/// swallowed.
pub fn cleanup_workspace(work_dir: &Path, keep: bool) {
    if keep {
        info!("Keeping workspace {:?}", work_dir);
        return;
    }
    match fs::remove_dir_all(work_dir) {
        Ok(()) => debug!("Removed workspace {:?}", work_dir),
        Err(e) => warn!("Failed to remove workspace {:?}: {}", work_dir, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_repo(root: &Path) {
        fs::create_dir_all(root.join(TEMPLATE_DIR_NAME).join("Tests")).unwrap();
        fs::create_dir_all(root.join(SERVER_DIR_NAME)).unwrap();
        fs::write(
            root.join(TEMPLATE_DIR_NAME).join("Judge.csproj"),
            "<Project />",
        )
        .unwrap();
        fs::write(
            root.join(TEMPLATE_DIR_NAME).join("Tests").join("Suite.cs"),
            "// tests",
        )
        .unwrap();
    }

    #[test]
    fn test_find_repo_root_walks_upward() {
        let temp = tempfile::tempdir().unwrap();
        make_repo(temp.path());
        let nested = temp.path().join("a").join("b");
        fs::create_dir_all(&nested).unwrap();

        let found = find_repo_root(&nested).unwrap();
        assert_eq!(found, temp.path());
    }

    #[test]
    fn test_find_repo_root_requires_both_markers() {
        let temp = tempfile::tempdir().unwrap();
        // Only the template, no server tree.
        fs::create_dir_all(temp.path().join(TEMPLATE_DIR_NAME)).unwrap();
        assert!(find_repo_root(temp.path()).is_none());
    }

    #[test]
    fn test_create_workspace_copies_template() {
        let temp = tempfile::tempdir().unwrap();
        make_repo(temp.path());

        let paths = create_workspace_at(temp.path(), "ws-copy-test").unwrap();
        assert!(paths.work_dir.join("Judge.csproj").is_file());
        assert!(paths.work_dir.join("Tests").join("Suite.cs").is_file());
        assert!(paths.package_cache_dir.is_dir());
        assert_eq!(paths.package_cache_dir, paths.work_dir.join(PACKAGE_CACHE_NAME));

        cleanup_workspace(&paths.work_dir, false);
        assert!(!paths.work_dir.exists());
    }

    #[test]
    fn test_create_workspace_fails_without_template() {
        let temp = tempfile::tempdir().unwrap();
        assert!(create_workspace_at(temp.path(), "nope").is_err());
    }

    #[test]
    fn test_find_artifact_prefers_exact_name() {
        let temp = tempfile::tempdir().unwrap();
        let nested = temp.path().join("TestResults").join("deep");
        fs::create_dir_all(&nested).unwrap();
        fs::write(temp.path().join("other.trx"), "x").unwrap();
        fs::write(nested.join(REPORT_FILE_NAME), "x").unwrap();

        let found = find_artifact(temp.path(), REPORT_FILE_NAME).unwrap();
        assert_eq!(found, nested.join(REPORT_FILE_NAME));
    }

    #[test]
    fn test_find_artifact_falls_back_to_extension() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("run-output.trx"), "x").unwrap();

        let found = find_artifact(temp.path(), REPORT_FILE_NAME).unwrap();
        assert_eq!(found, temp.path().join("run-output.trx"));
    }

    #[test]
    fn test_find_artifact_none_when_absent() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("notes.txt"), "x").unwrap();
        assert!(find_artifact(temp.path(), REPORT_FILE_NAME).is_none());
    }

    #[test]
    fn test_cleanup_workspace_keep_retains_dir() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("kept");
        fs::create_dir_all(&dir).unwrap();
        cleanup_workspace(&dir, true);
        assert!(dir.exists());
    }
}
