//! # Persistent store
//!
//! Project-rooted JSON storage for test definitions and run results:
//!
//! ```text
//! <projectRoot>/
//!   tests/<id>.json               saved tests
//!   results/<testId>/<runId>.json run records
//! ```
//!
//! Writes are atomic (temp file then rename). Readers treat unparseable
//! files as absent and skip them, so a torn write or stray file never
//! breaks listing.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::protocol::{RunStatus, SavedTest, TestDefinition, TestResult, TestRun};

/// Optional metadata supplied alongside a test definition at save time.
#[derive(Debug, Clone, Default)]
pub struct SaveMeta {
    pub description: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TestStore {
    root: PathBuf,
}

impl TestStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn tests_dir(&self) -> PathBuf {
        self.root.join("tests")
    }

    fn test_path(&self, id: &str) -> PathBuf {
        self.tests_dir().join(format!("{}.json", id))
    }

    fn results_dir(&self, test_id: &str) -> PathBuf {
        self.root.join("results").join(test_id)
    }

    fn result_path(&self, test_id: &str, run_id: &str) -> PathBuf {
        self.results_dir(test_id).join(format!("{}.json", run_id))
    }

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    /// Saves a new test. Fails when the id is already taken; the id always
    /// matches the on-disk filename.
    pub fn save_test(
        &self,
        id: &str,
        name: &str,
        definition: TestDefinition,
        meta: SaveMeta,
    ) -> Result<SavedTest> {
        let path = self.test_path(id);
        if path.exists() {
            return Err(anyhow!("test \"{}\" already exists", id));
        }
        let now = Utc::now().to_rfc3339();
        let saved = SavedTest {
            id: id.to_string(),
            name: name.to_string(),
            description: meta.description,
            tags: meta.tags,
            definition,
            created_at: now.clone(),
            updated_at: now,
        };
        write_json_atomic(&path, &saved)?;
        Ok(saved)
    }

    /// All saved tests, newest update first. Unparseable files are skipped
    /// with a warning.
    pub fn list_tests(&self, tag: Option<&str>) -> Vec<SavedTest> {
        let mut tests: Vec<SavedTest> = read_dir_json(&self.tests_dir());
        if let Some(tag) = tag {
            tests.retain(|t| t.tags.iter().any(|t2| t2 == tag));
        }
        tests.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        tests
    }

    /// The saved test, or `None` when missing or unparseable.
    pub fn get_test(&self, id: &str) -> Option<SavedTest> {
        let content = fs::read_to_string(self.test_path(id)).ok()?;
        match serde_json::from_str(&content) {
            Ok(test) => Some(test),
            Err(e) => {
                warn!(id, error = %e, "skipping unparseable test file");
                None
            }
        }
    }

    /// Idempotent delete. Also removes the test's results directory.
    pub fn delete_test(&self, id: &str) -> Result<()> {
        let path = self.test_path(id);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("failed to delete test \"{}\"", id))?;
        }
        let results = self.results_dir(id);
        if results.exists() {
            fs::remove_dir_all(&results)
                .with_context(|| format!("failed to delete results for \"{}\"", id))?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Results
    // ------------------------------------------------------------------

    /// Persists a run result under a fresh monotonic id, then prunes the
    /// oldest runs past the retention bound.
    pub fn save_result(
        &self,
        test_id: &str,
        result: TestResult,
        started_at: DateTime<Utc>,
        retention: Option<usize>,
    ) -> Result<TestRun> {
        let run_id = format!(
            "{}-{:04x}",
            Utc::now().timestamp_millis(),
            rand::random::<u16>()
        );
        let duration_ms = match &result {
            TestResult::Passed { duration_ms, .. } => *duration_ms,
            TestResult::Failed { duration_ms, .. } => *duration_ms,
        };
        let run = TestRun {
            id: run_id.clone(),
            test_id: test_id.to_string(),
            status: if result.passed() {
                RunStatus::Passed
            } else {
                RunStatus::Failed
            },
            result,
            started_at: started_at.to_rfc3339(),
            completed_at: Some(Utc::now().to_rfc3339()),
            duration_ms: Some(duration_ms),
        };
        write_json_atomic(&self.result_path(test_id, &run_id), &run)?;

        if let Some(retention) = retention {
            self.enforce_retention(test_id, retention);
        }
        Ok(run)
    }

    fn enforce_retention(&self, test_id: &str, retention: usize) {
        let mut runs = self.list_results(test_id, None, None);
        // list_results returns newest first; everything past the bound goes.
        for stale in runs.split_off(retention.min(runs.len())) {
            let path = self.result_path(test_id, &stale.id);
            if let Err(e) = fs::remove_file(&path) {
                warn!(run_id = %stale.id, error = %e, "failed to prune old result");
            }
        }
    }

    /// Runs for one test, newest first, optionally filtered and limited.
    pub fn list_results(
        &self,
        test_id: &str,
        status: Option<RunStatus>,
        limit: Option<usize>,
    ) -> Vec<TestRun> {
        let mut runs: Vec<TestRun> = read_dir_json(&self.results_dir(test_id));
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        if let Some(status) = status {
            runs.retain(|r| r.status == status);
        }
        if let Some(limit) = limit {
            runs.truncate(limit);
        }
        runs
    }

    /// One run record. Heavy payload fields (`dom_snapshot`, `screenshot`,
    /// `step_traces`) are stripped unless named in `sections`.
    pub fn get_result(
        &self,
        test_id: &str,
        run_id: &str,
        sections: Option<&[String]>,
    ) -> Option<TestRun> {
        let content = fs::read_to_string(self.result_path(test_id, run_id)).ok()?;
        let mut run: TestRun = match serde_json::from_str(&content) {
            Ok(run) => run,
            Err(e) => {
                warn!(run_id, error = %e, "skipping unparseable result file");
                return None;
            }
        };

        let keep = |name: &str| {
            sections
                .map(|s| s.iter().any(|x| x == name))
                .unwrap_or(false)
        };
        match &mut run.result {
            TestResult::Passed { step_traces, .. } => {
                if !keep("step_traces") {
                    *step_traces = None;
                }
            }
            TestResult::Failed {
                step_traces,
                dom_snapshot,
                screenshot,
                ..
            } => {
                if !keep("step_traces") {
                    *step_traces = None;
                }
                if !keep("dom_snapshot") {
                    *dom_snapshot = None;
                }
                if !keep("screenshot") {
                    *screenshot = None;
                }
            }
        }
        Some(run)
    }
}

/// Crude slug used when the control surface saves a test without an id.
/// Runs of non-alphanumerics collapse to a single dash; leading and
/// trailing dashes are kept so existing persisted ids keep round-tripping.
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            out.extend(ch.to_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out
}

/// Atomic JSON write: serialise, write a sibling temp file, rename over.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;

    let json = serde_json::to_string_pretty(value).context("failed to serialise record")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("failed to rename into {}", path.display()))?;
    Ok(())
}

/// Parses every `.json` file in a directory, skipping unreadable or
/// unparseable entries.
fn read_dir_json<T: serde::de::DeserializeOwned>(dir: &Path) -> Vec<T> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Ok(content) = fs::read_to_string(&path) else {
            continue;
        };
        match serde_json::from_str(&content) {
            Ok(value) => out.push(value),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unparseable file");
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition() -> TestDefinition {
        serde_json::from_value(json!({
            "url": "http://localhost:3000",
            "steps": [ { "eval": "1" } ]
        }))
        .unwrap()
    }

    fn passed(duration_ms: u64) -> TestResult {
        TestResult::Passed {
            steps_completed: 1,
            duration_ms,
            step_traces: Some(Vec::new()),
        }
    }

    #[test]
    fn test_save_and_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = TestStore::new(dir.path());
        let meta = SaveMeta {
            description: Some("smoke".into()),
            tags: vec!["ci".into()],
        };
        store
            .save_test("login-flow", "Login flow", definition(), meta)
            .unwrap();

        let loaded = store.get_test("login-flow").unwrap();
        assert_eq!(loaded.id, "login-flow");
        assert_eq!(loaded.name, "Login flow");
        assert_eq!(loaded.description.as_deref(), Some("smoke"));
        assert_eq!(loaded.tags, vec!["ci".to_string()]);
        assert_eq!(loaded.definition.url, "http://localhost:3000");
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = TestStore::new(dir.path());
        store
            .save_test("dup", "First", definition(), SaveMeta::default())
            .unwrap();
        let err = store
            .save_test("dup", "Second", definition(), SaveMeta::default())
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn test_list_skips_unparseable_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = TestStore::new(dir.path());
        store
            .save_test("good", "Good", definition(), SaveMeta::default())
            .unwrap();
        fs::write(dir.path().join("tests/bad.json"), "{not json").unwrap();

        let tests = store.list_tests(None);
        assert_eq!(tests.len(), 1);
        assert_eq!(tests[0].id, "good");
        assert!(store.get_test("bad").is_none());
    }

    #[test]
    fn test_list_filters_by_tag() {
        let dir = tempfile::tempdir().unwrap();
        let store = TestStore::new(dir.path());
        store
            .save_test(
                "a",
                "A",
                definition(),
                SaveMeta {
                    tags: vec!["ci".into()],
                    ..SaveMeta::default()
                },
            )
            .unwrap();
        store
            .save_test("b", "B", definition(), SaveMeta::default())
            .unwrap();
        let tagged = store.list_tests(Some("ci"));
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].id, "a");
    }

    #[test]
    fn test_delete_is_idempotent_and_removes_results() {
        let dir = tempfile::tempdir().unwrap();
        let store = TestStore::new(dir.path());
        store
            .save_test("t", "T", definition(), SaveMeta::default())
            .unwrap();
        store.save_result("t", passed(5), Utc::now(), None).unwrap();

        store.delete_test("t").unwrap();
        assert!(store.get_test("t").is_none());
        assert!(store.list_results("t", None, None).is_empty());
        // Second delete is a no-op.
        store.delete_test("t").unwrap();
    }

    #[test]
    fn test_retention_prunes_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let store = TestStore::new(dir.path());
        let base = Utc::now();
        for i in 0..5 {
            let started = base - chrono::Duration::seconds(100 - i);
            store
                .save_result("t", passed(i as u64), started, Some(3))
                .unwrap();
        }
        let runs = store.list_results("t", None, None);
        assert_eq!(runs.len(), 3);
        // Newest three survive.
        let durations: Vec<u64> = runs.iter().filter_map(|r| r.duration_ms).collect();
        assert_eq!(durations, vec![4, 3, 2]);
    }

    #[test]
    fn test_list_results_filter_and_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = TestStore::new(dir.path());
        let base = Utc::now();
        store
            .save_result("t", passed(1), base - chrono::Duration::seconds(3), None)
            .unwrap();
        let failed = TestResult::Failed {
            failed_step: 0,
            failed_label: None,
            step_definition: serde_json::from_value(json!({ "eval": "x" })).unwrap(),
            error: "boom".into(),
            loop_context: None,
            console_errors: Vec::new(),
            dom_snapshot: None,
            screenshot: None,
            duration_ms: 2,
            step_traces: None,
        };
        store
            .save_result("t", failed, base - chrono::Duration::seconds(2), None)
            .unwrap();

        let only_failed = store.list_results("t", Some(RunStatus::Failed), None);
        assert_eq!(only_failed.len(), 1);
        assert_eq!(only_failed[0].status, RunStatus::Failed);

        let limited = store.list_results("t", None, Some(1));
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_get_result_strips_heavy_sections_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = TestStore::new(dir.path());
        let run = store.save_result("t", passed(1), Utc::now(), None).unwrap();

        let slim = store.get_result("t", &run.id, None).unwrap();
        match slim.result {
            TestResult::Passed { step_traces, .. } => assert!(step_traces.is_none()),
            other => panic!("unexpected result: {:?}", other),
        }

        let full = store
            .get_result("t", &run.id, Some(&["step_traces".to_string()]))
            .unwrap();
        match full.result {
            TestResult::Passed { step_traces, .. } => assert!(step_traces.is_some()),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_slugify_is_crude_on_purpose() {
        assert_eq!(slugify("My Test!"), "my-test-");
        assert_eq!(slugify("--Already Dashed--"), "-already-dashed-");
        assert_eq!(slugify("CamelCase 2"), "camelcase-2");
    }
}
