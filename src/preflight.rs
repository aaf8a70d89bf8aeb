//! # Preflight Checks
//!
//! A run starts with a set of named, zero-argument checks. They execute inside a
//! [`TimedScope`] which logs how long the scope took on every exit path, including
//! early returns and unwinding.

use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{error, info, warn};

use crate::asset_store::AssetStore;
use crate::errors::{AppError, AppResult};

type CheckFn = Box<dyn Fn() -> Result<(), String> + Send + Sync>;

/// Named zero-argument predicate
pub struct PreflightCheck {
    name: String,
    check: CheckFn,
}

impl PreflightCheck {
    pub fn new<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn() -> Result<(), String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            check: Box::new(check),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Logs the duration and outcome of a scope when dropped
pub struct TimedScope {
    label: String,
    started: Instant,
    outcome: Option<&'static str>,
}

impl TimedScope {
    pub fn start(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            started: Instant::now(),
            outcome: None,
        }
    }

    pub fn succeed(&mut self) {
        self.outcome = Some("passed");
    }

    pub fn fail(&mut self) {
        self.outcome = Some("failed");
    }
}

impl Drop for TimedScope {
    fn drop(&mut self) {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        match self.outcome {
            Some("passed") => info!(scope = %self.label, elapsed_ms, "Scope completed"),
            Some(outcome) => warn!(scope = %self.label, elapsed_ms, outcome, "Scope completed"),
            // Neither marked: early return or unwinding
            None => error!(scope = %self.label, elapsed_ms, "Scope aborted"),
        }
    }
}

/// Result of one check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub name: String,
    pub error: Option<String>,
}

/// Ordered collection of checks
#[derive(Default)]
pub struct Preflight {
    checks: Vec<PreflightCheck>,
}

impl Preflight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_check<F>(mut self, name: impl Into<String>, check: F) -> Self
    where
        F: Fn() -> Result<(), String> + Send + Sync + 'static,
    {
        self.checks.push(PreflightCheck::new(name, check));
        self
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Run every check, then fail if any of them failed.
    ///
    /// All checks run even after a failure so the error lists every problem.
    pub fn run(&self) -> AppResult<Vec<CheckResult>> {
        let mut scope = TimedScope::start("preflight");

        let results: Vec<CheckResult> = self
            .checks
            .iter()
            .map(|check| {
                let outcome = (check.check)();
                match &outcome {
                    Ok(()) => info!(check = %check.name, "Preflight check passed"),
                    Err(reason) => warn!(check = %check.name, reason = %reason, "Preflight check failed"),
                }
                CheckResult {
                    name: check.name.clone(),
                    error: outcome.err(),
                }
            })
            .collect();

        let failures: Vec<String> = results
            .iter()
            .filter_map(|r| r.error.as_ref().map(|e| format!("{}: {}", r.name, e)))
            .collect();

        if failures.is_empty() {
            scope.succeed();
            Ok(results)
        } else {
            scope.fail();
            Err(AppError::Config(format!(
                "Preflight failed: {}",
                failures.join("; ")
            )))
        }
    }
}

/// Checks run before a batch: writable asset root and a readable pages directory
pub fn batch_checks(store: &AssetStore, pages_dir: &Path) -> Preflight {
    let store = store.clone();
    let pages_dir: PathBuf = pages_dir.to_path_buf();
    Preflight::new()
        .with_check("asset_root_writable", move || {
            store.check_writable().map_err(|e| e.to_string())
        })
        .with_check("pages_directory_present", move || {
            if pages_dir.is_dir() {
                Ok(())
            } else {
                Err(format!("{} is not a directory", pages_dir.display()))
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecoveryConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_all_checks_run_and_failures_are_listed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (a, b) = (Arc::clone(&calls), Arc::clone(&calls));
        let preflight = Preflight::new()
            .with_check("first", move || {
                a.fetch_add(1, Ordering::SeqCst);
                Err("broken".to_string())
            })
            .with_check("second", move || {
                b.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });

        let err = preflight.run().unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(err.to_string().contains("first: broken"));
        assert!(!err.to_string().contains("second"));
    }

    #[test]
    fn test_empty_preflight_passes() {
        assert!(Preflight::new().run().unwrap().is_empty());
    }

    #[test]
    fn test_batch_checks() {
        let dir = tempfile::tempdir().unwrap();
        let store = AssetStore::open(dir.path().join("assets"), RecoveryConfig::default()).unwrap();

        let results = batch_checks(&store, dir.path()).run().unwrap();
        assert_eq!(results.len(), 2);

        let missing = dir.path().join("no-pages");
        assert!(batch_checks(&store, &missing).run().is_err());
    }
}
