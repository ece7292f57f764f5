//! Test session: compile and run many test cases concurrently
//!
//! Compatible regular test cases are grouped into one executable and each
//! run of it is narrowed to one test case's package. Standalone test cases
//! always get an executable of their own. All groups share one
//! [`CompilationFactory`], so common libraries are compiled once.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use blackbox_core::SessionConfig;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};

use crate::artifact::Artifact;
use crate::cache::{CacheStats, CompilationFactory, CompilationOutput};
use crate::compiler::CompilationFailure;
use crate::environment::Environment;
use crate::execution::{self, ExecutionFailure, RunParameters};
use crate::model::{TestCase, TestCaseId};
use crate::protocol::TestRunReport;
use crate::reporter::{SessionEvent, SessionReporter, TracingReporter};

/// Program argument restricting a grouped executable to one package
pub fn package_filter_arg(package: &str) -> String {
    format!("--ktest_filter={package}.*")
}

/// Options for a session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Maximum number of executables compiled or run at once
    pub concurrency: usize,
    /// Deadline for each executable run
    pub run_timeout: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default())
    }
}

impl SessionOptions {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            concurrency: config.effective_concurrency().max(1),
            run_timeout: config.run_timeout_secs.map(Duration::from_secs),
        }
    }
}

/// Final status of one test case
#[derive(Debug, Clone)]
pub enum TestCaseStatus {
    Passed { report: Option<TestRunReport> },
    CompilationFailed(Arc<CompilationFailure>),
    DependencyFailed(Vec<Arc<CompilationFailure>>),
    ExecutionFailed(ExecutionFailure),
    /// The request itself was invalid
    Error(String),
}

impl TestCaseStatus {
    pub fn is_passed(&self) -> bool {
        matches!(self, Self::Passed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Passed { .. } => "passed",
            Self::CompilationFailed(_) => "compilation-failed",
            Self::DependencyFailed(_) => "dependency-failed",
            Self::ExecutionFailed(_) => "execution-failed",
            Self::Error(_) => "error",
        }
    }

    /// One-line human readable description
    pub fn summary(&self) -> String {
        match self {
            Self::Passed { report: Some(report) } => format!("{} test(s) passed", report.passed.len()),
            Self::Passed { report: None } => "passed".to_string(),
            Self::CompilationFailed(failure) => failure.to_string(),
            Self::DependencyFailed(failures) => {
                let names: Vec<String> = failures
                    .iter()
                    .map(|f| f.artifact.path().display().to_string())
                    .collect();
                format!("dependencies failed to compile: {}", names.join(", "))
            }
            Self::ExecutionFailed(failure) => failure.to_string(),
            Self::Error(message) => message.clone(),
        }
    }
}

/// Result for one test case
#[derive(Debug, Clone)]
pub struct TestCaseOutcome {
    pub id: TestCaseId,
    pub executable: Option<PathBuf>,
    pub status: TestCaseStatus,
    pub duration: Duration,
}

/// Serializable view of an outcome
#[derive(Debug, Clone, Serialize)]
pub struct OutcomeRecord {
    pub id: TestCaseId,
    pub status: &'static str,
    pub summary: String,
    pub executable: Option<PathBuf>,
    pub duration_ms: u64,
}

impl From<&TestCaseOutcome> for OutcomeRecord {
    fn from(outcome: &TestCaseOutcome) -> Self {
        Self {
            id: outcome.id.clone(),
            status: outcome.status.label(),
            summary: outcome.status.summary(),
            executable: outcome.executable.clone(),
            duration_ms: outcome.duration.as_millis() as u64,
        }
    }
}

/// Result of a whole session, in test case input order
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub outcomes: Vec<TestCaseOutcome>,
    pub stats: CacheStats,
    pub duration: Duration,
}

impl SessionSummary {
    pub fn passed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.status.is_passed()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.passed()
    }

    pub fn all_passed(&self) -> bool {
        self.failed() == 0
    }

    pub fn outcome(&self, id: &str) -> Option<&TestCaseOutcome> {
        self.outcomes.iter().find(|o| o.id == id)
    }
}

/// Test cases that share one executable
#[derive(Debug, Clone)]
pub struct ExecutionGroup {
    pub test_cases: Vec<Arc<TestCase>>,
    pub executable: Artifact,
}

impl ExecutionGroup {
    pub fn is_grouped(&self) -> bool {
        self.test_cases.len() > 1
    }
}

/// Split test cases into executables.
///
/// Regular test cases with a package share an executable with others using
/// the same free args, as long as no two packages in the group overlap.
/// Everything else runs alone.
pub fn group_test_cases(test_cases: &[Arc<TestCase>]) -> Vec<Vec<Arc<TestCase>>> {
    let mut groups: Vec<Vec<Arc<TestCase>>> = Vec::new();
    let mut open: Vec<usize> = Vec::new();

    for test_case in test_cases {
        let groupable = !test_case.kind().is_standalone() && !test_case.package().is_empty();
        if groupable {
            let slot = open.iter().copied().find(|&index| {
                let group = &groups[index];
                group[0].free_args() == test_case.free_args()
                    && group.iter().all(|other| !packages_overlap(other, test_case))
            });
            if let Some(index) = slot {
                groups[index].push(test_case.clone());
                continue;
            }
            open.push(groups.len());
        }
        groups.push(vec![test_case.clone()]);
    }

    groups
}

fn packages_overlap(a: &TestCase, b: &TestCase) -> bool {
    a.package().contains(b.package().as_str()) || b.package().contains(a.package().as_str())
}

/// Drives compilation and execution for a set of test cases
pub struct TestSession {
    env: Arc<Environment>,
    options: SessionOptions,
    factory: Arc<CompilationFactory>,
    reporter: Arc<dyn SessionReporter>,
}

impl TestSession {
    pub fn new(env: Arc<Environment>, options: SessionOptions) -> Self {
        let reporter: Arc<dyn SessionReporter> = Arc::new(TracingReporter);
        Self {
            factory: Arc::new(CompilationFactory::new(env.clone()).with_reporter(reporter.clone())),
            env,
            options,
            reporter,
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn SessionReporter>) -> Self {
        self.factory = Arc::new(CompilationFactory::new(self.env.clone()).with_reporter(reporter.clone()));
        self.reporter = reporter;
        self
    }

    pub fn factory(&self) -> &Arc<CompilationFactory> {
        &self.factory
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Executables that [`run`](Self::run) would produce, without compiling
    pub fn plan(&self, test_cases: &[Arc<TestCase>]) -> Vec<ExecutionGroup> {
        group_test_cases(test_cases)
            .into_iter()
            .map(|group| {
                let refs: Vec<&TestCase> = group.iter().map(|tc| tc.as_ref()).collect();
                let executable = self.env.layout().executable(&refs);
                ExecutionGroup {
                    test_cases: group,
                    executable,
                }
            })
            .collect()
    }

    /// Compile and run every test case.
    ///
    /// Every input gets exactly one outcome, in input order. A test case
    /// reusing an id seen earlier in the same call is not compiled and ends
    /// with an error.
    #[instrument(skip_all, fields(test_cases = test_cases.len()))]
    pub async fn run(&self, test_cases: &[Arc<TestCase>]) -> SessionSummary {
        let start = Instant::now();
        let mut slots: Vec<Option<TestCaseOutcome>> = test_cases.iter().map(|_| None).collect();
        let mut positions: HashMap<TestCaseId, usize> = HashMap::new();
        let mut runnable = Vec::with_capacity(test_cases.len());
        for (index, test_case) in test_cases.iter().enumerate() {
            if positions.contains_key(test_case.id()) {
                warn!(test_case = test_case.id(), "duplicate test case id, not running");
                let status = TestCaseStatus::Error(format!(
                    "Test case id '{}' is used by more than one test case",
                    test_case.id()
                ));
                slots[index] = Some(self.finish_without_run(test_case, status));
                continue;
            }
            positions.insert(test_case.id().to_string(), index);
            runnable.push(test_case.clone());
        }

        let semaphore = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let groups = group_test_cases(&runnable);
        info!(groups = groups.len(), concurrency = self.options.concurrency, "starting session");

        let mut handles = Vec::with_capacity(groups.len());
        for group in groups {
            let semaphore = semaphore.clone();
            let factory = self.factory.clone();
            let reporter = self.reporter.clone();
            let timeout = self.options.run_timeout;
            let ids: Vec<TestCaseId> = group.iter().map(|tc| tc.id().to_string()).collect();

            let handle = tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return Vec::new(),
                };
                run_group(&factory, &*reporter, &group, timeout).await
            });
            handles.push((ids, handle));
        }

        for (ids, handle) in handles {
            match handle.await {
                Ok(outcomes) => {
                    for outcome in outcomes {
                        if let Some(&index) = positions.get(&outcome.id) {
                            slots[index] = Some(outcome);
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "test group task failed");
                    for id in ids {
                        if let Some(&index) = positions.get(&id) {
                            slots[index] = Some(TestCaseOutcome {
                                id,
                                executable: None,
                                status: TestCaseStatus::Error(format!("task panicked: {e}")),
                                duration: Duration::ZERO,
                            });
                        }
                    }
                }
            }
        }

        let outcomes: Vec<TestCaseOutcome> = slots
            .into_iter()
            .zip(test_cases)
            .map(|(slot, test_case)| {
                slot.unwrap_or_else(|| {
                    self.finish_without_run(test_case, TestCaseStatus::Error("No outcome recorded".to_string()))
                })
            })
            .collect();
        let summary = SessionSummary {
            outcomes,
            stats: self.factory.stats(),
            duration: start.elapsed(),
        };

        self.reporter.report(&SessionEvent::SessionCompleted {
            total: summary.outcomes.len(),
            passed: summary.passed(),
            failed: summary.failed(),
            compiler_invocations: summary.stats.compiler_invocations,
            cache_hits: summary.stats.hits,
            duration: summary.duration,
        });
        summary
    }

    fn finish_without_run(&self, test_case: &TestCase, status: TestCaseStatus) -> TestCaseOutcome {
        let outcome = TestCaseOutcome {
            id: test_case.id().to_string(),
            executable: None,
            status,
            duration: Duration::ZERO,
        };
        self.reporter.report(&SessionEvent::TestCaseFinished {
            id: outcome.id.clone(),
            passed: false,
            summary: outcome.status.summary(),
            duration: outcome.duration,
        });
        outcome
    }
}

async fn run_group(
    factory: &CompilationFactory,
    reporter: &dyn SessionReporter,
    group: &[Arc<TestCase>],
    timeout: Option<Duration>,
) -> Vec<TestCaseOutcome> {
    let start = Instant::now();
    let finish = |test_case: &TestCase, executable: Option<PathBuf>, status: TestCaseStatus| {
        let outcome = TestCaseOutcome {
            id: test_case.id().to_string(),
            executable,
            status,
            duration: start.elapsed(),
        };
        reporter.report(&SessionEvent::TestCaseFinished {
            id: outcome.id.clone(),
            passed: outcome.status.is_passed(),
            summary: outcome.status.summary(),
            duration: outcome.duration,
        });
        outcome
    };

    let compilation = match factory.test_cases_to_executable(group).await {
        Ok(compilation) => compilation,
        Err(e) => {
            let message = e.to_string();
            return group
                .iter()
                .map(|tc| finish(tc, None, TestCaseStatus::Error(message.clone())))
                .collect();
        }
    };

    let executable = match &compilation.output {
        CompilationOutput::Success(artifact) => artifact.clone(),
        CompilationOutput::Failure(failure) => {
            return group
                .iter()
                .map(|tc| finish(tc, None, TestCaseStatus::CompilationFailed(failure.clone())))
                .collect();
        }
        CompilationOutput::DependencyFailures(failures) => {
            return group
                .iter()
                .map(|tc| finish(tc, None, TestCaseStatus::DependencyFailed(failures.clone())))
                .collect();
        }
    };

    let grouped = group.len() > 1;
    let mut outcomes = Vec::with_capacity(group.len());
    for test_case in group {
        let mut params = RunParameters::for_test_case(test_case).with_timeout(timeout);
        if grouped {
            params = params
                .with_program_args(vec![package_filter_arg(test_case.package().as_str())])
                .with_package_filter(test_case.package().clone());
        }

        reporter.report(&SessionEvent::ExecutionStarted {
            test_cases: vec![test_case.id().to_string()],
            executable: executable.path().to_path_buf(),
        });
        let status = match execution::run(&executable, &params).await {
            Ok(success) => TestCaseStatus::Passed {
                report: success.report,
            },
            Err(failure) => TestCaseStatus::ExecutionFailed(failure),
        };
        outcomes.push(finish(test_case, Some(executable.path().to_path_buf()), status));
    }
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::CompilerBackend;
    use crate::diagnostics::DiagnosticCollector;
    use crate::graph::{ModuleDraft, NoSharedModules, TestCaseBuilder};
    use crate::model::{CompilerArgs, PackageName, TestFile, TestKind};
    use crate::naming::ArtifactLayout;
    use async_trait::async_trait;
    use std::path::Path;
    use tempfile::TempDir;

    struct FailingCompiler;

    #[async_trait]
    impl CompilerBackend for FailingCompiler {
        fn name(&self) -> &str {
            "failing"
        }

        async fn execute(&self, _: &[String], diagnostics: &DiagnosticCollector) -> std::io::Result<i32> {
            diagnostics.report_line("error: nothing compiles here");
            Ok(1)
        }
    }

    fn case(dir: &Path, id: &str, package: &str, kind: TestKind, args: &[&str]) -> Arc<TestCase> {
        let file = Arc::new(TestFile::new(dir.join(id).join("main.kt"), "main", "fun main() {}"));
        Arc::new(
            TestCaseBuilder::new(id)
                .with_kind(kind)
                .with_package(PackageName::new(package))
                .with_free_args(CompilerArgs::new(args.iter().map(|a| a.to_string()).collect()))
                .with_module(ModuleDraft::new("main").with_file(file))
                .build(&NoSharedModules)
                .unwrap(),
        )
    }

    fn ids(group: &[Arc<TestCase>]) -> Vec<&str> {
        group.iter().map(|tc| tc.id()).collect()
    }

    #[test]
    fn test_grouping() {
        let temp = TempDir::new().unwrap();
        let cases = vec![
            case(temp.path(), "a", "box.a", TestKind::Regular, &[]),
            case(temp.path(), "b", "box.b", TestKind::Regular, &[]),
            case(temp.path(), "alone", "box.c", TestKind::Standalone, &[]),
            case(temp.path(), "opt", "box.d", TestKind::Regular, &["-opt"]),
            case(temp.path(), "nested", "box.a.inner", TestKind::Regular, &[]),
            case(temp.path(), "nopkg", "", TestKind::Regular, &[]),
        ];

        let groups = group_test_cases(&cases);
        let groups: Vec<Vec<&str>> = groups.iter().map(|g| ids(g)).collect();
        assert_eq!(
            groups,
            vec![
                vec!["a", "b"],
                vec!["alone"],
                vec!["opt"],
                vec!["nested"],
                vec!["nopkg"],
            ]
        );
    }

    #[test]
    fn test_package_filter_arg() {
        assert_eq!(package_filter_arg("codegen.box"), "--ktest_filter=codegen.box.*");
    }

    #[test]
    fn test_plan_names_grouped_executables() {
        let temp = TempDir::new().unwrap();
        let env = Environment::new(
            "linux_x64",
            ArtifactLayout::new(temp.path(), "klib", "kexe"),
            Arc::new(FailingCompiler),
        );
        let session = TestSession::new(Arc::new(env), SessionOptions::default());
        let cases = vec![
            case(temp.path(), "a", "box.a", TestKind::Regular, &[]),
            case(temp.path(), "b", "box.b", TestKind::Regular, &[]),
        ];

        let plan = session.plan(&cases);
        assert_eq!(plan.len(), 1);
        assert!(plan[0].is_grouped());
        assert!(plan[0].executable.path().starts_with(temp.path().join("grouped")));
        assert!(session.factory().is_empty());
    }

    #[tokio::test]
    async fn test_compilation_failure_reported_per_case() {
        let temp = TempDir::new().unwrap();
        let env = Environment::new(
            "linux_x64",
            ArtifactLayout::new(temp.path(), "klib", "kexe"),
            Arc::new(FailingCompiler),
        );
        let session = TestSession::new(
            Arc::new(env),
            SessionOptions {
                concurrency: 2,
                run_timeout: None,
            },
        );
        let cases = vec![
            case(temp.path(), "a", "box.a", TestKind::Regular, &[]),
            case(temp.path(), "b", "box.b", TestKind::Regular, &[]),
            case(temp.path(), "c", "box.c", TestKind::Standalone, &[]),
        ];

        let summary = session.run(&cases).await;
        assert_eq!(summary.outcomes.len(), 3);
        assert_eq!(summary.failed(), 3);
        assert!(!summary.all_passed());
        let ids: Vec<&str> = summary.outcomes.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        for outcome in &summary.outcomes {
            assert!(matches!(outcome.status, TestCaseStatus::CompilationFailed(_)));
        }
        // One grouped executable for a and b, one for c
        assert_eq!(summary.stats.compiler_invocations, 2);

        let record = OutcomeRecord::from(summary.outcome("a").unwrap());
        assert_eq!(record.status, "compilation-failed");
    }

    #[tokio::test]
    async fn test_duplicate_ids_keep_every_outcome() {
        let temp = TempDir::new().unwrap();
        let env = Environment::new(
            "linux_x64",
            ArtifactLayout::new(temp.path().join("out"), "klib", "kexe"),
            Arc::new(FailingCompiler),
        );
        let session = TestSession::new(Arc::new(env), SessionOptions::default());
        let build = |dir: &str, text: &str| {
            let file = Arc::new(TestFile::new(temp.path().join(dir).join("main.kt"), "main", text));
            Arc::new(
                TestCaseBuilder::new("dup")
                    .with_module(ModuleDraft::new("main").with_file(file))
                    .build(&NoSharedModules)
                    .unwrap(),
            )
        };
        let cases = vec![build("one", "FIRST"), build("two", "SECOND")];

        let summary = session.run(&cases).await;
        assert_eq!(summary.outcomes.len(), 2);
        assert!(matches!(summary.outcomes[0].status, TestCaseStatus::CompilationFailed(_)));
        match &summary.outcomes[1].status {
            TestCaseStatus::Error(message) => assert!(message.contains("dup"), "{message}"),
            other => panic!("unexpected status {}", other.label()),
        }
        assert_eq!(summary.stats.compiler_invocations, 1);
    }
}
