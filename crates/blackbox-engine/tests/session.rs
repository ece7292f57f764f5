//! End-to-end sessions against a fake compiler.
//!
//! The fake compiler turns a program's sources into a shell script, so the
//! "Kotlin" sources in these tests are really shell snippets.

#![cfg(unix)]

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use blackbox_engine::{
    ArtifactLayout, CollectingReporter, CompilerBackend, DiagnosticCollector, Environment, ExecutionFailure, Manifest,
    ManifestFormat, SessionEvent, SessionOptions, TestCaseStatus, TestSession, VerificationError,
};
use tempfile::TempDir;

/// Marker making the fake compiler fail on a source file
const FAIL_MARKER: &str = "#fail";

#[derive(Default)]
struct ShellCompiler {
    outputs: Mutex<HashMap<PathBuf, usize>>,
}

impl ShellCompiler {
    fn times_compiled(&self, suffix: &str) -> usize {
        self.outputs
            .lock()
            .unwrap()
            .iter()
            .filter(|(path, _)| path.to_string_lossy().ends_with(suffix))
            .map(|(_, count)| *count)
            .sum()
    }

    fn total(&self) -> usize {
        self.outputs.lock().unwrap().values().sum()
    }
}

fn arg_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

#[async_trait]
impl CompilerBackend for ShellCompiler {
    fn name(&self) -> &str {
        "shell"
    }

    async fn execute(&self, args: &[String], diagnostics: &DiagnosticCollector) -> std::io::Result<i32> {
        let output = PathBuf::from(arg_after(args, "-output").expect("output flag"));
        *self.outputs.lock().unwrap().entry(output.clone()).or_default() += 1;

        let sources: Vec<&String> = args.iter().filter(|a| a.ends_with(".kt")).collect();
        let mut body = String::new();
        for source in sources {
            let text = std::fs::read_to_string(source)?;
            if text.contains(FAIL_MARKER) {
                diagnostics.report_line(&format!("{source}:1:1: error: unresolved reference"));
                return Ok(1);
            }
            body.push_str(&text);
            body.push('\n');
        }

        if arg_after(args, "-produce") == Some("program") {
            std::fs::write(&output, format!("#!/bin/sh\n{body}"))?;
            std::fs::set_permissions(&output, std::fs::Permissions::from_mode(0o755))?;
        } else {
            std::fs::write(&output, body)?;
        }
        Ok(0)
    }
}

struct Fixture {
    _temp: TempDir,
    compiler: Arc<ShellCompiler>,
    reporter: Arc<CollectingReporter>,
    session: TestSession,
}

impl Fixture {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let compiler = Arc::new(ShellCompiler::default());
        let env = Environment::new(
            "linux_x64",
            ArtifactLayout::new(temp.path().join("out"), "klib", "kexe"),
            compiler.clone(),
        );
        let reporter = Arc::new(CollectingReporter::default());
        let session = TestSession::new(
            Arc::new(env),
            SessionOptions {
                concurrency: 1,
                run_timeout: Some(std::time::Duration::from_secs(30)),
            },
        )
        .with_reporter(reporter.clone());
        Self {
            _temp: temp,
            compiler,
            reporter,
            session,
        }
    }

    fn out(&self) -> &Path {
        self.session.factory().environment().output_dir()
    }
}

fn load(fixture: &Fixture, toml: &str) -> Vec<Arc<blackbox_engine::TestCase>> {
    let manifest = Manifest::parse(toml, ManifestFormat::Toml).unwrap();
    manifest
        .build(fixture.session.factory().environment().layout())
        .unwrap()
        .test_cases
}

#[tokio::test]
async fn test_shared_module_compiled_once() {
    let fixture = Fixture::new();
    let cases = load(
        &fixture,
        r##"
[[shared_modules]]
name = "support"
files = [{ name = "support.kt", text = "# support" }]

[[test_cases]]
id = "first"
kind = "standalone_no_test_runner"

[[test_cases.modules]]
name = "main"
dependencies = ["support"]
files = [{ name = "first.kt", text = "echo first" }]

[[test_cases]]
id = "second"
kind = "standalone_no_test_runner"

[[test_cases.modules]]
name = "main"
dependencies = ["support"]
files = [{ name = "second.kt", text = "echo second" }]
"##,
    );

    let summary = fixture.session.run(&cases).await;
    assert!(summary.all_passed(), "{:?}", summary.outcomes);
    assert_eq!(fixture.compiler.times_compiled("support.klib"), 1);
    assert_eq!(fixture.compiler.total(), 3);
    assert_eq!(summary.stats.compiler_invocations, 3);
    assert!(summary.stats.hits >= 1);

    let shared = fixture.out().join("shared").join("support.klib");
    assert!(shared.is_file());
    assert!(fixture.out().join("shared").join("support.klib.args").is_file());
    assert!(fixture.out().join("shared").join("support.klib.out").is_file());
}

#[tokio::test]
async fn test_failed_library_skips_dependents() {
    let fixture = Fixture::new();
    let cases = load(
        &fixture,
        r##"
[[test_cases]]
id = "broken"
kind = "standalone_no_test_runner"

[[test_cases.modules]]
name = "app"
dependencies = ["lib"]
files = [{ name = "app.kt", text = "echo app" }]

[[test_cases.modules]]
name = "lib"
files = [{ name = "lib.kt", text = "#fail" }]
"##,
    );

    let summary = fixture.session.run(&cases).await;
    let outcome = summary.outcome("broken").unwrap();
    match &outcome.status {
        TestCaseStatus::DependencyFailed(failures) => {
            assert_eq!(failures.len(), 1);
            assert!(failures[0].artifact.path().ends_with("default-lib.klib"));
            assert!(failures[0].transcript.rendered.contains("unresolved reference"));
        }
        other => panic!("unexpected status: {other:?}"),
    }

    // Only the library reached the compiler; the program left no dumps.
    assert_eq!(fixture.compiler.total(), 1);
    let case_dir = fixture.out().join("broken");
    assert!(case_dir.join("default-lib.klib.out").is_file());
    assert!(!case_dir.join("default.kexe.args").exists());
    assert!(!case_dir.join("default.kexe.out").exists());

    let skipped = fixture
        .reporter
        .events()
        .into_iter()
        .any(|e| matches!(e, SessionEvent::CompilationSkipped { .. }));
    assert!(skipped);
}

#[tokio::test]
async fn test_expected_output_comparison() {
    let fixture = Fixture::new();
    let cases = load(
        &fixture,
        r##"
[[test_cases]]
id = "ok"
kind = "standalone_no_test_runner"
expected_output = "OK\n"

[[test_cases.modules]]
name = "main"
files = [{ name = "ok.kt", text = "echo OK" }]

[[test_cases]]
id = "wrong"
kind = "standalone_no_test_runner"
expected_output = "OK\n"

[[test_cases.modules]]
name = "main"
files = [{ name = "wrong.kt", text = "echo FAIL" }]

[[test_cases]]
id = "echo-input"
kind = "standalone_no_test_runner"
input = "ping\n"
expected_output = "ping\n"

[[test_cases.modules]]
name = "main"
files = [{ name = "cat.kt", text = "cat" }]
"##,
    );

    let summary = fixture.session.run(&cases).await;
    assert!(summary.outcome("ok").unwrap().status.is_passed());
    assert!(summary.outcome("echo-input").unwrap().status.is_passed());
    match &summary.outcome("wrong").unwrap().status {
        TestCaseStatus::ExecutionFailed(ExecutionFailure::Verification { reason, .. }) => {
            assert_eq!(
                reason,
                &VerificationError::OutputMismatch {
                    expected: "OK\n".to_string(),
                    actual: "FAIL\n".to_string(),
                }
            );
        }
        other => panic!("unexpected status: {other:?}"),
    }
    assert_eq!(summary.passed(), 2);
    assert_eq!(summary.failed(), 1);
}

#[tokio::test]
async fn test_structured_protocol() {
    let fixture = Fixture::new();
    let cases = load(
        &fixture,
        r##"
[[test_cases]]
id = "passing"
kind = "standalone"
package = "codegen.box"

[[test_cases.modules]]
name = "main"
files = [{ name = "pass.kt", text = '''
echo "[ RUN      ] FooTest.test1"
echo "[       OK ] codegen.box.FooTest.test1 (0 ms)"
echo "hello from the test"
''' }]

[[test_cases]]
id = "failing"
kind = "standalone"
package = "codegen.fail"

[[test_cases.modules]]
name = "main"
files = [{ name = "fail.kt", text = '''
echo "[ RUN      ] FooTest.ok"
echo "[       OK ] codegen.fail.FooTest.ok (0 ms)"
echo "[ RUN      ] FooTest.bad"
echo "[  FAILED  ] codegen.fail.FooTest.bad (1 ms)"
''' }]

[[test_cases]]
id = "silent"
kind = "standalone"

[[test_cases.modules]]
name = "main"
files = [{ name = "silent.kt", text = "echo nothing to see" }]
"##,
    );

    let summary = fixture.session.run(&cases).await;

    match &summary.outcome("passing").unwrap().status {
        TestCaseStatus::Passed { report: Some(report) } => {
            assert_eq!(report.passed, vec!["codegen.box.FooTest.test1"]);
            assert_eq!(report.clean_stdout, "hello from the test\n");
        }
        other => panic!("unexpected status: {other:?}"),
    }

    match &summary.outcome("failing").unwrap().status {
        TestCaseStatus::ExecutionFailed(ExecutionFailure::Verification {
            reason: VerificationError::TestsFailed(failed),
            ..
        }) => {
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0].name, "codegen.fail.FooTest.bad");
            assert_eq!(failed[0].status, "FAILED");
        }
        other => panic!("unexpected status: {other:?}"),
    }

    assert!(matches!(
        &summary.outcome("silent").unwrap().status,
        TestCaseStatus::ExecutionFailed(ExecutionFailure::Verification {
            reason: VerificationError::NoTestsExecuted,
            ..
        })
    ));
}

#[tokio::test]
async fn test_grouped_executable_filters_by_package() {
    let fixture = Fixture::new();
    let cases = load(
        &fixture,
        r##"
[[test_cases]]
id = "alpha"
package = "suite.alpha"

[[test_cases.modules]]
name = "main"
files = [{ name = "alpha.kt", text = '''
case "$1" in "--ktest_filter=suite.alpha."*)
  echo "[ RUN      ] Alpha.test"
  echo "[       OK ] suite.alpha.Alpha.test (0 ms)"
  ;;
esac
''' }]

[[test_cases]]
id = "beta"
package = "suite.beta"

[[test_cases.modules]]
name = "main"
files = [{ name = "beta.kt", text = '''
case "$1" in "--ktest_filter=suite.beta."*)
  echo "[ RUN      ] Beta.test"
  echo "[       OK ] suite.beta.Beta.test (0 ms)"
  ;;
esac
''' }]
"##,
    );

    let plan = fixture.session.plan(&cases);
    assert_eq!(plan.len(), 1);
    assert!(plan[0].is_grouped());

    let summary = fixture.session.run(&cases).await;
    assert!(summary.all_passed(), "{:?}", summary.outcomes);
    // Root modules are compiled straight into the one shared program
    assert_eq!(fixture.compiler.times_compiled(".kexe"), 1);

    let alpha = summary.outcome("alpha").unwrap();
    let beta = summary.outcome("beta").unwrap();
    assert_eq!(alpha.executable, beta.executable);
    assert!(alpha.executable.as_ref().unwrap().starts_with(fixture.out().join("grouped")));

    match &alpha.status {
        TestCaseStatus::Passed { report: Some(report) } => {
            assert_eq!(report.passed, vec!["suite.alpha.Alpha.test"]);
        }
        other => panic!("unexpected status: {other:?}"),
    }
}
