//! Structured test-runner output
//!
//! Test executables report each test with two consecutive stdout lines:
//!
//! ```text
//! [ RUN      ] FooTest.test1
//! [       OK ] codegen.box.FooTest.test1 (0 ms)
//! ```
//!
//! The first line marks a test start; the line right after it carries the
//! status token and the fully qualified test name. `OK` is a pass, any
//! other token a failure. Every line that is not part of such a pair is
//! kept as clean output, so tests can still print.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Status token of a passing test
pub const STATUS_OK: &str = "OK";

/// A test that reported a non-`OK` status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedTest {
    pub name: String,
    pub status: String,
}

/// Outcome of parsing one executable's stdout
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRunReport {
    pub passed: Vec<String>,
    pub failed: Vec<FailedTest>,
    /// Stdout with every protocol line removed
    pub clean_stdout: String,
}

impl TestRunReport {
    /// Number of tests that reported a status
    pub fn executed(&self) -> usize {
        self.passed.len() + self.failed.len()
    }
}

fn run_marker() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\[\s*RUN\s*\]").expect("run marker pattern is valid"))
}

fn status_line() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\[\s*([A-Z_]+)\s*\]\s+(\S+)(?:\s.*)?$").expect("status pattern is valid")
    })
}

/// Parse stdout line by line.
///
/// Each line is atomic: no attempt is made to stitch together lines that
/// were split or interleaved by the process.
pub fn parse(stdout: &str) -> TestRunReport {
    let mut report = TestRunReport::default();
    let mut after_run_marker = false;

    for raw in stdout.split_inclusive('\n') {
        let line = raw.trim_end_matches(['\n', '\r']);

        if after_run_marker {
            after_run_marker = false;
            if let Some(caps) = status_line().captures(line) {
                let status = &caps[1];
                if status != "RUN" {
                    let name = caps[2].to_string();
                    if status == STATUS_OK {
                        report.passed.push(name);
                    } else {
                        report.failed.push(FailedTest {
                            name,
                            status: status.to_string(),
                        });
                    }
                    continue;
                }
            }
        }

        if run_marker().is_match(line) {
            after_run_marker = true;
            continue;
        }

        report.clean_stdout.push_str(raw);
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pass_and_fail() {
        let report = parse("[ RUN ] foo\n[ OK ] pkg.Foo.test1\n[ RUN ] bar\n[ FAILED ] pkg.Bar.test2\n");
        assert_eq!(report.passed, vec!["pkg.Foo.test1"]);
        assert_eq!(
            report.failed,
            vec![FailedTest {
                name: "pkg.Bar.test2".to_string(),
                status: "FAILED".to_string(),
            }]
        );
        assert_eq!(report.executed(), 2);
        assert!(report.clean_stdout.is_empty());
    }

    #[test]
    fn test_gtest_style_padding_and_timing() {
        let report = parse(
            "[==========] Running 1 tests\n[ RUN      ] Foo.bar\n[       OK ] codegen.Foo.bar (3 ms)\n",
        );
        assert_eq!(report.passed, vec!["codegen.Foo.bar"]);
        assert_eq!(report.clean_stdout, "[==========] Running 1 tests\n");
    }

    #[test]
    fn test_status_requires_preceding_marker() {
        let report = parse("[ OK ] pkg.Stray.test\nhello\n");
        assert!(report.passed.is_empty());
        assert_eq!(report.clean_stdout, "[ OK ] pkg.Stray.test\nhello\n");
    }

    #[test]
    fn test_output_between_marker_and_status_is_kept() {
        let report = parse("[ RUN ] a\nprinted by test\n[ OK ] pkg.A.a\n");
        assert!(report.passed.is_empty());
        assert_eq!(report.clean_stdout, "printed by test\n[ OK ] pkg.A.a\n");
    }

    #[test]
    fn test_consecutive_markers() {
        let report = parse("[ RUN ] a\n[ RUN ] b\n[ OK ] pkg.B.b\n");
        assert_eq!(report.passed, vec!["pkg.B.b"]);
    }

    #[test]
    fn test_crlf_and_missing_trailing_newline() {
        let report = parse("[ RUN ] a\r\n[ OK ] pkg.A.a\r\nOK");
        assert_eq!(report.passed, vec!["pkg.A.a"]);
        assert_eq!(report.clean_stdout, "OK");
    }
}
