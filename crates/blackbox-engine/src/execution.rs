//! Running and verifying compiled test executables

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::artifact::Artifact;
use crate::model::{PackageName, TestCase};
use crate::protocol::{self, FailedTest, TestRunReport};

/// How to run one executable and what to expect from it
#[derive(Debug, Clone, Default)]
pub struct RunParameters {
    /// Written to stdin, which is then closed
    pub input: Option<String>,
    /// Exact expected output (clean stdout followed by stderr)
    pub expected_output: Option<String>,
    /// Every passed test must belong to this package
    pub package_filter: Option<PackageName>,
    /// Parse stdout with the structured test-runner protocol
    pub test_runner: bool,
    pub program_args: Vec<String>,
    pub timeout: Option<Duration>,
}

impl RunParameters {
    /// Parameters declared by a test case for a run of its own executable
    pub fn for_test_case(test_case: &TestCase) -> Self {
        Self {
            input: test_case.extras().input_data.clone(),
            expected_output: test_case.extras().expected_output.clone(),
            package_filter: None,
            test_runner: test_case.kind().uses_test_runner(),
            program_args: Vec::new(),
            timeout: None,
        }
    }

    pub fn with_package_filter(mut self, package: PackageName) -> Self {
        self.package_filter = Some(package);
        self
    }

    pub fn with_program_args(mut self, args: Vec<String>) -> Self {
        self.program_args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Everything observed while running an executable
#[derive(Debug, Clone, Serialize)]
pub struct RunTranscript {
    pub executable: PathBuf,
    pub args: Vec<String>,
    /// `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl fmt::Display for RunTranscript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "executable: {}", self.executable.display())?;
        writeln!(f, "args: {}", self.args.join(" "))?;
        match self.exit_code {
            Some(code) => writeln!(f, "exit code: {code}")?,
            None => writeln!(f, "exit code: none (terminated by signal)")?,
        }
        writeln!(f, "duration: {} ms", self.duration.as_millis())?;
        writeln!(f, "--- stdout\n{}", self.stdout)?;
        write!(f, "--- stderr\n{}", self.stderr)
    }
}

/// A broken verification invariant
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    #[error("process exited with code {}", .0.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string()))]
    NonZeroExit(Option<i32>),

    #[error("no tests were executed")]
    NoTestsExecuted,

    #[error("no tests passed")]
    NoTestsPassed,

    #[error("tests outside package '{filter}' were run: {}", tests.join(", "))]
    TestsOutsideFilter { filter: String, tests: Vec<String> },

    #[error("{} test(s) failed: {}", .0.len(), .0.iter().map(|t| format!("{} [{}]", t.name, t.status)).collect::<Vec<_>>().join(", "))]
    TestsFailed(Vec<FailedTest>),

    #[error("output mismatch")]
    OutputMismatch { expected: String, actual: String },
}

/// Why running an executable failed.
///
/// Every variant carries whatever was captured up to the failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutionFailure {
    #[error("Failed to launch {}: {message}", transcript.executable.display())]
    Launch {
        message: String,
        transcript: Box<RunTranscript>,
    },

    #[error("{} did not finish within {} ms", transcript.executable.display(), timeout.as_millis())]
    Timeout {
        timeout: Duration,
        transcript: Box<RunTranscript>,
    },

    #[error("Verification of {} failed: {reason}", transcript.executable.display())]
    Verification {
        reason: VerificationError,
        transcript: Box<RunTranscript>,
    },
}

impl ExecutionFailure {
    pub fn transcript(&self) -> &RunTranscript {
        match self {
            Self::Launch { transcript, .. }
            | Self::Timeout { transcript, .. }
            | Self::Verification { transcript, .. } => transcript,
        }
    }
}

/// A run that met every invariant
#[derive(Debug, Clone)]
pub struct ExecutionSuccess {
    pub transcript: RunTranscript,
    /// Parsed protocol output for test-runner executables
    pub report: Option<TestRunReport>,
}

/// How long pipe readers may keep draining once a timed-out process is killed
const OUTPUT_GRACE: Duration = Duration::from_millis(500);

/// One output pipe read into a shared buffer by a background task
struct OutputCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    handle: JoinHandle<()>,
}

impl OutputCapture {
    fn start<R>(reader: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = buffer.clone();
        let handle = tokio::spawn(async move {
            let Some(mut reader) = reader else {
                return;
            };
            let mut chunk = [0u8; 8192];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        sink.lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .extend_from_slice(&chunk[..n]);
                    }
                }
            }
        });
        Self { buffer, handle }
    }

    /// Wait for the pipe to close, or at most `grace`, and decode what arrived
    async fn finish(self, grace: Option<Duration>) -> String {
        let Self { buffer, mut handle } = self;
        match grace {
            Some(grace) => {
                if tokio::time::timeout(grace, &mut handle).await.is_err() {
                    handle.abort();
                }
            }
            None => {
                if let Err(e) = (&mut handle).await {
                    debug!(error = %e, "output reader stopped");
                }
            }
        }
        let bytes = buffer.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Run `executable` from its own directory and capture its output.
///
/// On timeout the process is killed and the failure keeps the output
/// captured so far.
#[instrument(skip_all, fields(executable = %executable.path().display()))]
pub async fn execute(
    executable: &Artifact,
    params: &RunParameters,
) -> Result<RunTranscript, ExecutionFailure> {
    let mut path = executable.path().to_path_buf();
    // The child runs from the artifact directory, so a relative program path would not resolve.
    if path.is_relative() {
        if let Ok(cwd) = std::env::current_dir() {
            path = cwd.join(path);
        }
    }
    let start = Instant::now();
    let transcript = |exit_code: Option<i32>, stdout: String, stderr: String| RunTranscript {
        executable: path.clone(),
        args: params.program_args.clone(),
        exit_code,
        stdout,
        stderr,
        duration: start.elapsed(),
    };

    let mut command = Command::new(&path);
    command
        .args(&params.program_args)
        .current_dir(executable.directory())
        .stdin(if params.input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return Err(ExecutionFailure::Launch {
                message: e.to_string(),
                transcript: Box::new(transcript(None, String::new(), String::new())),
            });
        }
    };

    if let (Some(input), Some(mut stdin)) = (params.input.clone(), child.stdin.take()) {
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(input.as_bytes()).await {
                debug!(error = %e, "stdin closed before input was written");
            }
            // stdin is dropped here, closing the pipe
        });
    }

    let stdout = OutputCapture::start(child.stdout.take());
    let stderr = OutputCapture::start(child.stderr.take());

    let waited = match params.timeout {
        Some(limit) => tokio::time::timeout(limit, child.wait()).await.ok(),
        None => Some(child.wait().await),
    };

    match waited {
        Some(Ok(status)) => {
            let stdout = stdout.finish(None).await;
            let stderr = stderr.finish(None).await;
            let transcript = transcript(status.code(), stdout, stderr);
            debug!(
                exit_code = ?transcript.exit_code,
                duration_ms = transcript.duration.as_millis() as u64,
                "executable finished"
            );
            Ok(transcript)
        }
        Some(Err(e)) => {
            let stdout = stdout.finish(Some(OUTPUT_GRACE)).await;
            let stderr = stderr.finish(Some(OUTPUT_GRACE)).await;
            Err(ExecutionFailure::Launch {
                message: e.to_string(),
                transcript: Box::new(transcript(None, stdout, stderr)),
            })
        }
        None => {
            let limit = params.timeout.unwrap_or_default();
            warn!(timeout_ms = limit.as_millis() as u64, "executable timed out");
            if let Err(e) = child.kill().await {
                debug!(error = %e, "failed to kill timed out executable");
            }
            let stdout = stdout.finish(Some(OUTPUT_GRACE)).await;
            let stderr = stderr.finish(Some(OUTPUT_GRACE)).await;
            Err(ExecutionFailure::Timeout {
                timeout: limit,
                transcript: Box::new(transcript(None, stdout, stderr)),
            })
        }
    }
}

/// Check a finished run against its parameters.
///
/// Checks run in a fixed order and stop at the first broken invariant:
/// exit code, then (for test-runner executables) executed, passed, package
/// filter and failed counts, then the expected output.
pub fn verify(
    transcript: RunTranscript,
    params: &RunParameters,
) -> Result<ExecutionSuccess, ExecutionFailure> {
    let fail = |reason: VerificationError, transcript: RunTranscript| {
        Err(ExecutionFailure::Verification {
            reason,
            transcript: Box::new(transcript),
        })
    };

    if transcript.exit_code != Some(0) {
        return fail(VerificationError::NonZeroExit(transcript.exit_code), transcript);
    }

    if !params.test_runner {
        if let Some(expected) = &params.expected_output {
            let actual = format!("{}{}", transcript.stdout, transcript.stderr);
            if &actual != expected {
                let reason = VerificationError::OutputMismatch {
                    expected: expected.clone(),
                    actual,
                };
                return fail(reason, transcript);
            }
        }
        return Ok(ExecutionSuccess {
            transcript,
            report: None,
        });
    }

    let report = protocol::parse(&transcript.stdout);

    if report.executed() == 0 {
        return fail(VerificationError::NoTestsExecuted, transcript);
    }
    if report.passed.is_empty() {
        return fail(VerificationError::NoTestsPassed, transcript);
    }
    if let Some(filter) = &params.package_filter {
        let outside: Vec<String> = report
            .passed
            .iter()
            .filter(|name| !filter.contains(name))
            .cloned()
            .collect();
        if !outside.is_empty() {
            let reason = VerificationError::TestsOutsideFilter {
                filter: filter.as_str().to_string(),
                tests: outside,
            };
            return fail(reason, transcript);
        }
    }
    if !report.failed.is_empty() {
        return fail(VerificationError::TestsFailed(report.failed.clone()), transcript);
    }
    if let Some(expected) = &params.expected_output {
        let actual = format!("{}{}", report.clean_stdout, transcript.stderr);
        if &actual != expected {
            let reason = VerificationError::OutputMismatch {
                expected: expected.clone(),
                actual,
            };
            return fail(reason, transcript);
        }
    }

    Ok(ExecutionSuccess {
        transcript,
        report: Some(report),
    })
}

/// Run and verify in one step
pub async fn run(
    executable: &Artifact,
    params: &RunParameters,
) -> Result<ExecutionSuccess, ExecutionFailure> {
    let transcript = execute(executable, params).await?;
    let result = verify(transcript, params);
    if let Err(failure) = &result {
        warn!(executable = %executable.path().display(), %failure, "verification failed");
    }
    result
}
