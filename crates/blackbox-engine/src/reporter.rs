//! Session progress reporting

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::artifact::ArtifactKind;
use crate::model::TestCaseId;

/// Events emitted while a session compiles and runs test cases
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The compiler is about to run for an artifact
    CompilationStarted {
        artifact: PathBuf,
        kind: ArtifactKind,
    },
    /// The compiler finished
    CompilationFinished {
        artifact: PathBuf,
        success: bool,
        duration: Duration,
    },
    /// A compilation was not attempted because dependencies failed
    CompilationSkipped {
        artifact: PathBuf,
        failed_dependencies: usize,
    },
    /// A compilation result was reused
    CacheHit { key: String },
    /// An executable is about to run for one or more test cases
    ExecutionStarted {
        test_cases: Vec<TestCaseId>,
        executable: PathBuf,
    },
    /// A test case reached its final status
    TestCaseFinished {
        id: TestCaseId,
        passed: bool,
        summary: String,
        duration: Duration,
    },
    /// All test cases are done
    SessionCompleted {
        total: usize,
        passed: usize,
        failed: usize,
        compiler_invocations: usize,
        cache_hits: usize,
        duration: Duration,
    },
}

/// Receives session events
pub trait SessionReporter: Send + Sync {
    fn report(&self, event: &SessionEvent);
}

/// Reporter that logs to tracing
#[derive(Debug, Default)]
pub struct TracingReporter;

impl SessionReporter for TracingReporter {
    fn report(&self, event: &SessionEvent) {
        match event {
            SessionEvent::CompilationStarted { artifact, kind } => {
                tracing::info!("Compiling {} {}", kind.as_str(), artifact.display());
            }
            SessionEvent::CompilationFinished {
                artifact,
                success,
                duration,
            } => {
                if *success {
                    tracing::info!("Compiled {} in {:.1}s", artifact.display(), duration.as_secs_f64());
                } else {
                    tracing::warn!(
                        "Compilation of {} failed after {:.1}s",
                        artifact.display(),
                        duration.as_secs_f64()
                    );
                }
            }
            SessionEvent::CompilationSkipped {
                artifact,
                failed_dependencies,
            } => {
                tracing::warn!(
                    "Skipped {}: {} failed dependencies",
                    artifact.display(),
                    failed_dependencies
                );
            }
            SessionEvent::CacheHit { key } => {
                tracing::debug!("Reusing compilation {}", key);
            }
            SessionEvent::ExecutionStarted {
                test_cases,
                executable,
            } => {
                tracing::info!("Running {} for {}", executable.display(), test_cases.join(", "));
            }
            SessionEvent::TestCaseFinished {
                id,
                passed,
                summary,
                duration,
            } => {
                if *passed {
                    tracing::info!("{} passed in {:.1}s", id, duration.as_secs_f64());
                } else {
                    tracing::warn!("{} failed after {:.1}s: {}", id, duration.as_secs_f64(), summary);
                }
            }
            SessionEvent::SessionCompleted {
                total,
                passed,
                failed,
                compiler_invocations,
                cache_hits,
                duration,
            } => {
                tracing::info!(
                    "Session complete: {}/{} passed, {} failed, {} compiler runs, {} cache hits ({:.1}s)",
                    passed,
                    total,
                    failed,
                    compiler_invocations,
                    cache_hits,
                    duration.as_secs_f64()
                );
            }
        }
    }
}

/// Reporter that keeps every event, for tests
#[derive(Debug, Default)]
pub struct CollectingReporter {
    events: Mutex<Vec<SessionEvent>>,
}

impl CollectingReporter {
    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl SessionReporter for CollectingReporter {
    fn report(&self, event: &SessionEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}

/// Fans events out to several reporters
pub struct ReporterRegistry {
    reporters: Vec<Arc<dyn SessionReporter>>,
}

impl ReporterRegistry {
    /// Registry with the tracing reporter installed
    pub fn new() -> Self {
        Self {
            reporters: vec![Arc::new(TracingReporter)],
        }
    }

    pub fn empty() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    pub fn register(&mut self, reporter: Arc<dyn SessionReporter>) {
        self.reporters.push(reporter);
    }

    pub fn all(&self) -> &[Arc<dyn SessionReporter>] {
        &self.reporters
    }
}

impl Default for ReporterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionReporter for ReporterRegistry {
    fn report(&self, event: &SessionEvent) {
        for reporter in &self.reporters {
            reporter.report(event);
        }
    }
}
