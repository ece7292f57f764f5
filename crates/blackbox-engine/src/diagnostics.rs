//! Compiler diagnostics
//!
//! Compiler output is read line by line. Lines carrying a severity prefix
//! become structured diagnostics; everything else is kept as plain output.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Severity of a compiler message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Exception,
    Error,
    StrongWarning,
    Warning,
    Info,
    Logging,
    /// Unstructured compiler output
    Output,
}

impl Severity {
    /// Whether a message of this severity fails the compilation
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Exception | Self::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exception => "exception",
            Self::Error => "error",
            Self::StrongWarning => "strong warning",
            Self::Warning => "warning",
            Self::Info => "info",
            Self::Logging => "logging",
            Self::Output => "output",
        }
    }

    fn from_prefix(prefix: &str) -> Self {
        match prefix {
            "exception" => Self::Exception,
            "error" => Self::Error,
            "strong warning" => Self::StrongWarning,
            "warning" => Self::Warning,
            "info" => Self::Info,
            "logging" => Self::Logging,
            _ => Self::Output,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single compiler message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    /// `file:line:column` when the compiler reported one
    pub location: Option<String>,
}

fn line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^(?:(?P<location>.+?:\d+:\d+):\s+)?(?P<severity>exception|error|strong warning|warning|info|logging):\s*(?P<message>.*)$",
        )
        .expect("diagnostic pattern is valid")
    })
}

impl Diagnostic {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            location: None,
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Classify one line of compiler output
    pub fn parse_line(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        match line_pattern().captures(line) {
            Some(caps) => Self {
                severity: Severity::from_prefix(&caps["severity"]),
                message: caps["message"].to_string(),
                location: caps.name("location").map(|m| m.as_str().to_string()),
            },
            None => Self::new(Severity::Output, line),
        }
    }

    /// File part of the location, used for grouping
    pub fn file(&self) -> Option<&str> {
        let location = self.location.as_deref()?;
        let mut parts = location.rsplitn(3, ':');
        parts.next()?;
        parts.next()?;
        parts.next()
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.location, self.severity) {
            (_, Severity::Output) => f.write_str(&self.message),
            (Some(location), severity) => write!(f, "{location}: {severity}: {}", self.message),
            (None, severity) => write!(f, "{severity}: {}", self.message),
        }
    }
}

/// Thread-safe collector for the diagnostics of one compiler invocation.
///
/// Identical structured reports collapse into one; plain output lines are
/// all kept. The error count is tracked atomically so `has_errors` never
/// takes the lock.
#[derive(Debug, Default)]
pub struct DiagnosticCollector {
    state: Mutex<CollectorState>,
    error_count: AtomicUsize,
}

#[derive(Debug, Default)]
struct CollectorState {
    diagnostics: Vec<Diagnostic>,
    seen: HashSet<Diagnostic>,
}

impl DiagnosticCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a diagnostic; returns `false` for a duplicate
    pub fn report(&self, diagnostic: Diagnostic) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if diagnostic.severity != Severity::Output && !state.seen.insert(diagnostic.clone()) {
            return false;
        }
        if diagnostic.severity.is_error() {
            self.error_count.fetch_add(1, Ordering::Relaxed);
        }
        state.diagnostics.push(diagnostic);
        true
    }

    /// Parse and record one line of compiler output
    pub fn report_line(&self, line: &str) -> bool {
        self.report(Diagnostic::parse_line(line))
    }

    pub fn has_errors(&self) -> bool {
        self.error_count() > 0
    }

    pub fn error_count(&self) -> usize {
        self.error_count.load(Ordering::Relaxed)
    }

    /// Snapshot in report order
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .diagnostics
            .clone()
    }

    /// Diagnostics grouped by file; messages without a location come first
    pub fn grouped(&self) -> BTreeMap<Option<String>, Vec<Diagnostic>> {
        let mut groups: BTreeMap<Option<String>, Vec<Diagnostic>> = BTreeMap::new();
        for diagnostic in self.diagnostics() {
            groups
                .entry(diagnostic.file().map(str::to_string))
                .or_default()
                .push(diagnostic);
        }
        groups
    }

    /// Human-readable transcript section
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (file, diagnostics) in self.grouped() {
            if let Some(file) = file {
                out.push_str(&format!("--- {file}\n"));
            }
            for diagnostic in diagnostics {
                out.push_str(&diagnostic.to_string());
                out.push('\n');
            }
        }
        out
    }
}
