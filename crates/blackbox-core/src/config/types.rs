//! Configuration types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration for Blackbox
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Version of the config schema
    #[serde(rename = "$schema")]
    pub schema: Option<String>,

    /// Test session configuration
    pub session: SessionConfig,

    /// Compiler configuration
    pub compiler: CompilerConfig,
}

/// Test session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Target platform identifier passed to the compiler
    pub target: String,

    /// Compiler installation / home directory
    pub home_dir: Option<PathBuf>,

    /// Base directory for sources, artifacts and dump files
    pub output_dir: PathBuf,

    /// Maximum number of test cases processed concurrently
    pub concurrency: Option<usize>,

    /// Deadline for a single test executable run, in seconds
    pub run_timeout_secs: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target: host_target().to_string(),
            home_dir: None,
            output_dir: PathBuf::from("build").join("blackbox"),
            concurrency: None,
            run_timeout_secs: None,
        }
    }
}

impl SessionConfig {
    /// Effective concurrency, falling back to available parallelism
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

/// How executables are produced from test modules
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompilationMode {
    /// Root module sources are compiled straight into the executable
    #[default]
    OneStage,
    /// Root modules are compiled to libraries first and included into the executable
    TwoStage,
}

impl CompilationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneStage => "one-stage",
            Self::TwoStage => "two-stage",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "one-stage" | "onestage" => Some(Self::OneStage),
            "two-stage" | "twostage" => Some(Self::TwoStage),
            _ => None,
        }
    }
}

/// Compiler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Compiler program (absolute path or a name looked up on PATH)
    pub program: String,

    /// Flags passed to every compiler invocation, before anything else
    pub fixed_flags: Vec<String>,

    /// Compilation mode for executables
    pub mode: CompilationMode,

    /// Extension of library artifacts (without the dot)
    pub library_extension: String,

    /// Extension of executable artifacts (without the dot)
    pub executable_extension: String,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            program: "konanc".to_string(),
            fixed_flags: vec!["-enable-assertions".to_string(), "-g".to_string()],
            mode: CompilationMode::OneStage,
            library_extension: "klib".to_string(),
            executable_extension: "kexe".to_string(),
        }
    }
}

/// Target identifier of the machine running the session
pub fn host_target() -> &'static str {
    match (std::env::consts::OS, std::env::consts::ARCH) {
        ("linux", "aarch64") => "linux_arm64",
        ("linux", _) => "linux_x64",
        ("macos", "aarch64") => "macos_arm64",
        ("macos", _) => "macos_x64",
        ("windows", _) => "mingw_x64",
        _ => "host",
    }
}
