//! Compiler invocation
//!
//! Builds the argument vector for one compilation, runs it through a
//! [`CompilerBackend`] and leaves two dump files next to the artifact so
//! any compilation can be reproduced by hand:
//!
//! - `<artifact>.args`: the arguments, one per line, written before the run
//! - `<artifact>.out`: arguments, diagnostics, exit code and duration

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use blackbox_core::ConfigError;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::artifact::Artifact;
use crate::diagnostics::{Diagnostic, DiagnosticCollector};
use crate::environment::Environment;
use crate::model::CompilerArgs;

/// What the compiler should produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProduceKind {
    Library,
    Program,
}

impl ProduceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Library => "library",
            Self::Program => "program",
        }
    }
}

/// Everything that varies between two compiler runs
#[derive(Debug, Clone)]
pub struct CompilerInvocation {
    pub produce: ProduceKind,
    pub output: PathBuf,
    /// Libraries to link, one `-l` each
    pub libraries: Vec<PathBuf>,
    /// Libraries whose internals are visible to the sources
    pub friends: Vec<PathBuf>,
    /// Libraries whose contents are included in the output
    pub included: Vec<PathBuf>,
    pub entry_point: Option<String>,
    pub generate_test_runner: bool,
    pub free_args: CompilerArgs,
    /// Source files grouped per module
    pub sources: Vec<Vec<PathBuf>>,
}

impl CompilerInvocation {
    pub fn new(produce: ProduceKind, output: impl Into<PathBuf>) -> Self {
        Self {
            produce,
            output: output.into(),
            libraries: Vec::new(),
            friends: Vec::new(),
            included: Vec::new(),
            entry_point: None,
            generate_test_runner: false,
            free_args: CompilerArgs::default(),
            sources: Vec::new(),
        }
    }

    /// Full argument vector, fixed flags first and sources last
    pub fn to_args(&self, env: &Environment) -> Vec<String> {
        let mut args: Vec<String> = env.fixed_flags().to_vec();

        args.push("-produce".to_string());
        args.push(self.produce.as_str().to_string());
        args.push("-output".to_string());
        args.push(path_arg(&self.output));
        args.push("-target".to_string());
        args.push(env.target().to_string());

        for library in &self.libraries {
            args.push("-l".to_string());
            args.push(path_arg(library));
        }

        if !self.friends.is_empty() {
            let joined = std::env::join_paths(&self.friends)
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|_| {
                    self.friends
                        .iter()
                        .map(|p| path_arg(p))
                        .collect::<Vec<_>>()
                        .join(PATH_SEPARATOR)
                });
            args.push("-friend-modules".to_string());
            args.push(joined);
        }

        for included in &self.included {
            args.push(format!("-Xinclude={}", path_arg(included)));
        }

        if self.generate_test_runner {
            args.push("-generate-test-runner".to_string());
        } else if let Some(entry) = &self.entry_point {
            args.push("-entry".to_string());
            args.push(entry.clone());
        }

        args.extend(self.free_args.as_slice().iter().cloned());
        args.extend(self.sources.iter().flatten().map(|p| path_arg(p)));
        args
    }
}

#[cfg(windows)]
const PATH_SEPARATOR: &str = ";";
#[cfg(not(windows))]
const PATH_SEPARATOR: &str = ":";

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Runs the compiler for a prepared argument vector.
///
/// Implementations feed every output line into `diagnostics` and return the
/// exit code. An `Err` means the compiler could not be started at all.
#[async_trait]
pub trait CompilerBackend: Send + Sync {
    /// Short name for logs and transcripts
    fn name(&self) -> &str;

    async fn execute(
        &self,
        args: &[String],
        diagnostics: &DiagnosticCollector,
    ) -> std::io::Result<i32>;
}

/// Runs the compiler binary as a subprocess
#[derive(Debug, Clone)]
pub struct ProcessCompiler {
    program: PathBuf,
}

impl ProcessCompiler {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Locate the compiler.
    ///
    /// Paths are taken as given. Bare names are looked up in
    /// `<home>/bin` first, then on `PATH`.
    pub fn locate(program: &str, home_dir: Option<&Path>) -> Result<Self, ConfigError> {
        let as_path = Path::new(program);
        if as_path.components().count() > 1 {
            return Ok(Self::new(as_path));
        }

        if let Some(home) = home_dir {
            let candidate = home.join("bin").join(program);
            if candidate.is_file() {
                debug!(program = %candidate.display(), "compiler found in home directory");
                return Ok(Self::new(candidate));
            }
        }

        which::which(program)
            .map(|path| {
                debug!(program = %path.display(), "compiler found on PATH");
                Self::new(path)
            })
            .map_err(|e| ConfigError::CompilerNotFound {
                program: program.to_string(),
                reason: e.to_string(),
            })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

#[async_trait]
impl CompilerBackend for ProcessCompiler {
    fn name(&self) -> &str {
        "process"
    }

    async fn execute(
        &self,
        args: &[String],
        diagnostics: &DiagnosticCollector,
    ) -> std::io::Result<i32> {
        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let read_stdout = async {
            if let Some(stdout) = stdout {
                drain_lines(stdout, diagnostics).await;
            }
        };
        let read_stderr = async {
            if let Some(stderr) = stderr {
                drain_lines(stderr, diagnostics).await;
            }
        };
        tokio::join!(read_stdout, read_stderr);

        let status = child.wait().await?;
        Ok(status.code().unwrap_or(-1))
    }
}

/// Feed every output line to `diagnostics` until the pipe closes.
///
/// Lines are decoded lossily so a stray non-UTF-8 byte neither ends the
/// read nor leaves the compiler blocked on a full pipe.
async fn drain_lines<R>(reader: R, diagnostics: &DiagnosticCollector)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                diagnostics.report_line(line.trim_end_matches(['\r', '\n']));
            }
            Err(e) => {
                debug!(error = %e, "compiler output stream failed");
                break;
            }
        }
    }
}

/// Captured record of one compiler run
#[derive(Debug, Clone)]
pub struct CompilerTranscript {
    pub backend: String,
    pub args: Vec<String>,
    pub diagnostics: Vec<Diagnostic>,
    /// Diagnostics grouped by file, as written to the `.out` dump
    pub rendered: String,
    /// `None` when the compiler never started
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

impl CompilerTranscript {
    fn render(&self, started: &chrono::DateTime<chrono::Utc>, reason: Option<&FailureReason>) -> String {
        let mut out = String::new();
        out.push_str(&format!("# started: {}\n", started.to_rfc3339()));
        out.push_str(&format!("# backend: {}\n", self.backend));
        match self.exit_code {
            Some(code) => out.push_str(&format!("# exit code: {code}\n")),
            None => out.push_str("# exit code: none\n"),
        }
        out.push_str(&format!("# duration: {} ms\n", self.duration.as_millis()));
        match reason {
            Some(reason) => out.push_str(&format!("# result: FAILED ({reason})\n")),
            None => out.push_str("# result: OK\n"),
        }
        out.push_str("\n## arguments\n");
        for arg in &self.args {
            out.push_str(arg);
            out.push('\n');
        }
        out.push_str("\n## diagnostics\n");
        out.push_str(&self.rendered);
        out
    }
}

/// Why a compilation failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureReason {
    #[error("compiler exited with code {0}")]
    NonZeroExit(i32),

    #[error("compiler reported {0} error(s)")]
    ErrorDiagnostics(usize),

    #[error("compiler could not be started: {0}")]
    Launch(String),
}

/// A failed compilation with everything needed to reproduce it
#[derive(Debug, Clone, thiserror::Error)]
#[error("Compilation of {artifact} failed: {reason}")]
pub struct CompilationFailure {
    pub artifact: Artifact,
    pub reason: FailureReason,
    pub transcript: CompilerTranscript,
}

/// Runs compilations and writes their dump files
pub struct CompilerInvoker {
    env: Arc<Environment>,
    invocations: AtomicUsize,
}

impl fmt::Debug for CompilerInvoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompilerInvoker")
            .field("backend", &self.env.compiler().name())
            .field("invocations", &self.invocations())
            .finish()
    }
}

impl CompilerInvoker {
    pub fn new(env: Arc<Environment>) -> Self {
        Self {
            env,
            invocations: AtomicUsize::new(0),
        }
    }

    pub fn environment(&self) -> &Arc<Environment> {
        &self.env
    }

    /// Number of times the backend was asked to run
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::Relaxed)
    }

    /// Compile `artifact`.
    ///
    /// Succeeds only with exit code 0 and no error diagnostics. The `.out`
    /// dump is written whatever the outcome.
    #[instrument(skip_all, fields(artifact = %artifact.path().display()))]
    pub async fn compile(
        &self,
        artifact: &Artifact,
        invocation: &CompilerInvocation,
    ) -> Result<Artifact, CompilationFailure> {
        let args = invocation.to_args(&self.env);
        let backend = self.env.compiler();
        let started = chrono::Utc::now();

        if let Err(e) = tokio::fs::create_dir_all(artifact.directory()).await {
            warn!(dir = %artifact.directory().display(), error = %e, "cannot create artifact directory");
        }
        write_dump(&artifact.args_dump(), &format!("{}\n", args.join("\n"))).await;

        info!(backend = backend.name(), produce = invocation.produce.as_str(), "invoking compiler");
        self.invocations.fetch_add(1, Ordering::Relaxed);

        let diagnostics = DiagnosticCollector::new();
        let clock = Instant::now();
        let outcome = backend.execute(&args, &diagnostics).await;
        let duration = clock.elapsed();

        let transcript = CompilerTranscript {
            backend: backend.name().to_string(),
            args,
            diagnostics: diagnostics.diagnostics(),
            rendered: diagnostics.render(),
            exit_code: outcome.as_ref().ok().copied(),
            duration,
        };

        let reason = match &outcome {
            Err(e) => Some(FailureReason::Launch(e.to_string())),
            Ok(code) if *code != 0 => Some(FailureReason::NonZeroExit(*code)),
            Ok(_) if diagnostics.has_errors() => {
                Some(FailureReason::ErrorDiagnostics(diagnostics.error_count()))
            }
            Ok(_) => None,
        };

        write_dump(&artifact.output_dump(), &transcript.render(&started, reason.as_ref())).await;

        match reason {
            None => {
                debug!(duration_ms = duration.as_millis() as u64, "compilation succeeded");
                Ok(artifact.clone())
            }
            Some(reason) => {
                warn!(%reason, duration_ms = duration.as_millis() as u64, "compilation failed");
                Err(CompilationFailure {
                    artifact: artifact.clone(),
                    reason,
                    transcript,
                })
            }
        }
    }
}

async fn write_dump(path: &Path, contents: &str) {
    if let Err(e) = tokio::fs::write(path, contents).await {
        warn!(path = %path.display(), error = %e, "failed to write compiler dump");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactKind;
    use crate::naming::ArtifactLayout;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Backend that replays canned output
    struct Scripted {
        exit_code: std::io::Result<i32>,
        lines: Vec<&'static str>,
        seen: Mutex<Vec<Vec<String>>>,
    }

    impl Scripted {
        fn new(exit_code: i32, lines: Vec<&'static str>) -> Self {
            Self {
                exit_code: Ok(exit_code),
                lines,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CompilerBackend for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn execute(
            &self,
            args: &[String],
            diagnostics: &DiagnosticCollector,
        ) -> std::io::Result<i32> {
            self.seen.lock().unwrap().push(args.to_vec());
            for line in &self.lines {
                diagnostics.report_line(line);
            }
            match &self.exit_code {
                Ok(code) => Ok(*code),
                Err(e) => Err(std::io::Error::new(e.kind(), e.to_string())),
            }
        }
    }

    fn env(dir: &Path, backend: Arc<dyn CompilerBackend>) -> Arc<Environment> {
        Arc::new(
            Environment::new("linux_x64", ArtifactLayout::new(dir, "klib", "kexe"), backend)
                .with_fixed_flags(vec!["-g".to_string()]),
        )
    }

    #[test]
    fn test_argument_order() {
        let temp = TempDir::new().unwrap();
        let env = env(temp.path(), Arc::new(Scripted::new(0, vec![])));

        let mut invocation = CompilerInvocation::new(ProduceKind::Program, "/out/t.kexe");
        invocation.libraries = vec![PathBuf::from("/out/a.klib")];
        invocation.friends = vec![PathBuf::from("/out/f1.klib"), PathBuf::from("/out/f2.klib")];
        invocation.included = vec![PathBuf::from("/out/root.klib")];
        invocation.generate_test_runner = true;
        invocation.entry_point = Some("ignored.main".to_string());
        invocation.free_args = CompilerArgs::new(vec!["-opt".to_string()]);
        invocation.sources = vec![vec![PathBuf::from("/src/a.kt")], vec![PathBuf::from("/src/b.kt")]];

        let args = invocation.to_args(&env);
        let friends = format!("/out/f1.klib{PATH_SEPARATOR}/out/f2.klib");
        assert_eq!(
            args,
            vec![
                "-g",
                "-produce",
                "program",
                "-output",
                "/out/t.kexe",
                "-target",
                "linux_x64",
                "-l",
                "/out/a.klib",
                "-friend-modules",
                friends.as_str(),
                "-Xinclude=/out/root.klib",
                "-generate-test-runner",
                "-opt",
                "/src/a.kt",
                "/src/b.kt",
            ]
        );
    }

    #[test]
    fn test_entry_point_without_runner() {
        let temp = TempDir::new().unwrap();
        let env = env(temp.path(), Arc::new(Scripted::new(0, vec![])));
        let mut invocation = CompilerInvocation::new(ProduceKind::Program, "/out/t.kexe");
        invocation.entry_point = Some("sample.main".to_string());

        let args = invocation.to_args(&env);
        let pos = args.iter().position(|a| a == "-entry").unwrap();
        assert_eq!(args[pos + 1], "sample.main");
        assert!(!args.iter().any(|a| a == "-friend-modules"));
    }

    #[tokio::test]
    async fn test_success_writes_dumps() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(Scripted::new(0, vec!["warning: something minor"]));
        let invoker = CompilerInvoker::new(env(temp.path(), backend.clone()));
        let artifact = Artifact::new(ArtifactKind::Library, temp.path().join("case/pkg-main.klib"));
        let invocation = CompilerInvocation::new(ProduceKind::Library, artifact.path());

        let produced = invoker.compile(&artifact, &invocation).await.unwrap();
        assert_eq!(produced, artifact);
        assert_eq!(invoker.invocations(), 1);

        let args_dump = std::fs::read_to_string(artifact.args_dump()).unwrap();
        assert!(args_dump.lines().any(|l| l == "-produce"));
        let out_dump = std::fs::read_to_string(artifact.output_dump()).unwrap();
        assert!(out_dump.contains("# exit code: 0"));
        assert!(out_dump.contains("warning: something minor"));
    }

    #[tokio::test]
    async fn test_error_diagnostic_fails_despite_zero_exit() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(Scripted::new(0, vec!["main.kt:1:1: error: unresolved"]));
        let invoker = CompilerInvoker::new(env(temp.path(), backend));
        let artifact = Artifact::new(ArtifactKind::Library, temp.path().join("lib.klib"));
        let invocation = CompilerInvocation::new(ProduceKind::Library, artifact.path());

        let failure = invoker.compile(&artifact, &invocation).await.unwrap_err();
        assert_eq!(failure.reason, FailureReason::ErrorDiagnostics(1));
        assert_eq!(failure.transcript.exit_code, Some(0));
        assert!(artifact.output_dump().exists());
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails() {
        let temp = TempDir::new().unwrap();
        let invoker = CompilerInvoker::new(env(temp.path(), Arc::new(Scripted::new(2, vec![]))));
        let artifact = Artifact::new(ArtifactKind::Executable, temp.path().join("t.kexe"));
        let invocation = CompilerInvocation::new(ProduceKind::Program, artifact.path());

        let failure = invoker.compile(&artifact, &invocation).await.unwrap_err();
        assert_eq!(failure.reason, FailureReason::NonZeroExit(2));
    }

    #[tokio::test]
    async fn test_launch_failure_still_dumps() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(Scripted {
            exit_code: Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no such file")),
            lines: vec![],
            seen: Mutex::new(Vec::new()),
        });
        let invoker = CompilerInvoker::new(env(temp.path(), backend));
        let artifact = Artifact::new(ArtifactKind::Library, temp.path().join("lib.klib"));
        let invocation = CompilerInvocation::new(ProduceKind::Library, artifact.path());

        let failure = invoker.compile(&artifact, &invocation).await.unwrap_err();
        assert!(matches!(failure.reason, FailureReason::Launch(_)));
        assert!(failure.transcript.exit_code.is_none());
        assert!(artifact.args_dump().exists());
        assert!(artifact.output_dump().exists());
    }

    #[test]
    fn test_locate_explicit_path() {
        let compiler = ProcessCompiler::locate("/opt/konan/bin/konanc", None).unwrap();
        assert_eq!(compiler.program(), Path::new("/opt/konan/bin/konanc"));
    }

    #[test]
    fn test_locate_in_home_dir() {
        let temp = TempDir::new().unwrap();
        let bin = temp.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join("fake-konanc"), "").unwrap();

        let compiler = ProcessCompiler::locate("fake-konanc", Some(temp.path())).unwrap();
        assert_eq!(compiler.program(), bin.join("fake-konanc"));
    }

    #[test]
    fn test_locate_missing_program() {
        let err = ProcessCompiler::locate("definitely-not-a-real-compiler-xyz", None).unwrap_err();
        assert!(matches!(err, ConfigError::CompilerNotFound { .. }));
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn script_compiler(dir: &Path, body: &str) -> ProcessCompiler {
            let path = dir.join("fake-konanc");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            ProcessCompiler::new(path)
        }

        #[tokio::test]
        async fn test_invalid_utf8_output_keeps_reading() {
            let temp = TempDir::new().unwrap();
            let compiler = script_compiler(
                temp.path(),
                r#"printf 'bad \377 byte\n'
i=0
while [ $i -lt 20000 ]; do echo "info: line $i"; i=$((i+1)); done
echo "a.kt:1:1: warning: after the bad byte" >&2
exit 0"#,
            );
            let invoker = CompilerInvoker::new(env(temp.path(), Arc::new(compiler)));
            let artifact = Artifact::new(ArtifactKind::Library, temp.path().join("lib.klib"));
            let invocation = CompilerInvocation::new(ProduceKind::Library, artifact.path());

            invoker.compile(&artifact, &invocation).await.unwrap();

            let out_dump = std::fs::read_to_string(artifact.output_dump()).unwrap();
            assert!(out_dump.contains("# exit code: 0"));
            assert!(out_dump.contains("bad \u{FFFD} byte"));
            assert!(out_dump.contains("info: line 19999"));
            assert!(out_dump.contains("warning: after the bad byte"));
        }
    }
}
