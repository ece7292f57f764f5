//! Session compilation cache
//!
//! Every compilation is keyed by its semantic inputs. The first request for
//! a key runs the compiler; every other request for an equal key, concurrent
//! or later, awaits and shares that one result. Failures are cached exactly
//! like successes.
//!
//! Before compiling anything the factory resolves all dependency and friend
//! libraries. If any of them failed, the compilation short-circuits to
//! [`CompilationOutput::DependencyFailures`] without touching the compiler.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use blackbox_core::CompilationMode;
use tokio::sync::OnceCell;
use tracing::{debug, instrument};

use crate::artifact::Artifact;
use crate::closure::EdgeKind;
use crate::compiler::{CompilationFailure, CompilerInvocation, CompilerInvoker, ProduceKind};
use crate::environment::Environment;
use crate::graph::GraphError;
use crate::model::{CompilerArgs, ModuleKey, ModuleRef, TestCase, TestCaseId, TestModule};
use crate::naming;
use crate::reporter::{SessionEvent, SessionReporter, TracingReporter};

/// Identity of a compilation within a session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CompilationCacheKey {
    /// One module compiled to a library under a set of free args
    Library {
        module: ModuleKey,
        free_args: CompilerArgs,
    },
    /// An executable for a set of root modules
    Executable { modules: BTreeSet<ModuleKey> },
}

impl fmt::Display for CompilationCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Library { module, free_args } if free_args.is_empty() => {
                write!(f, "library {module}")
            }
            Self::Library { module, free_args } => write!(f, "library {module} {free_args}"),
            Self::Executable { modules } => {
                let names: Vec<String> = modules.iter().map(|m| m.to_string()).collect();
                write!(f, "executable [{}]", names.join(", "))
            }
        }
    }
}

/// Result of a compilation
#[derive(Debug, Clone)]
pub enum CompilationOutput {
    Success(Artifact),
    Failure(Arc<CompilationFailure>),
    /// Not attempted: these upstream compilations failed
    DependencyFailures(Vec<Arc<CompilationFailure>>),
}

impl CompilationOutput {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn artifact(&self) -> Option<&Artifact> {
        match self {
            Self::Success(artifact) => Some(artifact),
            _ => None,
        }
    }

    /// Root-cause failures behind this output, empty on success
    pub fn failures(&self) -> Vec<Arc<CompilationFailure>> {
        match self {
            Self::Success(_) => Vec::new(),
            Self::Failure(failure) => vec![failure.clone()],
            Self::DependencyFailures(failures) => failures.clone(),
        }
    }
}

/// A memoized compilation
#[derive(Debug)]
pub struct Compilation {
    pub key: CompilationCacheKey,
    pub output: CompilationOutput,
}

/// Invalid compilation requests
#[derive(Debug, Clone, thiserror::Error)]
pub enum FactoryError {
    #[error("No test cases to compile")]
    NoTestCases,

    #[error("Test cases '{first}' and '{other}' use different compiler arguments")]
    MixedCompilerArgs { first: TestCaseId, other: TestCaseId },

    #[error("Standalone test case '{0}' cannot share an executable")]
    StandaloneGrouping(TestCaseId),

    #[error("Test case id '{0}' is already used by a different test case in this session")]
    ConflictingTestCase(TestCaseId),

    #[error("Test case '{test_case}' has no module '{module}'")]
    UnknownModule { test_case: TestCaseId, module: String },

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Counters for one factory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub compiler_invocations: usize,
}

type CompilationFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Arc<Compilation>, FactoryError>> + Send + 'a>>;

/// Produces libraries and executables, memoizing every compilation
pub struct CompilationFactory {
    invoker: CompilerInvoker,
    cells: Mutex<HashMap<CompilationCacheKey, Arc<OnceCell<Arc<Compilation>>>>>,
    /// Fingerprint of the test case first seen under each id
    owners: Mutex<HashMap<TestCaseId, String>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
    reporter: Arc<dyn SessionReporter>,
}

impl fmt::Debug for CompilationFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompilationFactory")
            .field("invoker", &self.invoker)
            .field("stats", &self.stats())
            .finish()
    }
}

impl CompilationFactory {
    pub fn new(env: Arc<Environment>) -> Self {
        Self {
            invoker: CompilerInvoker::new(env),
            cells: Mutex::new(HashMap::new()),
            owners: Mutex::new(HashMap::new()),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
            reporter: Arc::new(TracingReporter),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn SessionReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn environment(&self) -> &Arc<Environment> {
        self.invoker.environment()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            compiler_invocations: self.invoker.invocations(),
        }
    }

    /// Number of distinct keys requested so far
    pub fn len(&self) -> usize {
        self.cells.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Library for one module of a test case
    pub async fn module_to_library(
        &self,
        test_case: &TestCase,
        module: &str,
    ) -> Result<Arc<Compilation>, FactoryError> {
        self.claim(test_case)?;
        let module = test_case
            .module(module)
            .ok_or_else(|| FactoryError::UnknownModule {
                test_case: test_case.id().to_string(),
                module: module.to_string(),
            })?
            .clone();
        self.library(test_case, module).await
    }

    /// Executable for one or more test cases.
    ///
    /// Grouped test cases must share their free compiler args, and
    /// standalone test cases always get an executable of their own.
    #[instrument(skip_all, fields(test_cases = test_cases.len()))]
    pub async fn test_cases_to_executable(
        &self,
        test_cases: &[Arc<TestCase>],
    ) -> Result<Arc<Compilation>, FactoryError> {
        let first = test_cases.first().ok_or(FactoryError::NoTestCases)?;
        for other in &test_cases[1..] {
            if other.free_args() != first.free_args() {
                return Err(FactoryError::MixedCompilerArgs {
                    first: first.id().to_string(),
                    other: other.id().to_string(),
                });
            }
        }
        let mut ids = HashSet::new();
        for test_case in test_cases {
            if !ids.insert(test_case.id()) {
                return Err(FactoryError::ConflictingTestCase(test_case.id().to_string()));
            }
            self.claim(test_case)?;
        }
        if test_cases.len() > 1 {
            if let Some(standalone) = test_cases.iter().find(|tc| tc.kind().is_standalone()) {
                return Err(FactoryError::StandaloneGrouping(standalone.id().to_string()));
            }
        }

        let key = CompilationCacheKey::Executable {
            modules: test_cases.iter().map(|tc| tc.root_module().key()).collect(),
        };
        self.get_or_compute(key, || self.build_executable(test_cases))
            .await
    }

    /// Cache keys use test case ids, so one id must always mean the same
    /// test case for the lifetime of the factory.
    fn claim(&self, test_case: &TestCase) -> Result<(), FactoryError> {
        let fingerprint = fingerprint(test_case);
        let mut owners = self.owners.lock().unwrap_or_else(|e| e.into_inner());
        match owners.get(test_case.id()) {
            Some(existing) if *existing != fingerprint => {
                Err(FactoryError::ConflictingTestCase(test_case.id().to_string()))
            }
            Some(_) => Ok(()),
            None => {
                owners.insert(test_case.id().to_string(), fingerprint);
                Ok(())
            }
        }
    }

    fn library<'a>(&'a self, test_case: &'a TestCase, module: Arc<TestModule>) -> CompilationFuture<'a> {
        Box::pin(async move {
            let key = CompilationCacheKey::Library {
                module: module.key(),
                free_args: test_case.free_args().clone(),
            };
            self.get_or_compute(key, || self.build_library(test_case, module))
                .await
        })
    }

    async fn get_or_compute<F, Fut>(
        &self,
        key: CompilationCacheKey,
        compute: F,
    ) -> Result<Arc<Compilation>, FactoryError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CompilationOutput, FactoryError>>,
    {
        let cell = {
            let mut cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
            cells
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let mut computed = false;
        let flag = &mut computed;
        let init_key = key.clone();
        let compilation = cell
            .get_or_try_init(move || async move {
                *flag = true;
                let output = compute().await?;
                Ok::<_, FactoryError>(Arc::new(Compilation {
                    key: init_key,
                    output,
                }))
            })
            .await?
            .clone();

        if computed {
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!(%key, success = compilation.output.is_success(), "cache miss");
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(%key, "cache hit");
            self.reporter.report(&SessionEvent::CacheHit {
                key: key.to_string(),
            });
        }
        Ok(compilation)
    }

    /// Libraries of every module in `modules`, failures deduplicated by artifact
    async fn resolve_libraries(
        &self,
        test_case: &TestCase,
        modules: &[Arc<TestModule>],
    ) -> Result<(Vec<(ModuleKey, Artifact)>, Vec<Arc<CompilationFailure>>), FactoryError> {
        let mut artifacts = Vec::with_capacity(modules.len());
        let mut failures: Vec<Arc<CompilationFailure>> = Vec::new();
        let mut seen: HashSet<PathBuf> = HashSet::new();

        for module in modules {
            let compilation = self.library(test_case, module.clone()).await?;
            match &compilation.output {
                CompilationOutput::Success(artifact) => {
                    artifacts.push((module.key(), artifact.clone()));
                }
                output => {
                    for failure in output.failures() {
                        if seen.insert(failure.artifact.path().to_path_buf()) {
                            failures.push(failure);
                        }
                    }
                }
            }
        }
        Ok((artifacts, failures))
    }

    async fn build_library(
        &self,
        test_case: &TestCase,
        module: Arc<TestModule>,
    ) -> Result<CompilationOutput, FactoryError> {
        let env = self.environment();
        let artifact = env.layout().library(&module, test_case.free_args());

        let reachable = match module.as_exclusive() {
            Some(_) => test_case.transitive(module.name(), EdgeKind::All)?,
            None => Arc::new(Vec::new()),
        };
        let (libraries, failures) = self.resolve_libraries(test_case, &reachable).await?;
        if !failures.is_empty() {
            return Ok(self.skipped(&artifact, failures));
        }

        let mut invocation = CompilerInvocation::new(ProduceKind::Library, artifact.path());
        invocation.friends = direct_friends(&module, &libraries);
        invocation.libraries = libraries.into_iter().map(|(_, a)| a.path().to_path_buf()).collect();
        invocation.free_args = test_case.free_args().clone();
        invocation.sources = vec![source_paths(&module)];

        Ok(self.run_compiler(&artifact, &invocation).await)
    }

    async fn build_executable(
        &self,
        test_cases: &[Arc<TestCase>],
    ) -> Result<CompilationOutput, FactoryError> {
        let env = self.environment();
        let refs: Vec<&TestCase> = test_cases.iter().map(|tc| tc.as_ref()).collect();
        let artifact = env.layout().executable(&refs);
        let two_stage = env.mode() == CompilationMode::TwoStage;

        let mut libraries: Vec<(ModuleKey, Artifact)> = Vec::new();
        let mut included: Vec<PathBuf> = Vec::new();
        let mut friends: Vec<PathBuf> = Vec::new();
        let mut sources: Vec<Vec<PathBuf>> = Vec::new();
        let mut failures: Vec<Arc<CompilationFailure>> = Vec::new();
        let mut seen_failures: HashSet<PathBuf> = HashSet::new();
        let mut seen_libraries: HashSet<ModuleKey> = HashSet::new();

        for test_case in test_cases {
            let root = test_case.root_module().clone();
            let reachable = test_case.transitive(root.name(), EdgeKind::All)?;
            let (resolved, failed) = self.resolve_libraries(test_case, &reachable).await?;

            if two_stage {
                let compilation = self.library(test_case, root.clone()).await?;
                match &compilation.output {
                    CompilationOutput::Success(lib) => included.push(lib.path().to_path_buf()),
                    output => {
                        for failure in output.failures() {
                            if seen_failures.insert(failure.artifact.path().to_path_buf()) {
                                failures.push(failure);
                            }
                        }
                    }
                }
            } else {
                friends.extend(direct_friends(&root, &resolved));
                sources.push(source_paths(&root));
            }

            for failure in failed {
                if seen_failures.insert(failure.artifact.path().to_path_buf()) {
                    failures.push(failure);
                }
            }
            for (key, lib) in resolved {
                if seen_libraries.insert(key.clone()) {
                    libraries.push((key, lib));
                }
            }
        }

        if !failures.is_empty() {
            return Ok(self.skipped(&artifact, failures));
        }

        // Grouping guarantees a single kind and argument set here.
        let first = &test_cases[0];
        let mut invocation = CompilerInvocation::new(ProduceKind::Program, artifact.path());
        invocation.libraries = libraries.into_iter().map(|(_, a)| a.path().to_path_buf()).collect();
        invocation.friends = friends;
        invocation.included = included;
        invocation.generate_test_runner = first.kind().uses_test_runner();
        invocation.entry_point = first.extras().entry_point.clone();
        invocation.free_args = first.free_args().clone();
        invocation.sources = sources;

        Ok(self.run_compiler(&artifact, &invocation).await)
    }

    fn skipped(&self, artifact: &Artifact, failures: Vec<Arc<CompilationFailure>>) -> CompilationOutput {
        debug!(artifact = %artifact.path().display(), failed = failures.len(), "dependencies failed, not compiling");
        self.reporter.report(&SessionEvent::CompilationSkipped {
            artifact: artifact.path().to_path_buf(),
            failed_dependencies: failures.len(),
        });
        CompilationOutput::DependencyFailures(failures)
    }

    async fn run_compiler(&self, artifact: &Artifact, invocation: &CompilerInvocation) -> CompilationOutput {
        self.reporter.report(&SessionEvent::CompilationStarted {
            artifact: artifact.path().to_path_buf(),
            kind: artifact.kind(),
        });
        let start = Instant::now();
        let result = self.invoker.compile(artifact, invocation).await;
        self.reporter.report(&SessionEvent::CompilationFinished {
            artifact: artifact.path().to_path_buf(),
            success: result.is_ok(),
            duration: start.elapsed(),
        });

        match result {
            Ok(artifact) => CompilationOutput::Success(artifact),
            Err(failure) => CompilationOutput::Failure(Arc::new(failure)),
        }
    }
}

/// Library paths of the direct friends of `module`
fn direct_friends(module: &TestModule, libraries: &[(ModuleKey, Artifact)]) -> Vec<PathBuf> {
    let Some(exclusive) = module.as_exclusive() else {
        return Vec::new();
    };
    exclusive
        .friends()
        .iter()
        .filter_map(|friend| {
            let key = match friend {
                ModuleRef::Shared(shared) => shared.key(),
                ModuleRef::Local(name) => ModuleKey::Exclusive {
                    test_case: exclusive.test_case().to_string(),
                    module: name.clone(),
                },
            };
            libraries
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, artifact)| artifact.path().to_path_buf())
        })
        .collect()
}

/// Everything that makes two test cases with one id compile differently
fn fingerprint(test_case: &TestCase) -> String {
    let mut parts: Vec<String> = test_case.files().iter().map(|f| f.identity()).collect();
    parts.push(format!("order:{}", test_case.order().join(",")));
    parts.push(format!("args:{}", test_case.free_args()));
    parts.push(format!("kind:{}", test_case.kind().as_str()));
    naming::files_hash(parts)
}

fn source_paths(module: &TestModule) -> Vec<PathBuf> {
    module
        .files()
        .iter()
        .map(|f| f.location().to_path_buf())
        .collect()
}
