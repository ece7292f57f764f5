//! Test model: files, modules and test cases

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::closure::{ClosureTable, EdgeKind, ModuleSet};
use crate::graph::GraphError;

/// Identifier of a test case, unique within a session
pub type TestCaseId = String;

/// Content state of a test file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileState {
    /// Text is held in memory and may still be patched
    Uncommitted(String),
    /// Text was flushed to disk; only its digest is retained
    Committed { digest: String },
}

/// A single source file of a test module.
///
/// Equality and hashing use the file location only.
#[derive(Debug)]
pub struct TestFile {
    location: PathBuf,
    module: String,
    state: Mutex<FileState>,
}

impl TestFile {
    /// Create an uncommitted file owned by `module`
    pub fn new(
        location: impl Into<PathBuf>,
        module: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            location: location.into(),
            module: module.into(),
            state: Mutex::new(FileState::Uncommitted(text.into())),
        }
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    /// Name of the module owning this file
    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn is_committed(&self) -> bool {
        matches!(*self.state(), FileState::Committed { .. })
    }

    /// In-memory text, or `None` once committed
    pub fn text(&self) -> Option<String> {
        match &*self.state() {
            FileState::Uncommitted(text) => Some(text.clone()),
            FileState::Committed { .. } => None,
        }
    }

    /// Apply a source-patching step to the in-memory text
    pub fn patch<F: FnOnce(&mut String)>(&self, f: F) -> Result<(), GraphError> {
        match &mut *self.state() {
            FileState::Uncommitted(text) => {
                f(text);
                Ok(())
            }
            FileState::Committed { .. } => Err(GraphError::AlreadyCommitted(self.location.clone())),
        }
    }

    /// Flush the text to disk and release it.
    ///
    /// Returns `true` when this call wrote the file, `false` when it was
    /// already committed.
    pub fn commit(&self) -> Result<bool, GraphError> {
        let mut state = self.state();
        let text = match &*state {
            FileState::Committed { .. } => return Ok(false),
            FileState::Uncommitted(text) => text,
        };

        let io_err = |e: std::io::Error| GraphError::Commit {
            path: self.location.clone(),
            message: e.to_string(),
        };
        if let Some(parent) = self.location.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        std::fs::write(&self.location, text.as_bytes()).map_err(io_err)?;

        let digest = content_digest(text);
        debug!(path = %self.location.display(), %digest, "committed test file");
        *state = FileState::Committed { digest };
        Ok(true)
    }

    /// SHA-256 of the file text, available in both states
    pub fn digest(&self) -> String {
        match &*self.state() {
            FileState::Uncommitted(text) => content_digest(text),
            FileState::Committed { digest } => digest.clone(),
        }
    }

    /// Identity used for artifact naming: location plus content digest
    pub fn identity(&self) -> String {
        format!("{}#{}", self.location.display(), self.digest())
    }

    fn state(&self) -> MutexGuard<'_, FileState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl PartialEq for TestFile {
    fn eq(&self, other: &Self) -> bool {
        self.location == other.location
    }
}

impl Eq for TestFile {}

impl Hash for TestFile {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.location.hash(state);
    }
}

fn content_digest(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Nominal (dotted) package name of a test case
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageName(String);

impl PackageName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Dotted segments, empty for the default package
    pub fn segments(&self) -> Vec<&str> {
        if self.0.is_empty() {
            Vec::new()
        } else {
            self.0.split('.').collect()
        }
    }

    /// Whether a fully qualified test name belongs to this package
    pub fn contains(&self, qualified_name: &str) -> bool {
        if self.0.is_empty() {
            return true;
        }
        qualified_name == self.0
            || qualified_name
                .strip_prefix(self.0.as_str())
                .is_some_and(|rest| rest.starts_with('.'))
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "<default>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Free compiler arguments supplied by a test case
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompilerArgs(Vec<String>);

impl CompilerArgs {
    pub fn new(args: Vec<String>) -> Self {
        Self(args)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<String>> for CompilerArgs {
    fn from(args: Vec<String>) -> Self {
        Self(args)
    }
}

impl fmt::Display for CompilerArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(" "))
    }
}

/// Kind of a test case
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestKind {
    /// Uses the generated test runner; may share an executable with other regular tests
    #[default]
    Regular,
    /// Uses the generated test runner in its own executable
    Standalone,
    /// Plain program with its own entry point, compared by output only
    StandaloneNoTestRunner,
}

impl TestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Regular => "regular",
            Self::Standalone => "standalone",
            Self::StandaloneNoTestRunner => "standalone_no_test_runner",
        }
    }

    /// Whether the executable reports results through the structured protocol
    pub fn uses_test_runner(&self) -> bool {
        !matches!(self, Self::StandaloneNoTestRunner)
    }

    pub fn is_standalone(&self) -> bool {
        !matches!(self, Self::Regular)
    }
}

/// Optional per-test-case inputs beyond sources and flags
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestCaseExtras {
    /// Fully qualified entry point for programs without a test runner
    pub entry_point: Option<String>,
    /// Payload written to the executable's stdin
    pub input_data: Option<String>,
    /// Exact expected stdout + stderr
    pub expected_output: Option<String>,
}

/// Stable identity of a module within a session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ModuleKey {
    Exclusive { test_case: TestCaseId, module: String },
    Shared { module: String },
}

impl fmt::Display for ModuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exclusive { test_case, module } => write!(f, "{}/{}", test_case, module),
            Self::Shared { module } => write!(f, "shared/{}", module),
        }
    }
}

/// A resolved dependency or friend reference
#[derive(Debug, Clone)]
pub enum ModuleRef {
    /// Another exclusive module of the same test case
    Local(String),
    /// A module shared across test cases
    Shared(Arc<TestModule>),
}

impl ModuleRef {
    pub fn name(&self) -> &str {
        match self {
            Self::Local(name) => name,
            Self::Shared(module) => module.name(),
        }
    }
}

/// A module usable as a dependency by many test cases
#[derive(Debug)]
pub struct SharedModule {
    name: String,
    files: Vec<Arc<TestFile>>,
}

impl SharedModule {
    pub fn new(name: impl Into<String>, files: Vec<Arc<TestFile>>) -> Self {
        Self {
            name: name.into(),
            files,
        }
    }
}

/// A module owned by exactly one test case
#[derive(Debug)]
pub struct ExclusiveModule {
    name: String,
    files: Vec<Arc<TestFile>>,
    test_case: TestCaseId,
    package: PackageName,
    dependency_names: BTreeSet<String>,
    friend_names: BTreeSet<String>,
    dependencies: OnceLock<Vec<ModuleRef>>,
    friends: OnceLock<Vec<ModuleRef>>,
}

impl ExclusiveModule {
    pub(crate) fn new(
        name: String,
        files: Vec<Arc<TestFile>>,
        test_case: TestCaseId,
        package: PackageName,
        dependency_names: BTreeSet<String>,
        friend_names: BTreeSet<String>,
    ) -> Self {
        Self {
            name,
            files,
            test_case,
            package,
            dependency_names,
            friend_names,
            dependencies: OnceLock::new(),
            friends: OnceLock::new(),
        }
    }

    pub fn test_case(&self) -> &str {
        &self.test_case
    }

    pub fn package(&self) -> &PackageName {
        &self.package
    }

    pub fn dependency_names(&self) -> &BTreeSet<String> {
        &self.dependency_names
    }

    pub fn friend_names(&self) -> &BTreeSet<String> {
        &self.friend_names
    }

    /// Resolved direct dependencies (empty until the graph is bound)
    pub fn dependencies(&self) -> &[ModuleRef] {
        self.dependencies.get().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Resolved direct friends (empty until the graph is bound)
    pub fn friends(&self) -> &[ModuleRef] {
        self.friends.get().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Direct edges of the given kind, dependencies before friends
    pub fn edges(&self, kind: EdgeKind) -> Vec<&ModuleRef> {
        match kind {
            EdgeKind::Dependencies => self.dependencies().iter().collect(),
            EdgeKind::Friends => self.friends().iter().collect(),
            EdgeKind::All => self.dependencies().iter().chain(self.friends()).collect(),
        }
    }

    pub(crate) fn bind(
        &self,
        dependencies: Vec<ModuleRef>,
        friends: Vec<ModuleRef>,
    ) -> Result<(), GraphError> {
        let already_bound = || GraphError::AlreadyBound(self.name.clone());
        self.dependencies.set(dependencies).map_err(|_| already_bound())?;
        self.friends.set(friends).map_err(|_| already_bound())?;
        Ok(())
    }
}

/// A test module
#[derive(Debug)]
pub enum TestModule {
    Exclusive(ExclusiveModule),
    Shared(SharedModule),
}

impl TestModule {
    pub fn name(&self) -> &str {
        match self {
            Self::Exclusive(m) => &m.name,
            Self::Shared(m) => &m.name,
        }
    }

    pub fn files(&self) -> &[Arc<TestFile>] {
        match self {
            Self::Exclusive(m) => &m.files,
            Self::Shared(m) => &m.files,
        }
    }

    pub fn key(&self) -> ModuleKey {
        match self {
            Self::Exclusive(m) => ModuleKey::Exclusive {
                test_case: m.test_case.clone(),
                module: m.name.clone(),
            },
            Self::Shared(m) => ModuleKey::Shared {
                module: m.name.clone(),
            },
        }
    }

    pub fn as_exclusive(&self) -> Option<&ExclusiveModule> {
        match self {
            Self::Exclusive(m) => Some(m),
            Self::Shared(_) => None,
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, Self::Shared(_))
    }

    /// Direct edges of the given kind; shared modules have none
    pub fn edges(&self, kind: EdgeKind) -> Vec<&ModuleRef> {
        self.as_exclusive().map(|m| m.edges(kind)).unwrap_or_default()
    }
}

/// A test case: a graph of exclusive modules compiled and run together
#[derive(Debug)]
pub struct TestCase {
    id: TestCaseId,
    kind: TestKind,
    modules: BTreeMap<String, Arc<TestModule>>,
    free_args: CompilerArgs,
    origin: String,
    package: PackageName,
    extras: TestCaseExtras,
    order: Vec<String>,
    closures: ClosureTable,
}

impl TestCase {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: TestCaseId,
        kind: TestKind,
        modules: BTreeMap<String, Arc<TestModule>>,
        free_args: CompilerArgs,
        origin: String,
        package: PackageName,
        extras: TestCaseExtras,
        order: Vec<String>,
        closures: ClosureTable,
    ) -> Self {
        Self {
            id,
            kind,
            modules,
            free_args,
            origin,
            package,
            extras,
            order,
            closures,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TestKind {
        self.kind
    }

    pub fn modules(&self) -> &BTreeMap<String, Arc<TestModule>> {
        &self.modules
    }

    pub fn module(&self, name: &str) -> Option<&Arc<TestModule>> {
        self.modules.get(name)
    }

    pub fn free_args(&self) -> &CompilerArgs {
        &self.free_args
    }

    /// Where the test case came from (test data file, generator, ...)
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn package(&self) -> &PackageName {
        &self.package
    }

    pub fn extras(&self) -> &TestCaseExtras {
        &self.extras
    }

    /// Module names in topological order, root first
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// The module no other module of this test case depends on
    pub fn root_module(&self) -> &Arc<TestModule> {
        // The graph builder never produces an empty order.
        &self.modules[&self.order[0]]
    }

    /// Transitive closure of a module over the given edge kind
    pub fn transitive(&self, module: &str, kind: EdgeKind) -> Result<ModuleSet, GraphError> {
        self.closures.closure(&self.modules, module, kind)
    }

    /// Every file of every exclusive module, in topological order
    pub fn files(&self) -> Vec<&Arc<TestFile>> {
        self.order
            .iter()
            .filter_map(|name| self.modules.get(name))
            .flat_map(|module| module.files())
            .collect()
    }
}
