//! Module graph construction
//!
//! Turns module drafts with symbolic dependency/friend names into a bound,
//! validated and topologically ordered [`TestCase`]. Source files are only
//! committed to disk once the whole graph is known to be valid.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use tracing::{debug, info, instrument};

use crate::closure::ClosureTable;
use crate::model::{
    CompilerArgs, ExclusiveModule, ModuleRef, PackageName, SharedModule, TestCase, TestCaseExtras,
    TestCaseId, TestFile, TestKind, TestModule,
};
use crate::sort::sort_topologically;

/// Errors raised while building a module graph
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// A test case without modules
    #[error("Test case '{0}' has no modules")]
    EmptyTestCase(TestCaseId),

    /// Two modules share a name
    #[error("Duplicate module '{module}' in test case '{test_case}'")]
    DuplicateModule { test_case: TestCaseId, module: String },

    /// The same file is owned by two modules
    #[error("File {} is owned by both '{first}' and '{second}'", path.display())]
    DuplicateFile {
        path: PathBuf,
        first: String,
        second: String,
    },

    /// A file was created for a different module than the one listing it
    #[error("File {} belongs to module '{owner}' but is listed by '{module}'", path.display())]
    FileOwnerMismatch {
        path: PathBuf,
        owner: String,
        module: String,
    },

    /// A symbolic name matched neither a local nor a shared module
    #[error("Unresolved {kind} '{name}' of module '{module}' in test case '{test_case}'")]
    UnresolvedReference {
        test_case: TestCaseId,
        module: String,
        kind: String,
        name: String,
    },

    /// A module is reachable from itself
    #[error("Dependency cycle in test case '{test_case}': {}", cycle.join(" -> "))]
    DependencyCycle {
        test_case: TestCaseId,
        cycle: Vec<String>,
    },

    /// Modules not reachable from the root module
    #[error("Modules not reachable from root '{root}' in test case '{test_case}': {}", orphans.join(", "))]
    OrphanedModules {
        test_case: TestCaseId,
        root: String,
        orphans: Vec<String>,
    },

    /// Patching a file that was already written to disk
    #[error("File {} is already committed", .0.display())]
    AlreadyCommitted(PathBuf),

    /// Writing a file to disk failed
    #[error("Failed to commit {}: {message}", path.display())]
    Commit { path: PathBuf, message: String },

    /// Direct edges of a module were assigned twice
    #[error("Dependencies of module '{0}' are already bound")]
    AlreadyBound(String),
}

/// Looks up shared modules by symbolic name
pub trait SharedModuleResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Arc<TestModule>>;
}

/// Resolver for test cases that never reference shared modules
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSharedModules;

impl SharedModuleResolver for NoSharedModules {
    fn resolve(&self, _name: &str) -> Option<Arc<TestModule>> {
        None
    }
}

/// In-memory registry of shared modules
#[derive(Debug, Default)]
pub struct SharedModuleRegistry {
    modules: RwLock<BTreeMap<String, Arc<TestModule>>>,
}

impl SharedModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a shared module; names must be unique
    pub fn register(&self, module: SharedModule) -> Result<Arc<TestModule>, GraphError> {
        let module = Arc::new(TestModule::Shared(module));
        let mut modules = self.modules.write().unwrap_or_else(|e| e.into_inner());
        if modules.contains_key(module.name()) {
            return Err(GraphError::DuplicateModule {
                test_case: "<shared>".to_string(),
                module: module.name().to_string(),
            });
        }
        debug!(module = module.name(), "registered shared module");
        modules.insert(module.name().to_string(), module.clone());
        Ok(module)
    }

    pub fn get(&self, name: &str) -> Option<Arc<TestModule>> {
        self.modules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.modules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.modules.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SharedModuleResolver for SharedModuleRegistry {
    fn resolve(&self, name: &str) -> Option<Arc<TestModule>> {
        self.get(name)
    }
}

/// An exclusive module before name resolution
#[derive(Debug, Clone)]
pub struct ModuleDraft {
    pub name: String,
    pub files: Vec<Arc<TestFile>>,
    pub dependencies: BTreeSet<String>,
    pub friends: BTreeSet<String>,
}

impl ModuleDraft {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            files: Vec::new(),
            dependencies: BTreeSet::new(),
            friends: BTreeSet::new(),
        }
    }

    pub fn with_file(mut self, file: Arc<TestFile>) -> Self {
        self.files.push(file);
        self
    }

    pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
        self.dependencies.insert(name.into());
        self
    }

    pub fn with_friend(mut self, name: impl Into<String>) -> Self {
        self.friends.insert(name.into());
        self
    }
}

/// Builder for a [`TestCase`]
#[derive(Debug, Clone)]
pub struct TestCaseBuilder {
    id: TestCaseId,
    kind: TestKind,
    package: PackageName,
    origin: String,
    free_args: CompilerArgs,
    extras: TestCaseExtras,
    modules: Vec<ModuleDraft>,
}

impl TestCaseBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            origin: id.clone(),
            id,
            kind: TestKind::default(),
            package: PackageName::default(),
            free_args: CompilerArgs::default(),
            extras: TestCaseExtras::default(),
            modules: Vec::new(),
        }
    }

    pub fn with_kind(mut self, kind: TestKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_package(mut self, package: PackageName) -> Self {
        self.package = package;
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    pub fn with_free_args(mut self, args: CompilerArgs) -> Self {
        self.free_args = args;
        self
    }

    pub fn with_extras(mut self, extras: TestCaseExtras) -> Self {
        self.extras = extras;
        self
    }

    pub fn with_module(mut self, module: ModuleDraft) -> Self {
        self.modules.push(module);
        self
    }

    /// Validate, resolve, order and commit the test case.
    #[instrument(skip_all, fields(test_case = %self.id, modules = self.modules.len()))]
    pub fn build(self, resolver: &dyn SharedModuleResolver) -> Result<TestCase, GraphError> {
        if self.modules.is_empty() {
            return Err(GraphError::EmptyTestCase(self.id));
        }

        self.check_uniqueness()?;

        let mut modules: BTreeMap<String, Arc<TestModule>> = BTreeMap::new();
        for draft in &self.modules {
            let module = ExclusiveModule::new(
                draft.name.clone(),
                draft.files.clone(),
                self.id.clone(),
                self.package.clone(),
                draft.dependencies.clone(),
                draft.friends.clone(),
            );
            modules.insert(draft.name.clone(), Arc::new(TestModule::Exclusive(module)));
        }

        let mut referenced_shared: Vec<Arc<TestModule>> = Vec::new();
        for draft in &self.modules {
            let dependencies = self.resolve_names(
                &draft.name,
                &draft.dependencies,
                "dependency",
                &modules,
                resolver,
                &mut referenced_shared,
            )?;
            let friends = self.resolve_names(
                &draft.name,
                &draft.friends,
                "friend",
                &modules,
                resolver,
                &mut referenced_shared,
            )?;
            if let Some(module) = modules.get(&draft.name).and_then(|m| m.as_exclusive()) {
                module.bind(dependencies, friends)?;
            }
        }

        let closures = ClosureTable::new(self.id.clone());
        let order = sort_topologically(&self.id, &modules, &closures)?;

        let mut written = 0usize;
        for module in modules.values().chain(referenced_shared.iter()) {
            for file in module.files() {
                if file.commit()? {
                    written += 1;
                }
            }
        }

        info!(
            test_case = %self.id,
            root = %order[0],
            modules = modules.len(),
            files_written = written,
            "test case graph built"
        );

        Ok(TestCase::new(
            self.id,
            self.kind,
            modules,
            self.free_args,
            self.origin,
            self.package,
            self.extras,
            order,
            closures,
        ))
    }

    fn check_uniqueness(&self) -> Result<(), GraphError> {
        let mut names: HashSet<&str> = HashSet::new();
        let mut owners: HashMap<&std::path::Path, &str> = HashMap::new();

        for draft in &self.modules {
            if !names.insert(draft.name.as_str()) {
                return Err(GraphError::DuplicateModule {
                    test_case: self.id.clone(),
                    module: draft.name.clone(),
                });
            }

            for file in &draft.files {
                if file.module() != draft.name {
                    return Err(GraphError::FileOwnerMismatch {
                        path: file.location().to_path_buf(),
                        owner: file.module().to_string(),
                        module: draft.name.clone(),
                    });
                }
                if let Some(first) = owners.insert(file.location(), draft.name.as_str()) {
                    return Err(GraphError::DuplicateFile {
                        path: file.location().to_path_buf(),
                        first: first.to_string(),
                        second: draft.name.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    fn resolve_names(
        &self,
        module: &str,
        names: &BTreeSet<String>,
        kind: &str,
        local: &BTreeMap<String, Arc<TestModule>>,
        resolver: &dyn SharedModuleResolver,
        referenced_shared: &mut Vec<Arc<TestModule>>,
    ) -> Result<Vec<ModuleRef>, GraphError> {
        let mut resolved = Vec::with_capacity(names.len());
        for name in names {
            if local.contains_key(name) {
                resolved.push(ModuleRef::Local(name.clone()));
                continue;
            }

            match resolver.resolve(name) {
                Some(shared) if shared.is_shared() => {
                    if !referenced_shared.iter().any(|m| Arc::ptr_eq(m, &shared)) {
                        referenced_shared.push(shared.clone());
                    }
                    resolved.push(ModuleRef::Shared(shared));
                }
                _ => {
                    return Err(GraphError::UnresolvedReference {
                        test_case: self.id.clone(),
                        module: module.to_string(),
                        kind: kind.to_string(),
                        name: name.clone(),
                    })
                }
            }
        }
        Ok(resolved)
    }
}
