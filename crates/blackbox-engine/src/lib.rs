//! Blackbox Engine - test compilation orchestration
//!
//! This crate turns test cases made of interdependent modules into compiled
//! libraries and executables, compiling every distinct module exactly once
//! per session, then runs the executables and verifies their output.

pub mod artifact;
pub mod cache;
pub mod closure;
pub mod compiler;
pub mod diagnostics;
pub mod environment;
pub mod execution;
pub mod graph;
pub mod manifest;
pub mod model;
pub mod naming;
pub mod protocol;
pub mod reporter;
pub mod session;
pub mod sort;

pub use artifact::{Artifact, ArtifactKind};
pub use cache::{CacheStats, Compilation, CompilationCacheKey, CompilationFactory, CompilationOutput, FactoryError};
pub use closure::{ClosureTable, EdgeKind, ModuleSet};
pub use compiler::{
    CompilationFailure, CompilerBackend, CompilerInvocation, CompilerInvoker, CompilerTranscript, FailureReason,
    ProcessCompiler, ProduceKind,
};
pub use diagnostics::{Diagnostic, DiagnosticCollector, Severity};
pub use environment::Environment;
pub use execution::{ExecutionFailure, ExecutionSuccess, RunParameters, RunTranscript, VerificationError};
pub use graph::{
    GraphError, ModuleDraft, NoSharedModules, SharedModuleRegistry, SharedModuleResolver, TestCaseBuilder,
};
pub use manifest::{LoadedManifest, Manifest, ManifestError, ManifestFormat};
pub use model::{
    CompilerArgs, ExclusiveModule, ModuleKey, ModuleRef, PackageName, SharedModule, TestCase, TestCaseExtras,
    TestCaseId, TestFile, TestKind, TestModule,
};
pub use naming::ArtifactLayout;
pub use protocol::{FailedTest, TestRunReport};
pub use reporter::{CollectingReporter, ReporterRegistry, SessionEvent, SessionReporter, TracingReporter};
pub use session::{
    ExecutionGroup, OutcomeRecord, SessionOptions, SessionSummary, TestCaseOutcome, TestCaseStatus, TestSession,
};
pub use sort::sort_topologically;
