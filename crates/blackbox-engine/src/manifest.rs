//! Serialized test plans
//!
//! A manifest is the output of the external discovery and patching
//! pipeline: shared modules plus test cases with inline source text. Loading
//! one places every file under the output directory and builds the module
//! graphs.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::graph::{GraphError, ModuleDraft, SharedModuleRegistry, TestCaseBuilder};
use crate::model::{CompilerArgs, PackageName, SharedModule, TestCase, TestCaseExtras, TestFile, TestKind};
use crate::naming::ArtifactLayout;

/// Manifest loading errors
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("Failed to read manifest {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unsupported manifest format: {} (expected .toml, .yaml, .yml or .json)", .0.display())]
    UnsupportedFormat(PathBuf),

    #[error("Invalid {format} manifest: {message}")]
    Parse { format: &'static str, message: String },

    #[error("Invalid module name '{0}'")]
    InvalidModuleName(String),

    #[error("Module '{module}' has an invalid file name '{name}'")]
    InvalidFileName { module: String, name: String },

    #[error("Test case '{0}' is declared more than once")]
    DuplicateTestCase(String),

    #[error("Test case '{test_case}': {source}")]
    Graph {
        test_case: String,
        #[source]
        source: GraphError,
    },

    #[error("Shared module: {0}")]
    Shared(#[source] GraphError),
}

/// Serialization format of a manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFormat {
    Toml,
    Yaml,
    Json,
}

impl ManifestFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "toml" => Some(Self::Toml),
            "yaml" | "yml" => Some(Self::Yaml),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Toml => "TOML",
            Self::Yaml => "YAML",
            Self::Json => "JSON",
        }
    }
}

/// A source file with inline text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpec {
    /// Path relative to the module's source directory
    pub name: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleSpec {
    pub name: String,
    pub dependencies: Vec<String>,
    pub friends: Vec<String>,
    pub files: Vec<FileSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCaseSpec {
    pub id: String,
    #[serde(default)]
    pub kind: TestKind,
    #[serde(default)]
    pub package: String,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub free_args: Vec<String>,
    #[serde(default)]
    pub entry_point: Option<String>,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub expected_output: Option<String>,
    #[serde(default)]
    pub modules: Vec<ModuleSpec>,
}

/// Top-level manifest document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Manifest {
    pub shared_modules: Vec<ModuleSpec>,
    pub test_cases: Vec<TestCaseSpec>,
}

/// Test cases ready for a session
#[derive(Debug)]
pub struct LoadedManifest {
    pub shared_modules: Arc<SharedModuleRegistry>,
    pub test_cases: Vec<Arc<TestCase>>,
}

impl Manifest {
    /// Read a manifest, picking the format from the file extension
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let format =
            ManifestFormat::from_path(path).ok_or_else(|| ManifestError::UnsupportedFormat(path.to_path_buf()))?;
        info!(path = %path.display(), format = format.as_str(), "loading manifest");

        let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, format)
    }

    pub fn parse(content: &str, format: ManifestFormat) -> Result<Self, ManifestError> {
        let parse_error = |message: String| ManifestError::Parse {
            format: format.as_str(),
            message,
        };
        match format {
            ManifestFormat::Toml => toml::from_str(content).map_err(|e| parse_error(e.to_string())),
            ManifestFormat::Yaml => serde_yaml::from_str(content).map_err(|e| parse_error(e.to_string())),
            ManifestFormat::Json => serde_json::from_str(content).map_err(|e| parse_error(e.to_string())),
        }
    }

    /// Build shared modules and test cases, writing sources under `layout`
    pub fn build(&self, layout: &ArtifactLayout) -> Result<LoadedManifest, ManifestError> {
        let registry = Arc::new(SharedModuleRegistry::new());
        for spec in &self.shared_modules {
            check_module_name(&spec.name)?;
            let files = spec
                .files
                .iter()
                .map(|file| {
                    check_file_name(&spec.name, &file.name)?;
                    Ok(Arc::new(TestFile::new(
                        layout.shared_source_path(&spec.name, &file.name),
                        spec.name.clone(),
                        file.text.clone(),
                    )))
                })
                .collect::<Result<Vec<_>, ManifestError>>()?;
            registry
                .register(SharedModule::new(spec.name.clone(), files))
                .map_err(ManifestError::Shared)?;
        }

        let mut ids = HashSet::new();
        let mut test_cases = Vec::with_capacity(self.test_cases.len());
        for spec in &self.test_cases {
            if !ids.insert(spec.id.as_str()) {
                return Err(ManifestError::DuplicateTestCase(spec.id.clone()));
            }
            let test_case = spec.to_builder(layout)?.build(registry.as_ref()).map_err(|source| {
                ManifestError::Graph {
                    test_case: spec.id.clone(),
                    source,
                }
            })?;
            test_cases.push(Arc::new(test_case));
        }

        info!(
            shared_modules = registry.len(),
            test_cases = test_cases.len(),
            "manifest built"
        );
        Ok(LoadedManifest {
            shared_modules: registry,
            test_cases,
        })
    }
}

impl TestCaseSpec {
    fn to_builder(&self, layout: &ArtifactLayout) -> Result<TestCaseBuilder, ManifestError> {
        let mut builder = TestCaseBuilder::new(self.id.clone())
            .with_kind(self.kind)
            .with_package(PackageName::new(self.package.clone()))
            .with_origin(self.origin.clone().unwrap_or_else(|| self.id.clone()))
            .with_free_args(CompilerArgs::new(self.free_args.clone()))
            .with_extras(TestCaseExtras {
                entry_point: self.entry_point.clone(),
                input_data: self.input.clone(),
                expected_output: self.expected_output.clone(),
            });

        for module in &self.modules {
            check_module_name(&module.name)?;
            let mut draft = ModuleDraft::new(module.name.clone());
            for file in &module.files {
                check_file_name(&module.name, &file.name)?;
                let location = layout.source_path(&self.id, &module.name, &file.name);
                draft = draft.with_file(Arc::new(TestFile::new(location, module.name.clone(), file.text.clone())));
            }
            for dependency in &module.dependencies {
                draft = draft.with_dependency(dependency.clone());
            }
            for friend in &module.friends {
                draft = draft.with_friend(friend.clone());
            }
            builder = builder.with_module(draft);
        }
        debug!(test_case = %self.id, modules = self.modules.len(), "test case parsed");
        Ok(builder)
    }
}

/// Module names become a single directory and file name component
fn check_module_name(name: &str) -> Result<(), ManifestError> {
    let mut components = Path::new(name).components();
    let single = matches!(components.next(), Some(Component::Normal(_))) && components.next().is_none();
    if single && !name.contains(['/', '\\']) {
        Ok(())
    } else {
        Err(ManifestError::InvalidModuleName(name.to_string()))
    }
}

/// File names must stay inside the module's source directory
fn check_file_name(module: &str, name: &str) -> Result<(), ManifestError> {
    let path = Path::new(name);
    let valid = !name.is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)));
    if valid {
        Ok(())
    } else {
        Err(ManifestError::InvalidFileName {
            module: module.to_string(),
            name: name.to_string(),
        })
    }
}
