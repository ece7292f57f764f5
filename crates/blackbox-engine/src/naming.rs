//! Deterministic artifact naming
//!
//! Every artifact path is a pure function of the inputs that produced it,
//! so equal inputs land on the same file and concurrent sessions never
//! race on a shared name.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::artifact::{Artifact, ArtifactKind};
use crate::model::{CompilerArgs, PackageName, TestCase, TestModule};

/// Directory holding shared-module libraries and sources
pub const SHARED_DIR: &str = "shared";
/// Directory holding executables built for several test cases
pub const GROUPED_DIR: &str = "grouped";
/// Directory holding committed test sources
pub const SOURCES_DIR: &str = "sources";

/// Make a package or identifier safe for use in a file name.
///
/// Empty input becomes `default`; anything outside `[A-Za-z0-9_]` becomes `_`.
pub fn normalize(name: &str) -> String {
    if name.is_empty() {
        return "default".to_string();
    }
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Directory name for a test case id.
///
/// Ids that do not survive [`normalize`] unchanged get a short hash of the
/// raw id appended. Normalized names never contain `-`, so distinct ids
/// always map to distinct directories.
pub fn test_case_dir_name(id: &str) -> String {
    let normalized = normalize(id);
    if normalized == id {
        normalized
    } else {
        format!("{normalized}-{}", short_hash([id.as_bytes()]))
    }
}

/// Longest dotted prefix shared by every package, `None` when there is none
pub fn common_package_prefix<'a, I>(packages: I) -> Option<PackageName>
where
    I: IntoIterator<Item = &'a PackageName>,
{
    let mut iter = packages.into_iter();
    let first = iter.next()?;
    let mut common: Vec<&str> = first.segments();

    for package in iter {
        let segments = package.segments();
        let shared = common
            .iter()
            .zip(segments.iter())
            .take_while(|(a, b)| a == b)
            .count();
        common.truncate(shared);
        if common.is_empty() {
            return None;
        }
    }

    if common.is_empty() {
        None
    } else {
        Some(PackageName::new(common.join(".")))
    }
}

/// First 16 hex characters of a SHA-256 over the sorted file identities
pub fn files_hash<I, S>(identities: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut sorted: Vec<String> = identities
        .into_iter()
        .map(|s| s.as_ref().to_string())
        .collect();
    sorted.sort();

    let mut hasher = Sha256::new();
    for identity in &sorted {
        hasher.update(identity.as_bytes());
        hasher.update(b"\n");
    }
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

/// Name of an executable built for several test cases
pub fn aggregate_name(test_cases: &[&TestCase]) -> String {
    let identities: Vec<String> = test_cases
        .iter()
        .flat_map(|tc| tc.files())
        .map(|f| f.identity())
        .collect();
    let prefix = common_package_prefix(test_cases.iter().map(|tc| tc.package()))
        .map(|p| format!("{}-", normalize(p.as_str())))
        .unwrap_or_default();

    format!("{:05}-{}{}", identities.len(), prefix, files_hash(&identities))
}

fn short_hash<'a, I>(parts: I) -> String
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())[..8].to_string()
}

fn args_hash(args: &CompilerArgs) -> String {
    short_hash(args.as_slice().iter().map(|arg| arg.as_bytes()))
}

/// Maps modules and test cases to artifact paths under one output directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLayout {
    output_dir: PathBuf,
    library_extension: String,
    executable_extension: String,
}

impl ArtifactLayout {
    pub fn new(
        output_dir: impl Into<PathBuf>,
        library_extension: impl Into<String>,
        executable_extension: impl Into<String>,
    ) -> Self {
        Self {
            output_dir: output_dir.into(),
            library_extension: library_extension.into(),
            executable_extension: executable_extension.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Directory of everything produced for one test case
    pub fn test_case_dir(&self, test_case: &str) -> PathBuf {
        self.output_dir.join(test_case_dir_name(test_case))
    }

    /// Library built from a single module.
    ///
    /// Shared libraries are keyed by their free args too, since one shared
    /// module may be compiled under several argument sets in a session.
    pub fn library(&self, module: &TestModule, free_args: &CompilerArgs) -> Artifact {
        let path = match module {
            TestModule::Exclusive(m) => {
                let stem = format!("{}-{}", normalize(m.package().as_str()), module.name());
                self.test_case_dir(m.test_case())
                    .join(with_extension(&stem, &self.library_extension))
            }
            TestModule::Shared(_) => {
                let stem = if free_args.is_empty() {
                    module.name().to_string()
                } else {
                    format!("{}-{}", module.name(), args_hash(free_args))
                };
                self.output_dir
                    .join(SHARED_DIR)
                    .join(with_extension(&stem, &self.library_extension))
            }
        };
        Artifact::new(ArtifactKind::Library, path)
    }

    /// Executable for one or more test cases
    pub fn executable(&self, test_cases: &[&TestCase]) -> Artifact {
        let path = match test_cases {
            [single] => {
                let stem = normalize(single.package().as_str());
                self.test_case_dir(single.id())
                    .join(with_extension(&stem, &self.executable_extension))
            }
            many => {
                let name = aggregate_name(many);
                self.output_dir
                    .join(GROUPED_DIR)
                    .join(&name)
                    .join(with_extension(&name, &self.executable_extension))
            }
        };
        Artifact::new(ArtifactKind::Executable, path)
    }

    /// Location of a committed source file of an exclusive module
    pub fn source_path(&self, test_case: &str, module: &str, file_name: &str) -> PathBuf {
        self.output_dir
            .join(SOURCES_DIR)
            .join(test_case_dir_name(test_case))
            .join(module)
            .join(file_name)
    }

    /// Location of a committed source file of a shared module
    pub fn shared_source_path(&self, module: &str, file_name: &str) -> PathBuf {
        self.output_dir
            .join(SOURCES_DIR)
            .join(SHARED_DIR)
            .join(module)
            .join(file_name)
    }
}

fn with_extension(stem: &str, extension: &str) -> String {
    if extension.is_empty() {
        stem.to_string()
    } else {
        format!("{stem}.{extension}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ModuleDraft, NoSharedModules, TestCaseBuilder};
    use crate::model::{SharedModule, TestFile};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn case(dir: &Path, id: &str, package: &str, text: &str) -> TestCase {
        let file = Arc::new(TestFile::new(dir.join(id).join("main.kt"), "main", text));
        TestCaseBuilder::new(id)
            .with_package(PackageName::new(package))
            .with_module(ModuleDraft::new("main").with_file(file))
            .build(&NoSharedModules)
            .unwrap()
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(""), "default");
        assert_eq!(normalize("codegen.box"), "codegen_box");
        assert_eq!(normalize("a-b/c"), "a_b_c");
        assert_eq!(normalize("Plain_1"), "Plain_1");
    }

    #[test]
    fn test_common_prefix() {
        let a = PackageName::new("codegen.box.strings");
        let b = PackageName::new("codegen.box.arrays");
        let c = PackageName::new("other");
        assert_eq!(
            common_package_prefix([&a, &b]),
            Some(PackageName::new("codegen.box"))
        );
        assert_eq!(common_package_prefix([&a, &b, &c]), None);
        assert_eq!(common_package_prefix([&a]), Some(a.clone()));
        assert_eq!(common_package_prefix(std::iter::empty()), None);
    }

    #[test]
    fn test_files_hash_is_order_independent() {
        let h1 = files_hash(["b#2", "a#1"]);
        let h2 = files_hash(["a#1", "b#2"]);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 16);
        assert_ne!(h1, files_hash(["a#1", "b#3"]));
    }

    #[test]
    fn test_aggregate_name_tracks_content() {
        let temp = TempDir::new().unwrap();
        let layout = ArtifactLayout::new(temp.path(), "klib", "kexe");

        let a = case(temp.path(), "a", "codegen.box.one", "fun a() {}");
        let b = case(temp.path(), "b", "codegen.box.two", "fun b() {}");
        let exe = layout.executable(&[&a, &b]);
        let again = layout.executable(&[&a, &b]);
        assert_eq!(exe.path(), again.path());

        let name = exe.path().file_stem().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("00002-codegen_box-"), "{name}");
        assert!(exe.path().starts_with(temp.path().join(GROUPED_DIR)));

        let a2 = case(temp.path(), "a", "codegen.box.one", "fun a() {}");
        let b2 = case(temp.path(), "b", "codegen.box.two", "fun b() { }");
        let changed = layout.executable(&[&a2, &b2]);
        assert_ne!(exe.path(), changed.path());
    }

    #[test]
    fn test_single_case_paths() {
        let temp = TempDir::new().unwrap();
        let layout = ArtifactLayout::new("/out", "klib", "kexe");
        let tc = case(temp.path(), "box_simple", "codegen.box", "fun box() = \"OK\"");

        let exe = layout.executable(&[&tc]);
        assert_eq!(exe.path(), Path::new("/out/box_simple/codegen_box.kexe"));

        let lib = layout.library(tc.root_module(), tc.free_args());
        assert_eq!(lib.path(), Path::new("/out/box_simple/codegen_box-main.klib"));
    }

    #[test]
    fn test_case_dir_names_are_distinct() {
        assert_eq!(test_case_dir_name("box_simple"), "box_simple");

        let slashed = test_case_dir_name("x/y");
        let dotted = test_case_dir_name("x.y");
        assert!(slashed.starts_with("x_y-"), "{slashed}");
        assert_ne!(slashed, "x_y");
        assert_ne!(slashed, dotted);
        assert_ne!(test_case_dir_name(""), "default");
        assert_eq!(test_case_dir_name("x/y"), slashed);
    }

    #[test]
    fn test_colliding_ids_get_separate_paths() {
        let temp = TempDir::new().unwrap();
        let layout = ArtifactLayout::new(temp.path(), "klib", "kexe");
        let a = case(temp.path(), "x/y", "p", "FIRST");
        let b = case(temp.path(), "x_y", "p", "SECOND");

        assert_ne!(
            layout.source_path(a.id(), "main", "main.kt"),
            layout.source_path(b.id(), "main", "main.kt")
        );
        assert_ne!(
            layout.library(a.root_module(), a.free_args()).path(),
            layout.library(b.root_module(), b.free_args()).path()
        );
        assert_ne!(layout.executable(&[&a]).path(), layout.executable(&[&b]).path());
    }

    #[test]
    fn test_shared_library_paths() {
        let layout = ArtifactLayout::new("/out", "klib", "");
        let shared = TestModule::Shared(SharedModule::new("support", Vec::new()));

        let plain = layout.library(&shared, &CompilerArgs::default());
        assert_eq!(plain.path(), Path::new("/out/shared/support.klib"));

        let args = CompilerArgs::new(vec!["-opt".to_string()]);
        let tuned = layout.library(&shared, &args);
        assert_ne!(plain.path(), tuned.path());
        assert!(tuned.path().starts_with("/out/shared"));
    }

    #[test]
    fn test_source_paths() {
        let layout = ArtifactLayout::new("/out", "klib", "kexe");
        assert_eq!(
            layout.source_path("box_simple", "main", "main.kt"),
            Path::new("/out/sources/box_simple/main/main.kt")
        );
        assert_eq!(
            layout.shared_source_path("support", "util.kt"),
            Path::new("/out/sources/shared/support/util.kt")
        );
    }
}
