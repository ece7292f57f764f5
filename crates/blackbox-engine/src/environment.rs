//! Session environment: target, compiler and output layout

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use blackbox_core::{CompilationMode, Config, ConfigError};
use tracing::debug;

use crate::compiler::{CompilerBackend, ProcessCompiler};
use crate::naming::ArtifactLayout;

/// Everything a session needs to know about the toolchain it drives
#[derive(Clone)]
pub struct Environment {
    target: String,
    home_dir: Option<PathBuf>,
    mode: CompilationMode,
    fixed_flags: Vec<String>,
    layout: ArtifactLayout,
    compiler: Arc<dyn CompilerBackend>,
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("target", &self.target)
            .field("home_dir", &self.home_dir)
            .field("mode", &self.mode)
            .field("fixed_flags", &self.fixed_flags)
            .field("layout", &self.layout)
            .field("compiler", &self.compiler.name())
            .finish()
    }
}

impl Environment {
    pub fn new(
        target: impl Into<String>,
        layout: ArtifactLayout,
        compiler: Arc<dyn CompilerBackend>,
    ) -> Self {
        Self {
            target: target.into(),
            home_dir: None,
            mode: CompilationMode::default(),
            fixed_flags: Vec::new(),
            layout,
            compiler,
        }
    }

    /// Build from loaded configuration, locating the compiler binary
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let compiler =
            ProcessCompiler::locate(&config.compiler.program, config.session.home_dir.as_deref())?;
        debug!(program = %compiler.program().display(), "compiler located");
        Ok(Self::from_config_with_backend(config, Arc::new(compiler)))
    }

    /// Build from configuration with an explicit compiler backend
    pub fn from_config_with_backend(config: &Config, compiler: Arc<dyn CompilerBackend>) -> Self {
        let layout = ArtifactLayout::new(
            &config.session.output_dir,
            &config.compiler.library_extension,
            &config.compiler.executable_extension,
        );
        let mut env = Self::new(&config.session.target, layout, compiler)
            .with_mode(config.compiler.mode)
            .with_fixed_flags(config.compiler.fixed_flags.clone());
        env.home_dir = config.session.home_dir.clone();
        env
    }

    pub fn with_home_dir(mut self, home_dir: impl Into<PathBuf>) -> Self {
        self.home_dir = Some(home_dir.into());
        self
    }

    pub fn with_mode(mut self, mode: CompilationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_fixed_flags(mut self, flags: Vec<String>) -> Self {
        self.fixed_flags = flags;
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn home_dir(&self) -> Option<&Path> {
        self.home_dir.as_deref()
    }

    pub fn mode(&self) -> CompilationMode {
        self.mode
    }

    pub fn fixed_flags(&self) -> &[String] {
        &self.fixed_flags
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    pub fn output_dir(&self) -> &Path {
        self.layout.output_dir()
    }

    pub fn compiler(&self) -> &Arc<dyn CompilerBackend> {
        &self.compiler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::DiagnosticCollector;
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl CompilerBackend for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        async fn execute(&self, _: &[String], _: &DiagnosticCollector) -> std::io::Result<i32> {
            Ok(0)
        }
    }

    #[test]
    fn test_from_config_with_backend() {
        let mut config = Config::default();
        config.session.target = "macos_arm64".to_string();
        config.session.output_dir = PathBuf::from("/tmp/bb-out");
        config.compiler.mode = CompilationMode::TwoStage;

        let env = Environment::from_config_with_backend(&config, Arc::new(Noop));
        assert_eq!(env.target(), "macos_arm64");
        assert_eq!(env.output_dir(), Path::new("/tmp/bb-out"));
        assert_eq!(env.mode(), CompilationMode::TwoStage);
        assert_eq!(env.fixed_flags(), config.compiler.fixed_flags.as_slice());
        assert_eq!(env.compiler().name(), "noop");
    }

    #[test]
    fn test_from_config_missing_compiler() {
        let mut config = Config::default();
        config.compiler.program = "no-such-compiler-for-blackbox".to_string();
        assert!(Environment::from_config(&config).is_err());
    }
}
