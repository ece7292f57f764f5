//! CLI commands

mod init;
mod plan;
mod run;

pub use init::InitCommand;
pub use plan::PlanCommand;
pub use run::RunCommand;

use std::path::{Path, PathBuf};

use blackbox_core::config::{load_config, load_config_or_default, validate_config};
use blackbox_core::{CompilationMode, Config};
use blackbox_engine::{LoadedManifest, Manifest};
use clap::{Args, ValueEnum};
use tracing::{debug, info};

use crate::cli::Cli;

/// Compilation mode argument
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ModeArg {
    OneStage,
    TwoStage,
}

impl From<ModeArg> for CompilationMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::OneStage => Self::OneStage,
            ModeArg::TwoStage => Self::TwoStage,
        }
    }
}

/// Session settings that override the configuration file
#[derive(Debug, Clone, Default, Args)]
pub struct SessionArgs {
    /// Target platform identifier
    #[arg(long)]
    pub target: Option<String>,

    /// Base directory for sources, artifacts and dumps
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Number of executables compiled or run at once
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// How executables are produced
    #[arg(long)]
    pub mode: Option<ModeArg>,

    /// Compiler program (path or name on PATH)
    #[arg(long, env = "BLACKBOX_COMPILER")]
    pub compiler: Option<String>,

    /// Compiler home directory
    #[arg(long, env = "BLACKBOX_HOME")]
    pub home: Option<PathBuf>,

    /// Deadline for each executable run, in seconds
    #[arg(long)]
    pub timeout: Option<u64>,
}

impl SessionArgs {
    /// Apply every flag that was given on top of `config`
    pub fn apply(&self, config: &mut Config) {
        if let Some(target) = &self.target {
            config.session.target = target.clone();
        }
        if let Some(output_dir) = &self.output_dir {
            config.session.output_dir = output_dir.clone();
        }
        if let Some(jobs) = self.jobs {
            config.session.concurrency = Some(jobs);
        }
        if let Some(mode) = self.mode {
            config.compiler.mode = mode.into();
        }
        if let Some(compiler) = &self.compiler {
            config.compiler.program = compiler.clone();
        }
        if let Some(home) = &self.home {
            config.session.home_dir = Some(home.clone());
        }
        if let Some(timeout) = self.timeout {
            config.session.run_timeout_secs = Some(timeout);
        }
    }
}

/// Load the configuration for a command, with CLI overrides applied
pub fn resolve_config(cli: &Cli, overrides: &SessionArgs) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => {
            let cwd = std::env::current_dir()?;
            let (config, path) = load_config_or_default(&cwd);
            match path {
                Some(path) => debug!(path = %path.display(), "using config file"),
                None => debug!("using default configuration"),
            }
            config
        }
    };

    overrides.apply(&mut config);
    validate_config(&config)?;
    info!(
        target = %config.session.target,
        output_dir = %config.session.output_dir.display(),
        mode = config.compiler.mode.as_str(),
        "configuration resolved"
    );
    Ok(config)
}

/// Read a manifest and build its test cases under the configured output directory
pub fn load_manifest(path: &Path, config: &Config) -> anyhow::Result<LoadedManifest> {
    let layout = blackbox_engine::ArtifactLayout::new(
        &config.session.output_dir,
        &config.compiler.library_extension,
        &config.compiler.executable_extension,
    );
    let manifest = Manifest::load(path)?;
    Ok(manifest.build(&layout)?)
}
