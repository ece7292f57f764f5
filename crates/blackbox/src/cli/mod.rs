//! CLI definition and command handling

pub mod commands;
pub mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use commands::{InitCommand, PlanCommand, RunCommand};

/// Blackbox - compile and run black-box compiler tests
#[derive(Debug, Parser)]
#[command(name = "blackbox")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Working directory
    #[arg(short = 'C', long, global = true)]
    pub directory: Option<PathBuf>,

    /// Configuration file (searched upward from the working directory by default)
    #[arg(short, long, global = true, env = "BLACKBOX_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Output format for CLI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    #[default]
    Text,
    /// JSON output
    Json,
}

/// Available commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Write a default configuration file
    Init(InitCommand),

    /// Compile and run every test case of a manifest
    Run(RunCommand),

    /// Show module order and planned artifacts without compiling
    Plan(PlanCommand),
}

impl Cli {
    /// Execute the CLI command, returning the process exit code
    pub fn execute(&self) -> anyhow::Result<i32> {
        // Change to specified directory if provided
        if let Some(dir) = &self.directory {
            std::env::set_current_dir(dir)?;
        }

        match &self.command {
            Commands::Init(cmd) => cmd.execute(self),
            Commands::Run(cmd) => cmd.execute(self),
            Commands::Plan(cmd) => cmd.execute(self),
        }
    }

    /// Default console log level for the verbosity flags
    pub fn console_level(&self) -> &'static str {
        if self.quiet {
            "error"
        } else if self.verbose {
            "info"
        } else {
            "warn"
        }
    }

    /// Whether human-readable progress should be printed
    pub fn prints_text(&self) -> bool {
        self.format == OutputFormat::Text && !self.quiet
    }
}
