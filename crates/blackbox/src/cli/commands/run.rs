//! Run command - compile and run every test case of a manifest

use std::path::PathBuf;
use std::sync::Arc;

use blackbox_engine::{
    Environment, OutcomeRecord, ReporterRegistry, SessionEvent, SessionOptions, SessionReporter, SessionSummary,
    TestCaseOutcome, TestCaseStatus, TestSession,
};
use clap::Args;
use console::style;
use serde::Serialize;
use tracing::info;

use super::{load_manifest, resolve_config, SessionArgs};
use crate::cli::{output, Cli, OutputFormat};
use crate::exit_codes;

/// Compile and run every test case of a manifest
#[derive(Debug, Args)]
pub struct RunCommand {
    /// Test plan manifest (.toml, .yaml, .yml or .json)
    pub manifest: PathBuf,

    /// Only run test cases whose id contains this text
    #[arg(long)]
    pub filter: Option<String>,

    #[command(flatten)]
    pub session: SessionArgs,
}

/// JSON report of a whole run
#[derive(Debug, Serialize)]
struct RunReport {
    total: usize,
    passed: usize,
    failed: usize,
    compiler_invocations: usize,
    cache_hits: usize,
    duration_ms: u64,
    outcomes: Vec<OutcomeRecord>,
}

impl From<&SessionSummary> for RunReport {
    fn from(summary: &SessionSummary) -> Self {
        Self {
            total: summary.outcomes.len(),
            passed: summary.passed(),
            failed: summary.failed(),
            compiler_invocations: summary.stats.compiler_invocations,
            cache_hits: summary.stats.hits,
            duration_ms: summary.duration.as_millis() as u64,
            outcomes: summary.outcomes.iter().map(OutcomeRecord::from).collect(),
        }
    }
}

impl RunCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<i32> {
        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(self.execute_async(cli))
    }

    async fn execute_async(&self, cli: &Cli) -> anyhow::Result<i32> {
        let config = resolve_config(cli, &self.session)?;
        let env = Arc::new(Environment::from_config(&config)?);
        let loaded = load_manifest(&self.manifest, &config)?;

        let test_cases: Vec<_> = loaded
            .test_cases
            .into_iter()
            .filter(|tc| self.filter.as_deref().map_or(true, |f| tc.id().contains(f)))
            .collect();
        info!(test_cases = test_cases.len(), "running manifest {}", self.manifest.display());

        if cli.prints_text() {
            println!();
            println!("{}", output::header("Running test cases..."));
            println!("{}", output::key_value("Manifest", &self.manifest.display().to_string()));
            println!("{}", output::key_value("Target", env.target()));
            println!("{}", output::key_value("Mode", env.mode().as_str()));
            println!(
                "{}",
                output::key_value(
                    "Output",
                    &output::path_style().apply_to(env.output_dir().display()).to_string()
                )
            );
            println!("{}", output::key_value("Test cases", &test_cases.len().to_string()));
            println!();
        }

        if test_cases.is_empty() {
            if cli.prints_text() {
                output::warning("No test cases to run");
            }
            return Ok(exit_codes::SUCCESS);
        }

        let mut reporters = ReporterRegistry::new();
        if cli.verbose && cli.prints_text() {
            reporters.register(Arc::new(ProgressReporter));
        }
        let session =
            TestSession::new(env, SessionOptions::from_config(&config.session)).with_reporter(Arc::new(reporters));
        let summary = session.run(&test_cases).await;

        match cli.format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&RunReport::from(&summary))?);
            }
            OutputFormat::Text if !cli.quiet => print_summary(&summary, cli.verbose),
            OutputFormat::Text => {}
        }

        Ok(if summary.all_passed() {
            exit_codes::SUCCESS
        } else {
            exit_codes::TESTS_FAILED
        })
    }
}

/// Prints compiler and executable activity as it happens
struct ProgressReporter;

impl SessionReporter for ProgressReporter {
    fn report(&self, event: &SessionEvent) {
        match event {
            SessionEvent::CompilationStarted { artifact, kind } => {
                println!(
                    "  {} compiling {} {}",
                    style("→").blue(),
                    kind.as_str(),
                    output::path_style().apply_to(artifact.display())
                );
            }
            SessionEvent::CompilationSkipped { artifact, .. } => {
                println!(
                    "  {} skipped {}",
                    style("!").yellow(),
                    output::path_style().apply_to(artifact.display())
                );
            }
            SessionEvent::ExecutionStarted { test_cases, executable } => {
                println!(
                    "  {} running {} for {}",
                    style("→").blue(),
                    output::path_style().apply_to(executable.display()),
                    test_cases.join(", ")
                );
            }
            _ => {}
        }
    }
}

fn print_summary(summary: &SessionSummary, verbose: bool) {
    for outcome in &summary.outcomes {
        print_outcome(outcome, verbose);
    }

    println!();
    println!("{}", style("═".repeat(70)).dim());
    println!(
        "  {} {}, {} {} ({} compiler runs, {} cache hits, {}ms)",
        style(summary.passed()).green().bold(),
        style("passed").dim(),
        style(summary.failed()).red().bold(),
        style("failed").dim(),
        summary.stats.compiler_invocations,
        summary.stats.hits,
        summary.duration.as_millis()
    );

    if summary.all_passed() {
        println!();
        output::success("All test cases passed");
    }
}

fn print_outcome(outcome: &TestCaseOutcome, verbose: bool) {
    let duration = outcome.duration.as_millis();
    if outcome.status.is_passed() {
        println!("  {} {} ({}ms)", style("✓").green(), style(&outcome.id).dim(), duration);
        return;
    }

    println!(
        "  {} {} [{}] ({}ms)",
        style("✗").red(),
        style(&outcome.id).red(),
        outcome.status.label(),
        duration
    );
    println!("      {}", style(outcome.status.summary()).red().dim());

    match &outcome.status {
        TestCaseStatus::CompilationFailed(failure) => {
            println!("      dumps: {}", output::path_style().apply_to(failure.artifact.output_dump().display()));
            if verbose {
                output::excerpt(&failure.transcript.rendered, 10, 20);
            }
        }
        TestCaseStatus::DependencyFailed(failures) => {
            for failure in failures {
                println!("      dumps: {}", output::path_style().apply_to(failure.artifact.output_dump().display()));
            }
        }
        TestCaseStatus::ExecutionFailed(failure) if verbose => {
            output::excerpt(&failure.transcript().to_string(), 10, 20);
        }
        _ => {}
    }
}
