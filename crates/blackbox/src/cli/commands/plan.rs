//! Plan command - show module order and planned artifacts

use std::path::PathBuf;
use std::sync::Arc;

use blackbox_core::CompilationMode;
use blackbox_engine::session::group_test_cases;
use blackbox_engine::{ArtifactLayout, EdgeKind, TestCase, TestModule};
use clap::Args;
use console::style;
use serde::Serialize;
use tracing::info;

use super::{load_manifest, resolve_config, SessionArgs};
use crate::cli::{output, Cli, OutputFormat};
use crate::exit_codes;

/// Show module order and planned artifacts without compiling
#[derive(Debug, Args)]
pub struct PlanCommand {
    /// Test plan manifest (.toml, .yaml, .yml or .json)
    pub manifest: PathBuf,

    #[command(flatten)]
    pub session: SessionArgs,
}

#[derive(Debug, Serialize)]
struct PlannedLibrary {
    module: String,
    shared: bool,
    path: PathBuf,
}

#[derive(Debug, Serialize)]
struct PlannedTestCase {
    id: String,
    kind: &'static str,
    package: String,
    order: Vec<String>,
    libraries: Vec<PlannedLibrary>,
}

#[derive(Debug, Serialize)]
struct PlannedExecutable {
    path: PathBuf,
    test_cases: Vec<String>,
}

#[derive(Debug, Serialize)]
struct Plan {
    mode: &'static str,
    test_cases: Vec<PlannedTestCase>,
    executables: Vec<PlannedExecutable>,
}

impl PlanCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<i32> {
        let config = resolve_config(cli, &self.session)?;
        let loaded = load_manifest(&self.manifest, &config)?;
        let layout = ArtifactLayout::new(
            &config.session.output_dir,
            &config.compiler.library_extension,
            &config.compiler.executable_extension,
        );

        let plan = build_plan(&layout, config.compiler.mode, &loaded.test_cases)?;
        info!(
            test_cases = plan.test_cases.len(),
            executables = plan.executables.len(),
            "plan built"
        );

        match cli.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&plan)?),
            OutputFormat::Text if !cli.quiet => print_plan(&plan),
            OutputFormat::Text => {}
        }
        Ok(exit_codes::SUCCESS)
    }
}

fn build_plan(
    layout: &ArtifactLayout,
    mode: CompilationMode,
    test_cases: &[Arc<TestCase>],
) -> anyhow::Result<Plan> {
    let mut planned = Vec::with_capacity(test_cases.len());
    for test_case in test_cases {
        let root = test_case.root_module();
        let mut libraries = Vec::new();
        if mode == CompilationMode::TwoStage {
            libraries.push(planned_library(layout, test_case, root));
        }
        for module in test_case.transitive(root.name(), EdgeKind::All)?.iter() {
            libraries.push(planned_library(layout, test_case, module));
        }

        planned.push(PlannedTestCase {
            id: test_case.id().to_string(),
            kind: test_case.kind().as_str(),
            package: test_case.package().as_str().to_string(),
            order: test_case.order().to_vec(),
            libraries,
        });
    }

    let executables = group_test_cases(test_cases)
        .iter()
        .map(|group| {
            let refs: Vec<&TestCase> = group.iter().map(|tc| tc.as_ref()).collect();
            PlannedExecutable {
                path: layout.executable(&refs).path().to_path_buf(),
                test_cases: group.iter().map(|tc| tc.id().to_string()).collect(),
            }
        })
        .collect();

    Ok(Plan {
        mode: mode.as_str(),
        test_cases: planned,
        executables,
    })
}

fn planned_library(
    layout: &ArtifactLayout,
    test_case: &TestCase,
    module: &TestModule,
) -> PlannedLibrary {
    PlannedLibrary {
        module: module.name().to_string(),
        shared: module.is_shared(),
        path: layout.library(module, test_case.free_args()).path().to_path_buf(),
    }
}

fn print_plan(plan: &Plan) {
    println!();
    println!("{}", output::header("Test cases"));
    for test_case in &plan.test_cases {
        println!();
        println!("  {} ({})", style(&test_case.id).bold(), test_case.kind);
        if !test_case.package.is_empty() {
            println!("{}", output::key_value("package", &test_case.package));
        }
        println!("{}", output::key_value("order", &test_case.order.join(" -> ")));
        for library in &test_case.libraries {
            let label = if library.shared { "shared library" } else { "library" };
            println!(
                "{}",
                output::key_value(
                    label,
                    &format!(
                        "{} {}",
                        library.module,
                        output::path_style().apply_to(library.path.display())
                    )
                )
            );
        }
    }

    println!();
    println!("{} ({})", output::header("Executables"), plan.mode);
    for executable in &plan.executables {
        println!(
            "  {} {}",
            output::path_style().apply_to(executable.path.display()),
            style(format!("[{}]", executable.test_cases.join(", "))).dim()
        );
    }
}
