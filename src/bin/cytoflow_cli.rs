use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use cytoflow::{
    config::AnalysisParameters,
    document::load_document,
    workflow::Workflow,
};
use serde::Serialize;
use std::{
    fs::File,
    path::{Path, PathBuf},
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cytoflow_cli", version, about = "Evaluate flow cytometry workflows")]
struct Cli {
    /// TOML file with analysis parameters; overrides those saved in the workflow
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print supported operations, views and tube formats
    Capabilities,
    /// Evaluate a workflow and print the status of every item
    Run {
        workflow: PathBuf,
        /// Exit with an error if any item ends up invalid
        #[arg(long)]
        strict: bool,
    },
    /// Evaluate a workflow and write one item's result as CSV
    ExportCsv {
        workflow: PathBuf,
        index: usize,
        output: PathBuf,
    },
    /// Evaluate a workflow and print the plot data of one item's view
    RenderView {
        workflow: PathBuf,
        index: usize,
        /// View index; the operation's default view when omitted
        #[arg(long)]
        view: Option<usize>,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Could not serialize JSON output")?;
    println!("{text}");
    Ok(())
}

fn evaluate(path: &Path, config: Option<&Path>) -> Result<Workflow> {
    let document = load_document(path)?;
    let mut workflow = document.into_workflow()?;
    if let Some(config) = config {
        let params = AnalysisParameters::load(Some(config))
            .with_context(|| format!("Could not load parameters from '{}'", config.display()))?;
        // set_params re-evaluates the chain
        workflow.set_params(params);
    } else {
        workflow.update_from(0);
    }
    Ok(workflow)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Capabilities => print_json(&Workflow::capabilities()),
        Command::Run { workflow, strict } => {
            let workflow = evaluate(&workflow, cli.config.as_deref())?;
            let summary = workflow.summary();
            print_json(&summary)?;
            if strict && !summary.is_fully_valid() {
                bail!(
                    "{} of {} item(s) are invalid",
                    summary.item_count - summary.valid_count,
                    summary.item_count
                );
            }
            Ok(())
        }
        Command::ExportCsv {
            workflow,
            index,
            output,
        } => {
            let workflow = evaluate(&workflow, cli.config.as_deref())?;
            let item = workflow
                .item(index)
                .with_context(|| format!("Workflow has no item {index}"))?;
            let Some(result) = item.result() else {
                bail!(
                    "Item {index} ({}) is {}: {}",
                    item.operation().name(),
                    item.status(),
                    item.error().unwrap_or("no result")
                );
            };
            let file = File::create(&output)
                .with_context(|| format!("Could not create '{}'", output.display()))?;
            result.write_csv(file)?;
            eprintln!("Wrote {} events to '{}'", result.len(), output.display());
            Ok(())
        }
        Command::RenderView {
            workflow,
            index,
            view,
        } => {
            let workflow = evaluate(&workflow, cli.config.as_deref())?;
            print_json(&workflow.render_view(index, view)?)
        }
    }
}
