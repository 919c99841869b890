//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tdpflow_agents::AgentRegistry;
use tdpflow_core::{
    GroupCatalog, Input, Parent, ProgressReporter, StepOutcome, StepSpec, StepTarget,
    WorkflowRunner,
};
use tdpflow_shared::{
    AppConfig, Document, PersistenceService, Scenario, ScenarioId, Status, init_config,
    load_config,
};
use tdpflow_storage::Storage;
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// tdpflow: turn technical data package documents into searchable knowledge.
#[derive(Parser)]
#[command(
    name = "tdpflow",
    version,
    about = "Ingest technical data package documents and run them through transformation pipelines.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Store a file as a source document and assess it.
    Ingest {
        /// File to ingest.
        path: PathBuf,

        /// Scenario the document belongs to.
        #[arg(short, long)]
        scenario: String,

        /// Document name (defaults to the file name).
        #[arg(short, long)]
        name: Option<String>,

        /// Free-text description.
        #[arg(short, long)]
        description: Option<String>,

        /// Special instructions passed to steps that accept them.
        #[arg(short, long)]
        instructions: Option<String>,
    },

    /// Run an agent group over an ingested source document.
    Run {
        /// Source document name.
        file_name: String,

        #[arg(short, long)]
        scenario: String,

        /// Agent group (defaults to `defaults.default_group`).
        #[arg(short, long)]
        group: Option<String>,
    },

    /// Re-run the step that produced a derivative.
    Reprocess {
        /// Derivative document name.
        derivative: String,

        #[arg(short, long)]
        scenario: String,
    },

    /// List the documents of a scenario.
    Status {
        #[arg(short, long)]
        scenario: String,

        /// Print records as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List the built-in agent groups.
    Groups,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "tdpflow=info",
        1 => "tdpflow=debug",
        _ => "tdpflow=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Ingest {
            path,
            scenario,
            name,
            description,
            instructions,
        } => {
            cmd_ingest(
                &path,
                &scenario,
                name.as_deref(),
                description.as_deref(),
                instructions.as_deref(),
            )
            .await
        }
        Command::Run {
            file_name,
            scenario,
            group,
        } => cmd_run(&file_name, &scenario, group.as_deref()).await,
        Command::Reprocess {
            derivative,
            scenario,
        } => cmd_reprocess(&derivative, &scenario).await,
        Command::Status { scenario, json } => cmd_status(&scenario, json).await,
        Command::Groups => cmd_groups(),
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(),
        },
    }
}

async fn open_store(config: &AppConfig) -> Result<Storage> {
    let path = config.db_path()?;
    Ok(Storage::open(&path).await?)
}

fn scenario_of(id: &str) -> Result<Scenario> {
    Ok(Scenario::new(ScenarioId::new(id)?))
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_ingest(
    path: &Path,
    scenario: &str,
    name: Option<&str>,
    description: Option<&str>,
    instructions: Option<&str>,
) -> Result<()> {
    let config = load_config()?;
    let scenario = scenario_of(scenario)?;
    let store = open_store(&config).await?;

    let content =
        std::fs::read(path).map_err(|e| eyre!("cannot read '{}': {e}", path.display()))?;
    let file_name = match name {
        Some(n) => n.to_string(),
        None => path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| eyre!("'{}' has no file name", path.display()))?,
    };

    info!(scenario = %scenario.id, file_name = %file_name, bytes = content.len(), "ingesting document");

    let mut doc = Document::source(&file_name, description.unwrap_or_default())
        .with_status(Status::Queued)
        .with_special_instructions(instructions.unwrap_or_default());
    doc.write(&store, &scenario.id, Some(&content)).await?;
    doc.assess(&store, &scenario.id, &config.assessment).await?;

    println!();
    println!("  Document ingested.");
    println!("  Name:     {}", doc.file_name());
    println!("  Size:     {:.1} KB", doc.size_kb);
    println!("  Loading:  {:?}", doc.loading_method);
    println!("  Storage:  {}", doc.storage_url);
    println!();

    Ok(())
}

async fn cmd_run(file_name: &str, scenario: &str, group: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let scenario = scenario_of(scenario)?;
    let store = open_store(&config).await?;
    let registry = AgentRegistry::from_config(&config)?;
    let group = group.unwrap_or(config.defaults.default_group.as_str());

    let source = store.get_source_ref(&scenario.id, file_name).await?;

    info!(scenario = %scenario.id, file_name, group, "running agent group");

    let reporter = CliProgress::new();
    let runner = WorkflowRunner::new(scenario, &store, &registry).with_progress(&reporter);
    let outcome = runner.run_group(group, &source).await;
    reporter.finish();

    report_outcome(&outcome?)
}

async fn cmd_reprocess(derivative: &str, scenario: &str) -> Result<()> {
    let config = load_config()?;
    let scenario = scenario_of(scenario)?;
    let store = open_store(&config).await?;
    let registry = AgentRegistry::from_config(&config)?;

    info!(scenario = %scenario.id, derivative, "reprocessing derivative");

    let reporter = CliProgress::new();
    let runner = WorkflowRunner::new(scenario, &store, &registry).with_progress(&reporter);
    let outcome = runner.reprocess(derivative).await;
    reporter.finish();

    report_outcome(&outcome?)
}

fn report_outcome(outcome: &StepOutcome) -> Result<()> {
    match &outcome.failure {
        None => {
            println!();
            println!("  Pipeline finished.");
            println!("  Output:  {}", outcome.document.file_name());
            println!("  Status:  {}", outcome.document.status());
            println!();
            Ok(())
        }
        Some(failure) => Err(eyre!(
            "step producing '{}' failed: {}",
            failure.file_name(),
            failure.error
        )),
    }
}

async fn cmd_status(scenario: &str, json: bool) -> Result<()> {
    let config = load_config()?;
    let scenario = scenario_of(scenario)?;
    let store = open_store(&config).await?;
    let docs = store.list_documents(&scenario.id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&docs)?);
        return Ok(());
    }

    if docs.is_empty() {
        println!("No documents in scenario '{}'.", scenario.id);
        return Ok(());
    }
    for doc in &docs {
        println!("{}", status_line(doc));
        if !doc.error.is_empty() {
            println!("      error: {}", doc.error);
        }
    }
    Ok(())
}

fn status_line(doc: &Document) -> String {
    let origin = match (doc.agent_name(), doc.source_file_name()) {
        (Some(agent), Some(source)) => format!("{agent} <- {source}"),
        _ => doc.kind().to_string(),
    };
    format!("  {:<40} {:<24} {origin}", doc.file_name(), doc.status().as_str())
}

fn cmd_groups() -> Result<()> {
    let catalog = GroupCatalog::builtin();
    for spec in catalog.iter() {
        println!("{} ({})", spec.name, spec.output_ext);
        for (i, step) in spec.steps.iter().enumerate() {
            println!("  {}. {}", i + 1, describe_step(step));
        }
    }
    Ok(())
}

fn describe_step(step: &StepSpec) -> String {
    let target = match &step.target {
        StepTarget::Agent(kind) => kind.name().to_string(),
        StepTarget::Group(name) => format!("group {name}"),
        StepTarget::Custom(name) => name.clone(),
    };
    let mut wiring = Vec::new();
    match step.input {
        Input::Previous => {}
        Input::Step(n) => wiring.push(format!("input {n}")),
        Input::Source => wiring.push("input source".to_string()),
    }
    match step.parent {
        Parent::Previous => {}
        Parent::Step(n) => wiring.push(format!("parent {n}")),
        Parent::Source => wiring.push("parent source".to_string()),
    }
    if let Some(n) = step.configure_from {
        wiring.push(format!("configured by {n}"));
    }
    if wiring.is_empty() {
        target
    } else {
        format!("{target} ({})", wiring.join(", "))
    }
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl ProgressReporter for CliProgress {
    fn step_started(&self, step_num: u32, agent: &str, output: &str) {
        self.spinner
            .set_message(format!("[{step_num}] {agent} -> {output}"));
    }

    fn step_finished(&self, outcome: &StepOutcome) {
        match &outcome.failure {
            None => self
                .spinner
                .println(format!("  ok    {}", outcome.document.file_name())),
            Some(failure) => self
                .spinner
                .println(format!("  error {}", failure.file_name())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tdpflow_agents::StepKind;

    #[test]
    fn parses_run_with_group() {
        let cli = Cli::try_parse_from([
            "tdpflow", "run", "spec.pdf", "--scenario", "s1", "--group", "section-chunk", "-vv",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Run {
                file_name, group, ..
            } => {
                assert_eq!(file_name, "spec.pdf");
                assert_eq!(group.as_deref(), Some("section-chunk"));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn scenario_is_required() {
        assert!(Cli::try_parse_from(["tdpflow", "status"]).is_err());
        assert!(Cli::try_parse_from(["tdpflow", "groups"]).is_ok());
    }

    #[test]
    fn describes_step_wiring() {
        assert_eq!(describe_step(&StepSpec::agent(StepKind::TextChunk)), "TextChunkAgent");
        let step = StepSpec::agent(StepKind::SectionChunkWithTableOfContents)
            .from_source()
            .configured_by(2);
        assert_eq!(
            describe_step(&step),
            "SectionChunkWithTableOfContentsAgent (input source, parent source, configured by 2)"
        );
    }
}
