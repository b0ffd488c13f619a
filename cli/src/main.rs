use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use chrono::DateTime;
use chrono::SecondsFormat;
use chrono::Utc;
use clap::Parser;
use clap::Subcommand;
use dirs::home_dir;
use mnemo_memories::MemoriesConfig;
use mnemo_memories::build_memory_tool_developer_instructions;
use mnemo_memories::clear_memory_data;
use mnemo_memories::enqueue_memory_consolidation;
use mnemo_memories::memory_home_for_cwd;
use mnemo_memories::memory_root;
use mnemo_state::MemoryStatus;
use mnemo_state::StateRuntime;
use owo_colors::OwoColorize;
use std::io::IsTerminal;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const CONFIG_FILENAME: &str = "config.toml";

#[derive(Debug, Parser)]
#[command(name = "mnemo-memories")]
#[command(about = "Inspect and maintain the per-project memory store")]
struct Cli {
    /// Application home. Defaults to $MNEMO_HOME or ~/.mnemo.
    #[arg(long, env = "MNEMO_HOME", global = true)]
    home: Option<PathBuf>,

    /// Project directory whose memories to use. Defaults to the current
    /// directory.
    #[arg(long, global = true)]
    cwd: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show job counts, the consolidation job and the watermark.
    Status {
        /// Print the raw status as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Request a consolidation on the next startup even without new input.
    Enqueue,
    /// Delete every memory job, output and artifact for the project.
    Clear,
    /// Print the developer instructions a new session would receive.
    Instructions,
}

/// Directories for the selected project.
struct Project {
    home: PathBuf,
    memory_home: PathBuf,
    memory_root: PathBuf,
}

impl Project {
    fn resolve(cli: &Cli) -> anyhow::Result<Self> {
        let home = cli.home.clone().unwrap_or_else(default_mnemo_home);
        let cwd = match cli.cwd.clone() {
            Some(cwd) => cwd,
            None => std::env::current_dir().context("failed to read the current directory")?,
        };
        let memory_home = memory_home_for_cwd(&home, &cwd);
        Ok(Self {
            memory_root: memory_root(&memory_home),
            home,
            memory_home,
        })
    }

    async fn open_store(&self) -> anyhow::Result<std::sync::Arc<StateRuntime>> {
        StateRuntime::init(self.memory_home.clone())
            .await
            .with_context(|| {
                format!(
                    "failed to open memory store at {}",
                    self.memory_home.display()
                )
            })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let project = Project::resolve(&cli)?;
    debug!("using memory home {}", project.memory_home.display());

    match cli.command {
        Command::Status { json } => {
            let state_db = project.open_store().await?;
            let status = state_db.memory_status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                let colored = std::io::stdout().is_terminal();
                println!("{}", format_status(&project.memory_home, &status, colored));
            }
        }
        Command::Enqueue => {
            let state_db = project.open_store().await?;
            enqueue_memory_consolidation(&state_db).await?;
            println!("consolidation requested for the next startup");
        }
        Command::Clear => {
            let state_db = project.open_store().await?;
            clear_memory_data(&state_db, &project.memory_root).await?;
            println!("cleared memories in {}", project.memory_home.display());
        }
        Command::Instructions => {
            let config = load_config(&project.home).await?;
            match build_memory_tool_developer_instructions(&project.memory_root, &config).await {
                Some(instructions) => println!("{instructions}"),
                None => eprintln!("no memory summary yet"),
            }
        }
    }
    Ok(())
}

fn init_tracing() {
    let default_level = "warn";
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init();
}

fn default_mnemo_home() -> PathBuf {
    if let Some(home) = home_dir() {
        return home.join(".mnemo");
    }
    PathBuf::from(".mnemo")
}

/// Reads `[memories]` from `<home>/config.toml`; a missing file means
/// defaults.
async fn load_config(home: &Path) -> anyhow::Result<MemoriesConfig> {
    let path = home.join(CONFIG_FILENAME);
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => MemoriesConfig::from_config_toml(&contents)
            .with_context(|| format!("failed to parse {}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(MemoriesConfig::default()),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

fn format_status(memory_home: &Path, status: &MemoryStatus, colored: bool) -> String {
    let heading = |text: &str| {
        if colored {
            text.bold().to_string()
        } else {
            text.to_string()
        }
    };
    let jobs = &status.stage1_jobs;
    let phase2 = &status.phase2;

    let mut lines = vec![
        format!("{} {}", heading("store:"), memory_home.display()),
        format!("{} {}", heading("threads:"), status.threads),
        format!(
            "{} pending {}, claimed {}, succeeded {}, no output {}, failed {}",
            heading("stage-1 jobs:"),
            jobs.pending,
            jobs.claimed,
            jobs.succeeded,
            jobs.succeeded_no_output,
            jobs.failed
        ),
        format!("{} {}", heading("stage-1 outputs:"), status.stage1_outputs),
        format!(
            "{} {} (input watermark {}, consolidated watermark {})",
            heading("consolidation:"),
            phase2.status.as_str(),
            phase2.input_watermark,
            status.watermark
        ),
    ];
    if phase2.has_pending_dirty_request() {
        lines.push("  forced consolidation pending".to_string());
    }
    if let Some(retry_after) = phase2.retry_after {
        lines.push(format!("  retry after: {}", format_timestamp(retry_after)));
    }
    if let Some(last_error) = phase2.last_error.as_deref() {
        let last_error = if colored {
            last_error.red().to_string()
        } else {
            last_error.to_string()
        };
        lines.push(format!("  last error: {last_error}"));
    }
    lines.join("\n")
}

fn format_timestamp(ts: i64) -> String {
    match DateTime::<Utc>::from_timestamp(ts, 0) {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Secs, true),
        None => ts.to_string(),
    }
}
