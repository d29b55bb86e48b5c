// src/main.rs
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use docs_workbench_lib::sandbox::LocalBooter;
use docs_workbench_lib::shell::ShellBridge;
use docs_workbench_lib::terminal::{BufferTerminal, StdoutTerminal, Terminal};
use docs_workbench_lib::{FileStore, Session, StartOutcome, Workbench, WorkbenchConfig};

#[derive(Parser)]
#[command(name = "docs-workbench", version, about = "Sandbox-backed docs workbench")]
struct Cli {
    /// TOML configuration file; defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Boot a session (setup or restore) and stream the terminal until Ctrl-C.
    Run {
        /// Also start an interactive shell in the project directory.
        #[arg(long)]
        shell: bool,
        /// Host directory backing the sandbox; overrides the config.
        #[arg(long)]
        workspace: Option<PathBuf>,
    },
    /// List the stored file records.
    Records {
        #[arg(long)]
        json: bool,
    },
    /// Boot a session and print the projected content tree.
    Tree {
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("docs_workbench_lib=info,docs_workbench=info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn build_session(config: WorkbenchConfig, terminal: Arc<dyn Terminal>) -> Arc<Session> {
    let booter = Arc::new(LocalBooter::new(config.workspace.root.clone()));
    let store = FileStore::from_config(&config.store);
    Arc::new(Session::new(config, booter, store, terminal))
}

async fn run(config: WorkbenchConfig, with_shell: bool) -> Result<()> {
    let terminal: Arc<dyn Terminal> = if with_shell {
        Arc::new(StdoutTerminal::with_stdin())
    } else {
        Arc::new(StdoutTerminal::new())
    };
    let shell = config.project.shell.clone();
    let project_dir = config.project.project_dir();
    let session = build_session(config, terminal.clone());

    let mut status = session.subscribe_status();
    let status_log = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            info!(stage = %current.stage, progress = current.progress, "status");
        }
    });

    let outcome = session.start().await;
    let _bridge = match &outcome {
        Ok(outcome) => {
            info!(?outcome, "session started");
            if let Some(url) = session.preview_url().await {
                println!("\nPreview: {}", url);
            }
            if with_shell {
                let services = session.services()?;
                Some(
                    ShellBridge::spawn(services.sandbox.as_ref(), terminal, &shell, Some(project_dir))
                        .await
                        .context("failed to start interactive shell")?,
                )
            } else {
                None
            }
        }
        Err(e) => {
            warn!(error = %e, "session did not start; press Ctrl-C to exit");
            None
        }
    };

    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    info!("shutting down");
    session.teardown().await;
    status_log.abort();
    outcome.map(|_| ()).map_err(Into::into)
}

async fn records(config: WorkbenchConfig, json: bool) -> Result<()> {
    let store = FileStore::from_config(&config.store);
    let handle = store.open().context("failed to open file store")?;
    let mut records = handle.find_all().await?;
    records.sort_by(|a, b| a.path.cmp(&b.path));
    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else {
        for record in &records {
            println!(
                "{:<60} {:>8} bytes  {}",
                record.path,
                record.content.len(),
                record.last_modified.as_deref().unwrap_or("-")
            );
        }
        println!("{} record(s)", records.len());
    }
    store.close()?;
    Ok(())
}

async fn tree(config: WorkbenchConfig, json: bool) -> Result<()> {
    let terminal = Arc::new(BufferTerminal::new());
    let session = build_session(config, terminal.clone());
    let workbench = Workbench::new(session.clone());

    let result = session.start().await;
    if let Err(e) = &result {
        eprint!("{}", terminal.contents());
        session.teardown().await;
        anyhow::bail!("session failed to start: {}", e);
    }
    if let Ok(StartOutcome::Bootstrapped(report)) = &result {
        info!(files = report.files, "project was set up from scratch");
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&workbench.list_tree()?)?);
    } else {
        print!("{}", workbench.tree()?.render());
    }
    session.teardown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = WorkbenchConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Command::Run { shell, workspace } => {
            if let Some(root) = workspace {
                config.workspace.root = root;
            }
            run(config, shell).await
        }
        Command::Records { json } => records(config, json).await,
        Command::Tree { json } => tree(config, json).await,
    }
}
