//! # docchat CLI
//!
//! Upload PDFs for a user, index them, and ask questions scoped to the
//! documents you pick. `serve` exposes the same operations over HTTP.
//!
//! ## Usage
//!
//! ```bash
//! docchat --config ./config/docchat.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docchat upload --user U FILE...` | Extract, cache and register PDFs |
//! | `docchat index --user U` | Upsert every pending document |
//! | `docchat docs --user U` | List documents with indexed/pending status |
//! | `docchat ask --user U --doc ID... "<question>"` | One-shot scoped question |
//! | `docchat chat --user U --doc ID...` | Interactive conversation |
//! | `docchat serve` | Start the HTTP server |
//!
//! Results go to stdout; logs go to stderr (`RUST_LOG` to adjust).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use docchat::app::App;
use docchat::config::{self, Config};
use docchat::error::Error;
use docchat::indexer::ReconcileReport;
use docchat::{logging, server};

/// Chat with your PDFs, one namespace per user.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docchat.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "docchat",
    about = "Multi-tenant retrieval-augmented chat over uploaded PDFs",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docchat.toml")]
    config: PathBuf,

    /// Log debug output to stderr.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract, cache and register PDFs for a user.
    ///
    /// Each file's canonical id is derived from its filename. Uploading a
    /// file whose name normalizes to an existing id re-uses that document.
    Upload {
        #[arg(long)]
        user: String,

        /// PDF files to upload.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Upsert every registered document not yet indexed.
    ///
    /// Documents that fail stay pending and are retried on the next run.
    Index {
        #[arg(long)]
        user: String,
    },

    /// List a user's documents with their indexing status.
    Docs {
        #[arg(long)]
        user: String,
    },

    /// Ask one question against the selected documents.
    Ask {
        #[arg(long)]
        user: String,

        /// Canonical document id to search (repeatable).
        #[arg(long = "doc", required = true)]
        docs: Vec<String>,

        question: String,
    },

    /// Interactive conversation over the selected documents.
    ///
    /// Reads one question per line from stdin; an empty line or EOF ends
    /// the conversation.
    Chat {
        #[arg(long)]
        user: String,

        #[arg(long = "doc", required = true)]
        docs: Vec<String>,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let cfg = config::load_config(&cli.config)?;
    warn_if_ephemeral(&cfg, &cli.command);
    let app = App::from_config(cfg).await?;

    match cli.command {
        Commands::Upload { user, files } => run_upload(&app, &user, &files)?,
        Commands::Index { user } => {
            let report = app.reconcile(&user).await?;
            print_report(&report);
        }
        Commands::Docs { user } => run_docs(&app, &user).await?,
        Commands::Ask {
            user,
            docs,
            question,
        } => run_ask(&app, &user, &docs, &question).await?,
        Commands::Chat { user, docs } => run_chat(&app, &user, &docs).await?,
        Commands::Serve => server::run_server(Arc::new(app)).await?,
    }

    Ok(())
}

fn warn_if_ephemeral(cfg: &Config, command: &Commands) {
    if cfg.index.backend == "memory" && matches!(command, Commands::Index { .. } | Commands::Ask { .. }) {
        tracing::warn!(
            "index.backend is 'memory'; vectors do not outlive this process and every run starts unindexed"
        );
    }
}

fn run_upload(app: &App, user: &str, files: &[PathBuf]) -> Result<()> {
    for path in files {
        let raw_name = file_name(path)?;
        let bytes =
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let id = app
            .upload_pdf(user, &raw_name, &bytes)
            .with_context(|| format!("Failed to upload {}", path.display()))?;
        println!("uploaded {} as {}", raw_name, id);
    }
    Ok(())
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("not a file name: {}", path.display()))
}

fn print_report(report: &ReconcileReport) {
    for id in &report.indexed {
        println!("indexed {}", id);
    }
    for failure in &report.failures {
        println!("warning: {} (still pending)", failure);
    }
    println!(
        "{} indexed, {} pending",
        report.indexed.len(),
        report.failures.len()
    );
}

async fn run_docs(app: &App, user: &str) -> Result<()> {
    let docs = app.documents(user).await?;
    if docs.is_empty() {
        println!("No documents for {}.", user);
        return Ok(());
    }
    for doc in docs {
        let status = if doc.indexed { "indexed" } else { "pending" };
        println!("{}\t{}\t{}", doc.id, status, doc.title);
    }
    Ok(())
}

async fn run_ask(app: &App, user: &str, docs: &[String], question: &str) -> Result<()> {
    let scope = app.scope(user, docs).await?;
    let session = app.session(user);
    let reply = session.submit(question, &scope).await?;
    println!("{}", reply.content);
    Ok(())
}

async fn run_chat(app: &App, user: &str, docs: &[String]) -> Result<()> {
    let scope = app.scope(user, docs).await?;
    let session = app.session(user);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let question = line.trim();
        if question.is_empty() {
            break;
        }

        match session.submit(question, &scope).await {
            Ok(reply) => println!("{}\n", reply.content),
            Err(Error::Completion { prompt, reason }) => {
                eprintln!("error: {} (not sent: \"{}\"; try again)", reason, prompt);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
