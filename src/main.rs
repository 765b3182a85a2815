//! npm-runner CLI
//!
//! Run a program:
//!   npm-runner run script.js
//!   npm-runner run --code "import pad from 'left-pad'; console.log(pad('x', 3))"
//!   npm-runner run --package contains-emoji
//!   cat script.js | npm-runner run
//!
//! Inspect the pipeline:
//!   npm-runner rewrite script.js
//!   npm-runner document script.js --html
//!   npm-runner seed left-pad
//!
//! Console output is printed to stdout as `[LOG] ...` / `[ERROR] ...` lines.
//! Diagnostics go to stderr and are controlled with `RUST_LOG`.

use std::io::Read;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use npm_runner::{
    synthesize, ImportRewriter, LogKind, NpmRegistry, RunState, RunnerConfig, Session,
    DEFAULT_PACKAGE,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "npm-runner", version, about = "Run JavaScript snippets that import NPM packages from ESM CDNs")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, env = "NPM_RUNNER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a program and print its console output
    Run {
        #[command(flatten)]
        source: SourceArgs,

        /// Run the starter code from this package's README instead
        #[arg(long, conflicts_with_all = ["file", "code"])]
        package: Option<String>,
    },
    /// Print the import preamble and the remaining body
    Rewrite {
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Print the executable document
    Document {
        #[command(flatten)]
        source: SourceArgs,

        /// Wrap the script in an HTML page
        #[arg(long)]
        html: bool,
    },
    /// Print the starter code for a package
    Seed {
        #[arg(default_value = DEFAULT_PACKAGE)]
        package: String,
    },
}

#[derive(Debug, Args)]
struct SourceArgs {
    /// Program file (reads stdin when neither a file nor --code is given)
    file: Option<PathBuf>,

    /// Program text
    #[arg(long, conflicts_with = "file")]
    code: Option<String>,
}

impl SourceArgs {
    fn read(&self) -> Result<String> {
        if let Some(code) = &self.code {
            return Ok(code.clone());
        }
        match &self.file {
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display())),
            None => {
                let mut source = String::new();
                std::io::stdin()
                    .read_to_string(&mut source)
                    .context("Failed to read stdin")?;
                Ok(source)
            }
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<RunnerConfig> {
    match path {
        Some(path) => Ok(RunnerConfig::from_file(path)?),
        None => Ok(RunnerConfig::default()),
    }
}

/// Run a program to completion and print its console output
async fn run(config: &RunnerConfig, source: String) -> Result<()> {
    let mut session = Session::new(config)?;
    session.set_code(source);
    session.run_code();

    if let Some(notice) = session.notice() {
        eprintln!("{}", notice);
        return Ok(());
    }

    let state = session.settle().await;

    for entry in session.logs() {
        match entry.kind {
            LogKind::Log => println!("[LOG] {}", entry.text),
            LogKind::Error => println!("[ERROR] {}", entry.text),
        }
    }

    if state == RunState::Errored {
        return Err(anyhow!("Run finished with errors"));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,npm_runner=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Run { source, package } => {
            let source = match package {
                Some(package) => {
                    let registry = NpmRegistry::new(&config.registry_url)?;
                    let code = registry.seed_code(&package).await;
                    info!(package = %package, "Running starter code");
                    code
                }
                None => source.read()?,
            };
            run(&config, source).await
        }
        Command::Rewrite { source } => {
            let program = ImportRewriter::new(config.resolvers.clone()).rewrite(&source.read()?);
            println!("// --- preamble ({} imports)", program.imports.len());
            println!("{}", program.preamble);
            println!("// --- body");
            println!("{}", program.body);
            Ok(())
        }
        Command::Document { source, html } => {
            let program = ImportRewriter::new(config.resolvers.clone()).rewrite(&source.read()?);
            let document = synthesize(&program.preamble, &program.body);
            if html {
                println!("{}", document.to_html());
            } else {
                println!("{}", document.script());
            }
            Ok(())
        }
        Command::Seed { package } => {
            let registry = NpmRegistry::new(&config.registry_url)?;
            println!("{}", registry.seed_code(&package).await);
            Ok(())
        }
    }
}
