//! `polyglot`: drive on-demand language servers from the command line.
//!
//! Every command builds an [`LspManager`] for the project directory, performs
//! one operation, and shuts the servers it started back down.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use polyglot_config::PolyglotConfig;
use polyglot_lsp::{Location, LspConfig, LspManager};

#[derive(Parser)]
#[command(name = "polyglot")]
#[command(about = "Start language servers on demand and query them")]
struct Cli {
    /// Project directory (defaults to the current directory)
    #[arg(long, global = true)]
    project: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List known servers and whether they are enabled and installed
    Status,
    /// Open files and print the diagnostics their servers report
    Check {
        /// Files to check
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Show hover information at a position
    Hover(PositionArgs),
    /// List completions at a position
    Complete(PositionArgs),
    /// Print where the symbol at a position is defined
    Definition(PositionArgs),
    /// Print every reference to the symbol at a position
    References(PositionArgs),
    /// Install a server into the managed cache
    Install {
        /// Server id (e.g. "rust-analyzer")
        server: String,
    },
    /// Enable a server and remember the choice
    Enable { server: String },
    /// Disable a server and remember the choice
    Disable { server: String },
    /// Inspect or clear the managed cache
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Show the cache location and contents
    Info,
    /// Remove everything installed into the cache
    Clear,
}

#[derive(clap::Args)]
struct PositionArgs {
    file: PathBuf,
    /// 1-based line
    line: u32,
    /// 1-based column
    column: u32,
}

impl PositionArgs {
    fn zero_based(&self) -> Result<(u32, u32)> {
        if self.line == 0 || self.column == 0 {
            bail!("line and column are 1-based");
        }
        Ok((self.line - 1, self.column - 1))
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

fn load_config() -> LspConfig {
    match PolyglotConfig::load() {
        Ok(Some(config)) => config.lsp,
        Ok(None) => LspConfig::default(),
        Err(err) => {
            eprintln!("warning: {err}; using defaults");
            LspConfig::default()
        }
    }
}

fn print_locations(locations: &[Location]) {
    for location in locations {
        let start = location.range.start;
        match location.path() {
            Some(path) => println!(
                "{}:{}:{}",
                path.display(),
                start.line + 1,
                start.character + 1
            ),
            None => println!("{}:{}:{}", location.uri, start.line + 1, start.character + 1),
        }
    }
}

async fn run(cli: Cli, manager: &LspManager) -> Result<ExitCode> {
    match cli.command {
        Commands::Status => {
            for server in manager.status() {
                let state = match (server.enabled, server.installed) {
                    (false, _) => "disabled",
                    (true, true) => "installed",
                    (true, false) if server.installable => "not installed",
                    (true, false) => "missing",
                };
                println!(
                    "{:<16} {:<14} {}",
                    server.id,
                    state,
                    server.extensions.join(", ")
                );
            }
        }
        Commands::Check { files } => {
            for file in &files {
                manager.touch_file(file, true).await;
            }
            let snapshot = manager.all_diagnostics();
            for (path, diagnostics) in snapshot.files() {
                for diagnostic in diagnostics {
                    println!("{}", diagnostic.display_with_path(path));
                }
            }
            eprintln!("{}", snapshot.status_string());
            if snapshot.error_count() > 0 {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Hover(args) => {
            let (line, character) = args.zero_based()?;
            match manager.hover(&args.file, line, character).await {
                Some(hover) => println!("{}", hover.contents),
                None => return Ok(ExitCode::FAILURE),
            }
        }
        Commands::Complete(args) => {
            let (line, character) = args.zero_based()?;
            for item in manager.completion(&args.file, line, character).await {
                match item.detail {
                    Some(detail) => println!("{}\t{detail}", item.label),
                    None => println!("{}", item.label),
                }
            }
        }
        Commands::Definition(args) => {
            let (line, character) = args.zero_based()?;
            match manager.definition(&args.file, line, character).await {
                Some(locations) => print_locations(&locations),
                None => return Ok(ExitCode::FAILURE),
            }
        }
        Commands::References(args) => {
            let (line, character) = args.zero_based()?;
            print_locations(&manager.references(&args.file, line, character).await);
        }
        Commands::Install { server } => {
            let path = manager
                .install_server(&server)
                .await
                .with_context(|| format!("installing {server}"))?;
            println!("{}", path.display());
        }
        Commands::Enable { server } => set_enabled(manager, &server, true).await?,
        Commands::Disable { server } => set_enabled(manager, &server, false).await?,
        Commands::Cache { command } => match command {
            CacheCommand::Info => {
                let info = manager.cache_info();
                println!("path:     {}", info.path.display());
                println!(
                    "version:  {}",
                    info.version.as_deref().unwrap_or("(not initialized)")
                );
                println!("size:     {} bytes", info.size_bytes);
                println!("packages: {}", if info.has_packages { "yes" } else { "no" });
                println!("binaries: {}", info.binaries.join(", "));
            }
            CacheCommand::Clear => {
                manager.clear_cache().await.context("clearing cache")?;
                println!("cleared {}", manager.cache_info().path.display());
            }
        },
    }
    Ok(ExitCode::SUCCESS)
}

async fn set_enabled(manager: &LspManager, server: &str, enabled: bool) -> Result<()> {
    if manager.registry().get(server).is_none() {
        bail!("unknown language server `{server}`");
    }
    PolyglotConfig::persist_server_enabled(server, enabled)
        .with_context(|| format!("updating {}", config_display()))?;
    manager.set_server_enabled(server, enabled).await;
    println!("{server} {}", if enabled { "enabled" } else { "disabled" });
    Ok(())
}

fn config_display() -> String {
    PolyglotConfig::path().map_or_else(|| "config".to_string(), |p| p.display().to_string())
}

fn project_dir(project: Option<&Path>) -> Result<PathBuf> {
    let cwd = std::env::current_dir().context("reading current directory")?;
    Ok(match project {
        Some(path) if path.is_absolute() => path.to_path_buf(),
        Some(path) => cwd.join(path),
        None => cwd,
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();

    let cli = Cli::parse();
    let config = load_config();
    let project = project_dir(cli.project.as_deref())?;
    let manager = LspManager::new(config, project).context("preparing server cache")?;
    let result = run(cli, &manager).await;
    manager.shutdown().await;
    result
}
