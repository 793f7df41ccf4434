use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use std::env;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod artifacts;
mod config_files;
mod doctor;
mod setup;
mod smoke;

const ROOT_ENV: &str = "URLCTL_ROOT";
const PYTHON_ENV: &str = "URLCTL_PYTHON";
const LOG_ENV: &str = "URLCTL_LOG";
const PYTHON_CANDIDATES: &[&str] = &["python3", "python"];

#[derive(Parser, Debug)]
#[command(
    name = "urlctl",
    version,
    about = "Readiness checks and bootstrap for URLControl hosts"
)]
struct Cli {
    /// Project root (defaults to the current directory).
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    /// Python interpreter used by the dashboard, API and engine.
    #[arg(long, global = true)]
    python: Option<String>,
    #[arg(long, global = true)]
    json: bool,
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Inspect the host and print a readiness report.
    Doctor,
    /// Generate secrets, notification credentials and startup artifacts.
    Setup,
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    Paths,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Write the static YAML documents, overwriting existing ones.
    Init,
    Validate,
}

#[derive(Debug, Error)]
pub(crate) enum UrlctlError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("process error: {0}")]
    Process(String),
}

#[derive(Debug, Serialize)]
pub(crate) struct JsonResult<T: Serialize> {
    pub(crate) ok: bool,
    pub(crate) result: Option<T>,
    pub(crate) error: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct Context {
    pub(crate) root: PathBuf,
    pub(crate) python: Option<PathBuf>,
    pub(crate) json: bool,
}

impl Context {
    pub(crate) fn config_document_path(&self) -> PathBuf {
        self.root.join(config_files::CONFIG_DOCUMENT)
    }

    /// Interpreter name used when rendering commands for the operator.
    pub(crate) fn python_display(&self) -> String {
        self.python
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "python3".to_string())
    }
}

fn main() -> Result<(), UrlctlError> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());
    let ctx = build_context(&cli)?;
    tracing::debug!(root = %ctx.root.display(), python = ?ctx.python, "resolved context");

    let result = match cli.command {
        Commands::Doctor => doctor::handle_doctor(&ctx),
        Commands::Setup => setup::handle_setup(&ctx),
        Commands::Config { command } => handle_config(&ctx, command),
        Commands::Paths => handle_paths(&ctx),
    };

    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
            };
            print_json(&payload)?;
        } else {
            eprintln!("{err}");
        }
        std::process::exit(1);
    }

    Ok(())
}

fn init_logging(level: Option<&str>) {
    let directive = level
        .map(str::to_string)
        .or_else(|| env::var(LOG_ENV).ok())
        .unwrap_or_else(|| "warn".to_string());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .init();
}

fn build_context(cli: &Cli) -> Result<Context, UrlctlError> {
    let root = resolve_root(cli.root.as_ref())?;
    let python = resolve_python(cli.python.as_deref());
    Ok(Context {
        root,
        python,
        json: cli.json,
    })
}

fn resolve_root(override_path: Option<&PathBuf>) -> Result<PathBuf, UrlctlError> {
    let raw = match override_path {
        Some(path) => path.clone(),
        None => match env::var(ROOT_ENV) {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => env::current_dir()?,
        },
    };
    if raw.is_absolute() {
        return Ok(raw);
    }
    Ok(env::current_dir()?.join(raw))
}

fn resolve_python(override_name: Option<&str>) -> Option<PathBuf> {
    let requested = override_name
        .map(str::to_string)
        .or_else(|| env::var(PYTHON_ENV).ok())
        .filter(|value| !value.trim().is_empty());
    if let Some(name) = requested {
        // Keep an explicit choice even when it cannot be found so the probe
        // reports it instead of silently using another interpreter.
        return Some(which::which(&name).unwrap_or_else(|_| PathBuf::from(name)));
    }
    PYTHON_CANDIDATES
        .iter()
        .find_map(|name| which::which(name).ok())
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), UrlctlError> {
    match command {
        ConfigCommand::Init => {
            let written = config_files::write_yaml_documents(&ctx.root);
            let mut failed = 0usize;
            let mut rows = Vec::new();
            for (path, result) in &written {
                match result {
                    Ok(()) => rows.push(json!({"path": path, "written": true})),
                    Err(err) => {
                        failed += 1;
                        rows.push(json!({"path": path, "written": false, "error": err.to_string()}));
                    }
                }
            }
            if !ctx.json {
                for (path, result) in &written {
                    match result {
                        Ok(()) => println!("[ok] wrote {}", display_relative(path, &ctx.root)),
                        Err(err) => println!(
                            "[fail] {}: {}",
                            display_relative(path, &ctx.root),
                            err
                        ),
                    }
                }
            }
            if failed > 0 {
                return Err(UrlctlError::Process(format!(
                    "{failed} of {} YAML documents could not be written",
                    written.len()
                )));
            }
            if ctx.json {
                return output(ctx, json!({"documents": rows}));
            }
            Ok(())
        }
        ConfigCommand::Validate => {
            let checks = config_files::validate_yaml_documents(&ctx.root);
            let invalid: Vec<&config_files::YamlCheck> = checks
                .iter()
                .filter(|check| matches!(check.state, config_files::ConfigFileState::Invalid(_)))
                .collect();
            if invalid.is_empty() {
                if ctx.json {
                    return output(ctx, json!({"documents": checks}));
                }
                for check in &checks {
                    println!("{}", check.describe());
                }
                return Ok(());
            }
            let message = format!(
                "invalid YAML in {}",
                invalid
                    .iter()
                    .map(|check| check.path.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            if !ctx.json {
                for check in &checks {
                    println!("{}", check.describe());
                }
                return Err(UrlctlError::Config(message));
            }
            // The per-document states travel with the failure envelope.
            let payload = JsonResult {
                ok: false,
                result: Some(json!({"documents": checks})),
                error: Some(format!("config error: {message}")),
            };
            print_json(&payload)?;
            std::process::exit(1);
        }
    }
}

fn handle_paths(ctx: &Context) -> Result<(), UrlctlError> {
    let artifact_paths: Vec<PathBuf> = artifacts::ARTIFACT_FILES
        .iter()
        .map(|name| ctx.root.join(name))
        .collect();
    let yaml_paths: Vec<PathBuf> = config_files::YAML_DOCUMENTS
        .iter()
        .map(|doc| ctx.root.join(doc.relative_path))
        .collect();
    let config_document = ctx.config_document_path();
    output(
        ctx,
        json!({
            "root": ctx.root,
            "config_document": config_document,
            "config_document_exists": config_document.exists(),
            "python": ctx.python,
            "yaml_documents": yaml_paths,
            "startup_artifacts": artifact_paths,
        }),
    )
}

pub(crate) fn display_relative(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .map(|rel| rel.display().to_string())
        .unwrap_or_else(|_| path.display().to_string())
}

pub(crate) fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), UrlctlError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", serde_json::to_string_pretty(&payload)?);
    }
    Ok(())
}

pub(crate) fn print_json<T: Serialize>(payload: &T) -> Result<(), UrlctlError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
