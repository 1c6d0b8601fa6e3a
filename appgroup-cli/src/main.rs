//! Developer CLI driving the AppGroup backend against a local file store.
//!
//! ```text
//! appgroup create app/web --data '{"policies": "dev", "secret_id_num_uses": 2}'
//! appgroup update app/web/secret-id
//! appgroup update login --data '{"app": "web", "secret_id": "..."}'
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use appgroup_core::storage::FileStorage;
use appgroup_core::{Backend, BackendConfig, ErrorResponse, Operation, Request};
use clap::Parser;
use eyre::{eyre, WrapErr};
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "appgroup", version, about = "AppGroup credential backend CLI")]
struct Cli {
    /// Operation: read, create, update, delete or list.
    operation: Operation,

    /// Request path, e.g. `app/web/secret-id`.
    path: String,

    /// Request data as a JSON object.
    #[arg(long, short)]
    data: Option<String>,

    /// Evaluation time in unix milliseconds (defaults to now).
    #[arg(long)]
    now: Option<u64>,

    /// Directory of the file-backed store.
    #[arg(long, env = "APPGROUP_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// JSON file with backend defaults.
    #[arg(long, env = "APPGROUP_CONFIG")]
    config: Option<PathBuf>,

    /// Pretty-print the response.
    #[arg(long)]
    pretty: bool,
}

fn default_storage_dir() -> eyre::Result<PathBuf> {
    dirs::data_dir()
        .map(|dir| dir.join("appgroup"))
        .ok_or_else(|| eyre!("no data directory on this platform; pass --storage-dir"))
}

fn load_config(path: Option<&Path>) -> eyre::Result<BackendConfig> {
    let Some(path) = path else {
        return Ok(BackendConfig::default());
    };
    let bytes =
        std::fs::read(path).wrap_err_with(|| format!("reading config {}", path.display()))?;
    BackendConfig::from_json(&bytes).wrap_err_with(|| format!("parsing config {}", path.display()))
}

fn run(cli: &Cli) -> eyre::Result<Result<Value, ErrorResponse>> {
    let storage_dir = match &cli.storage_dir {
        Some(dir) => dir.clone(),
        None => default_storage_dir()?,
    };
    let config = load_config(cli.config.as_deref())?;
    let storage = FileStorage::open(&storage_dir)
        .wrap_err_with(|| format!("opening store at {}", storage_dir.display()))?;
    let backend = Backend::new(Arc::new(storage), config).wrap_err("initializing backend")?;

    let data = match &cli.data {
        Some(raw) => serde_json::from_str(raw).wrap_err("--data is not valid JSON")?,
        None => Value::Null,
    };
    let mut request = Request::new(cli.operation, cli.path.clone(), data);
    if let Some(now) = cli.now {
        request = request.at(now);
    }
    tracing::debug!(operation = %cli.operation, path = %cli.path, "dispatching");
    Ok(backend.handle(&request).map(|response| response.data))
}

fn render(value: &impl serde::Serialize, pretty: bool) -> eyre::Result<String> {
    Ok(if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    })
}

fn main() -> eyre::Result<ExitCode> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(&cli)? {
        Ok(Value::Null) => Ok(ExitCode::SUCCESS),
        Ok(data) => {
            println!("{}", render(&data, cli.pretty)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(error) => {
            eprintln!("{}", render(&error, cli.pretty)?);
            Ok(ExitCode::FAILURE)
        }
    }
}
