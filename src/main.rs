// Main entry point for cutout-server.
// Parses configuration, prepares the upload directory and the background-removal
// backend, and serves the HTTP API until a shutdown signal arrives.

mod format;
mod remover;
mod shutdown_signal;
mod temp_storage;
mod web;

use clap::Parser;
use format::{DEFAULT_JPEG_QUALITY, FormatNegotiator, OutputFormat};
use remover::{RemovalAdapter, RemoverConfig, RemoverKind, create_remover};
use shutdown_signal::shutdown_signal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use temp_storage::TempStorage;
use tracing::Level;
use web::{AppState, UploadPolicy};

/// Command line arguments for cutout-server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct AppConfig {
    /// Hostname/IP to bind the server to. "*" listens on all interfaces.
    #[arg(long, env = "CUTOUT_SERVER_HOST", default_value = "*")]
    host: String,

    /// Port number to listen on.
    #[arg(short, long, env = "CUTOUT_SERVER_PORT", default_value_t = 3000)]
    port: u16,

    /// Directory where uploads are kept while they are processed.
    /// Defaults to "uploads" under the system temporary directory.
    #[arg(long, env = "CUTOUT_SERVER_UPLOAD_DIR")]
    upload_dir: Option<PathBuf>,

    /// Directory holding the static web client. Not served when it does not exist.
    #[arg(long, env = "CUTOUT_SERVER_PUBLIC_DIR", default_value = "public")]
    public_dir: PathBuf,

    /// Largest accepted image, in bytes.
    #[arg(long, env = "CUTOUT_SERVER_MAX_FILE_SIZE", default_value_t = web::DEFAULT_MAX_FILE_SIZE)]
    max_file_size: usize,

    /// Accepted upload MIME types.
    #[arg(
        long,
        env = "CUTOUT_SERVER_ALLOWED_TYPES",
        value_delimiter = ',',
        default_value = "image/jpeg,image/png,image/webp"
    )]
    allowed_types: Vec<mime::Mime>,

    /// Output format used when the request does not name a known one.
    #[arg(long, env = "CUTOUT_SERVER_DEFAULT_FORMAT", value_enum, default_value_t = OutputFormat::Png)]
    default_format: OutputFormat,

    /// Encoder quality (0.0 - 1.0) for JPEG output.
    #[arg(long, env = "CUTOUT_SERVER_JPEG_QUALITY", default_value_t = DEFAULT_JPEG_QUALITY)]
    jpeg_quality: f32,

    /// Upper bound for a single background removal, including time spent queued.
    #[arg(long, env = "CUTOUT_SERVER_REMOVAL_TIMEOUT_SECS", default_value_t = 120)]
    removal_timeout_secs: u64,

    /// How many background removals may run at the same time.
    #[arg(long, env = "CUTOUT_SERVER_MAX_CONCURRENT_REMOVALS", default_value_t = 2)]
    max_concurrent_removals: usize,

    /// Which background-removal backend to use.
    #[arg(long, env = "CUTOUT_SERVER_BACKEND", value_enum, default_value_t = RemoverKind::Command)]
    backend: RemoverKind,

    /// Program run by the command backend.
    #[arg(long, env = "CUTOUT_SERVER_COMMAND", default_value = "node")]
    command: String,

    /// Arguments for the command backend.
    /// Placeholders: {input}, {input_path}, {format}, {quality}.
    #[arg(
        long,
        env = "CUTOUT_SERVER_COMMAND_ARGS",
        value_delimiter = ',',
        default_value = "scripts/remove-background.mjs,{input},{format},{quality}"
    )]
    command_args: Vec<String>,

    /// Shared library loaded by the plugin backend.
    #[arg(long, env = "CUTOUT_SERVER_PLUGIN_PATH")]
    plugin_path: Option<PathBuf>,

    /// Include internal error details in 500 responses.
    #[arg(long, env = "CUTOUT_SERVER_VERBOSE_ERRORS", action = clap::ArgAction::SetTrue)]
    verbose_errors: bool,

    /// Maximum log level (error, warn, info, debug, trace).
    #[arg(long, env = "CUTOUT_SERVER_LOG_LEVEL", default_value_t = Level::INFO)]
    log_level: Level,
}

#[tokio::main]
async fn main() {
    let config = AppConfig::parse();

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("Starting cutout-server...");

    // --- Upload directory ---
    let upload_dir = config
        .upload_dir
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("uploads"));
    let storage = TempStorage::open(&upload_dir).await.unwrap_or_else(|err| {
        tracing::error!("FATAL: {}", err);
        std::process::exit(1);
    });
    tracing::info!("Upload directory: {:?}", storage.dir());

    // --- Background removal backend ---
    let remover_config = RemoverConfig {
        kind: config.backend,
        command: config.command.clone(),
        command_args: config.command_args.clone(),
        plugin_path: config.plugin_path.clone(),
    };
    let remover = create_remover(&remover_config).unwrap_or_else(|err| {
        tracing::error!("FATAL: Failed to initialize {:?} backend: {}", config.backend, err);
        std::process::exit(1);
    });
    match config.backend {
        RemoverKind::Command => tracing::info!(
            "Using command backend: {} {}",
            config.command,
            config.command_args.join(" ")
        ),
        RemoverKind::Plugin => tracing::info!("Using plugin backend: {:?}", config.plugin_path),
    }
    tracing::info!(
        "Removal limits: {} concurrent, {}s timeout",
        config.max_concurrent_removals,
        config.removal_timeout_secs
    );

    let policy = UploadPolicy {
        allowed_types: config.allowed_types.clone(),
        max_file_size: config.max_file_size,
    };
    tracing::info!(
        "Accepting {} up to {} bytes",
        policy
            .allowed_types
            .iter()
            .map(|m| m.essence_str())
            .collect::<Vec<_>>()
            .join(", "),
        policy.max_file_size
    );

    if config.verbose_errors {
        tracing::warn!("Verbose errors are enabled - internal error details are sent to clients");
    }

    let state = AppState {
        policy: Arc::new(policy),
        storage,
        negotiator: FormatNegotiator::new(config.default_format, config.jpeg_quality),
        remover: RemovalAdapter::new(
            remover,
            config.max_concurrent_removals,
            Duration::from_secs(config.removal_timeout_secs),
        ),
        verbose_errors: config.verbose_errors,
    };

    // --- Static client ---
    let public_dir = if config.public_dir.is_dir() {
        tracing::info!("Serving static files from {:?}", config.public_dir);
        Some(config.public_dir.as_path())
    } else {
        tracing::warn!(
            "Public directory {:?} not found; the web client will not be served",
            config.public_dir
        );
        None
    };

    let app = web::create_app(state, public_dir);
    tracing::info!("Axum router configured.");

    // --- Start HTTP Server ---
    let listener = match web::create_listener(&config.host, config.port).await {
        Ok((addr, listener)) => {
            tracing::info!("Server successfully bound. Listening on {}", addr);
            listener
        }
        Err(e) => {
            tracing::error!("FATAL: Failed to bind server: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!("Server run error: {}", e);
    }

    tracing::info!("cutout-server has shut down.");
}
