#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # devlink-server
//!
//! Registration resolver host for devlink devices.
//!
//! The platform forwards `registerDevice` mutations from unauthenticated
//! devices to this service, which checks the registration code, mints a
//! device API token and creates the device record.
//!
//! ## Subcommands
//!
//! - `devlink-server serve` (default): run the HTTP server
//! - `devlink-server invoke --request <file.json>`: run the resolver once on an
//!   event document and print the response
//!
//! ## API surface
//!
//! | Method | Path                             | Auth | Description                  |
//! |--------|----------------------------------|------|------------------------------|
//! | GET    | `/api/health`                    | No   | Liveness probe               |
//! | POST   | `/api/resolvers/registerDevice`  | Yes  | Exchange code for credentials|
//!
//! ## Architecture
//!
//! ```text
//! main.rs          entry point, clap subcommands, graceful shutdown
//! lib.rs           router assembly
//! auth.rs          Bearer host key middleware, constant-time comparison
//! config.rs        TOML + env-var configuration
//! resolver.rs      registerDevice state machine, token compensation
//! invoke.rs        one-shot invocation from an event file
//! backend/
//!   mod.rs         Backend trait, record types, backend selection
//!   graphql.rs     platform GraphQL API with a service token
//!   memory.rs      in-process store for local runs and tests
//! routes/
//!   health.rs      GET /api/health
//!   resolvers.rs   POST /api/resolvers/registerDevice
//! ```

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use devlink_server::backend::build_backend;
use devlink_server::config::Config;
use devlink_server::{invoke, AppState, RegistrationEvent, Resolver};

/// Registration resolver host for devlink devices.
#[derive(Parser)]
#[command(name = "devlink-server", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run the resolver once and print the response as JSON.
    Invoke {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
        /// Event document, e.g. `{"data": {"code": "ABC123"}}`.
        #[arg(long, conflicts_with = "code", required_unless_present = "code")]
        request: Option<String>,
        /// Registration code, instead of an event file.
        #[arg(long)]
        code: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Invoke {
            config,
            request,
            code,
        }) => run_invoke(config.as_deref(), request.as_deref(), code).await,
        Some(Commands::Serve { config }) => run_server(config.as_deref()).await,
        None => run_server(None).await,
    };

    if let Err(e) = result {
        eprintln!("devlink-server: {e}");
        std::process::exit(1);
    }
}

fn init_tracing(config: &Config) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_invoke(
    config_path: Option<&str>,
    request: Option<&str>,
    code: Option<String>,
) -> Result<(), String> {
    let config = Config::load(config_path)?;
    init_tracing(&config);

    let event = match (request, code) {
        (Some(path), _) => invoke::read_event(path)?,
        (None, Some(code)) => RegistrationEvent::new(code),
        (None, None) => return Err("either --request or --code is required".into()),
    };

    let backend = build_backend(&config.backend)?;
    let resolver = Resolver::new(backend, config.backend.device_role.clone());
    let resp = invoke::invoke(&resolver, &event).await?;
    let out = serde_json::to_string_pretty(&resp).map_err(|e| e.to_string())?;
    println!("{out}");
    Ok(())
}

async fn run_server(config_path: Option<&str>) -> Result<(), String> {
    let config = Config::load(config_path)?;
    init_tracing(&config);

    info!("devlink-server v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    if config.auth.api_key == "change-me" {
        warn!("Using default host key, set DEVLINK_API_KEY or update config");
    }

    let backend = build_backend(&config.backend)?;
    info!("Backend: {}", backend.kind());

    let listen = config.server.listen.clone();
    let app = devlink_server::router(AppState::new(config, backend));

    let listener = TcpListener::bind(&listen)
        .await
        .map_err(|e| format!("Failed to bind {listen}: {e}"))?;

    info!("Server ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("Server error: {e}"))?;

    info!("Goodbye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                error!("Failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
