//! # devlink
//!
//! Device agent for a GraphQL backend-as-a-service workspace. One invocation
//! runs one device function and exits.
//!
//! ## Architecture
//!
//! ```text
//! main.rs       entry point, logging, config loading, function dispatch
//! config.rs     CLI arguments, JSON file / env-var configuration loading
//! storage.rs    JSON-file credential store (device id + API token)
//! client.rs     GraphQL HTTP client, bearer auth from the credential store
//! functions.rs  registerDevice, sendActivity, readActivity, unregister, status
//! ```
//!
//! ## Output
//!
//! Function results go to stdout. Logs and errors go to stderr. A failed
//! function exits with status 1; a configuration error also exits with 1;
//! bad arguments exit with 2 (clap's default).

mod client;
mod config;
mod functions;
mod storage;

use clap::Parser;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use client::GraphqlClient;
use config::{Cli, Function, ResolvedConfig};
use functions::FunctionError;
use storage::CredentialStore;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let resolved = match config::load_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("devlink: configuration error: {}", e);
            std::process::exit(1);
        }
    };

    debug!(function = ?cli.function, "running");
    match run(resolved, cli.function).await {
        Ok(output) => println!("{}", output),
        Err(e) => {
            if let FunctionError::Client(ce) = &e {
                if let Some(code) = ce.graphql_code() {
                    debug!(code, "backend error code");
                }
            }
            eprintln!("devlink: {}", e);
            std::process::exit(1);
        }
    }
}

/// Invoke one function and render its result for stdout.
///
/// `status` and `unregister` only touch the credential store; the other
/// functions need an endpoint.
async fn run(config: ResolvedConfig, function: Function) -> Result<String, FunctionError> {
    let store = CredentialStore::new(config.credentials_path);
    match function {
        Function::Unregister => functions::unregister(&store),
        Function::Status => {
            let status = functions::status(&store)?;
            Ok(to_pretty_json(&status))
        }
        Function::RegisterDevice { code } => {
            let client = connect(config.endpoint, store)?;
            functions::register_device(&client, &code).await
        }
        Function::SendActivity { value } => {
            let client = connect(config.endpoint, store)?;
            functions::send_activity(&client, &value).await
        }
        Function::ReadActivity { .. } => {
            let client = connect(config.endpoint, store)?;
            let entries = functions::read_activity(&client).await?;
            Ok(to_pretty_json(&entries))
        }
    }
}

fn connect(endpoint: Option<String>, store: CredentialStore) -> Result<GraphqlClient, FunctionError> {
    let endpoint = endpoint.ok_or(FunctionError::NoEndpoint)?;
    let client = GraphqlClient::new(endpoint, store)?;
    debug!(endpoint = client.endpoint(), "client ready");
    Ok(client)
}

fn to_pretty_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("<unserializable: {e}>"))
}
