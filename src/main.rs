//! RoostDB server binary.
//!
//! Compiles the schema, loads the token table, and serves the REST/SSE
//! interface until interrupted. Startup failures (schema compile failure,
//! unreadable token file, port in use) exit non-zero; an interrupt signal
//! triggers a graceful drain bounded at five seconds.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use roostdb::api::{self, ServerContext};
use roostdb::auth::TokenTable;
use roostdb::schema::SchemaValidator;

/// Hierarchical in-memory NoSQL document database with a REST/SSE interface.
#[derive(Parser, Debug)]
#[command(name = "roostdb", version, about)]
struct Args {
    /// Port for the server to listen on.
    #[arg(short = 'p', long = "port", default_value_t = 3318)]
    port: u16,

    /// File containing the JSON schema that validates document writes.
    #[arg(short = 's', long = "schema")]
    schema: PathBuf,

    /// File containing a JSON object mapping usernames to tokens.
    #[arg(short = 't', long = "tokens")]
    tokens: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let validator = match SchemaValidator::from_file(&args.schema) {
        Ok(validator) => validator,
        Err(err) => {
            error!(schema = %args.schema.display(), error = %err, "schema file not usable");
            process::exit(1);
        }
    };

    let tokens = match TokenTable::from_file(&args.tokens) {
        Ok(tokens) => tokens,
        Err(err) => {
            error!(tokens = %args.tokens.display(), error = %err, "token file not usable");
            process::exit(1);
        }
    };

    let ctx = Arc::new(ServerContext::new(validator, tokens));
    let app = api::router(ctx);

    let listener = match TcpListener::bind(("0.0.0.0", args.port)).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(port = args.port, error = %err, "failed to bind");
            process::exit(1);
        }
    };
    info!(port = args.port, "listening");

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %err, "server closed");
        process::exit(1);
    }
    info!("server closed");
}

/// Resolves on SIGINT or SIGTERM, then bounds the graceful drain at five
/// seconds before forcing exit.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutting down");

    tokio::spawn(async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        process::exit(0);
    });
}
