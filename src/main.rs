//! # cdp-runner
//!
//! Browser-automation test runner driving a local browser over the Chrome
//! DevTools Protocol. Tests are declarative JSON documents (url + hook /
//! step / cleanup sections); the engine executes them step by step,
//! captures evidence, persists results, and streams progress to
//! subscribers.
//!
//! The binary hosts the control surface:
//!
//! ```bash
//! cdp-runner gui --port 7800 --chrome-port 9222 --project-root ./project
//! ```
//!
//! Exit codes: 0 success, 1 startup failure, 2 unknown command.

mod browser;
mod context;
mod debug;
mod errors;
mod events;
mod evidence;
mod executors;
mod protocol;
mod runner;
mod server;
mod store;
mod telemetry;
mod validation;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, Level};

use browser::UnattachedBrowser;
use events::EventBus;
use server::AppState;
use store::TestStore;
use telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "cdp-runner")]
#[command(about = "Declarative browser-automation test runner over CDP", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Starts the host exposing the control surface (HTTP + WebSocket).
    Gui {
        /// Port for the control surface.
        #[arg(long, default_value_t = 7800)]
        port: u16,

        /// DevTools port of the browser to drive.
        #[arg(long, default_value_t = 9222)]
        chrome_port: u16,

        /// Directory holding tests/ and results/.
        #[arg(long, default_value = ".")]
        project_root: PathBuf,

        /// Export traces to an OTLP collector.
        #[arg(long, default_value_t = false)]
        otel: bool,

        /// OTLP endpoint override. Falls back to
        /// OTEL_EXPORTER_OTLP_ENDPOINT, then localhost:4317.
        #[arg(long)]
        otel_endpoint: Option<String>,

        /// Only errors on stderr.
        #[arg(long, short = 's', default_value_t = false)]
        silent: bool,

        /// Debug-level logging.
        #[arg(long, short = 'v', default_value_t = false)]
        verbose: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Gui {
            port,
            chrome_port,
            project_root,
            otel,
            otel_endpoint,
            silent,
            verbose,
        } => {
            let mut telemetry_config = TelemetryConfig::from_env();
            telemetry_config.log_level = if silent {
                Level::ERROR
            } else if verbose {
                Level::DEBUG
            } else {
                Level::INFO
            };
            if otel {
                if let Some(endpoint) = otel_endpoint {
                    telemetry_config.otlp_endpoint = Some(endpoint);
                } else if telemetry_config.otlp_endpoint.is_none() {
                    telemetry_config.otlp_endpoint = Some("http://localhost:4317".to_string());
                }
            }
            if let Err(e) = init_telemetry(telemetry_config) {
                eprintln!("Warning: failed to initialize telemetry: {}", e);
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                    .try_init();
            }

            info!(
                port,
                chrome_port,
                project_root = %project_root.display(),
                "starting control surface host"
            );

            let store = Arc::new(TestStore::new(project_root));
            let bus = EventBus::new();
            let client = Arc::new(UnattachedBrowser::new(chrome_port));
            let state = AppState::new(client, store, bus);

            let outcome = server::serve(state, port).await;
            shutdown_telemetry();
            if let Err(e) = outcome {
                error!(error = %e, "startup failed");
                std::process::exit(1);
            }
        }
    }
}
