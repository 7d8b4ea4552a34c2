mod audit;
mod banner;
mod config;
mod detector;
mod logger;
mod pipeline;
mod proxy;
mod security;
mod server;
mod sink;
mod storage;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "intercept-gateway")]
#[command(about = "Transparent WAF gateway that extracts and audits uploaded files", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Start {
        /// Path to gateway.toml (defaults to the executable's directory)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Listen address, e.g. 0.0.0.0:8080 or :8080
        #[arg(short, long)]
        listen: Option<String>,

        /// Backend origin URL
        #[arg(short, long)]
        backend: Option<String>,

        /// Signature database path
        #[arg(short, long)]
        rules: Option<String>,

        /// Debug-level logging unless RUST_LOG is set
        #[arg(short, long)]
        verbose: bool,
    },
    /// Validate configuration and rules without serving
    Check {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn get_env_path() -> PathBuf {
    config::base_dir().join(".env")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    banner::print_banner();

    let env_path = get_env_path();
    let env_loaded = if env_path.exists() {
        Some(dotenvy::from_path(&env_path))
    } else {
        None
    };

    let (config_path, verbose) = match &cli.command {
        Commands::Start { config, verbose, .. } => (config.clone(), *verbose),
        Commands::Check { config } => (config.clone(), false),
    };

    let mut config = match config::load_config(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            banner::print_error(&format!("Failed to load configuration: {}", e));
            return Err(e.into());
        }
    };

    let _log_guard = logger::init_logger(&config::base_dir(), &config.logging.debug_log, verbose);

    match env_loaded {
        Some(Ok(_)) => tracing::info!("Loaded .env from: {}", env_path.display()),
        Some(Err(e)) => tracing::error!("Failed to load .env from {}: {}", env_path.display(), e),
        None => tracing::info!("No .env found at: {}", env_path.display()),
    }

    match cli.command {
        Commands::Start {
            listen,
            backend,
            rules,
            ..
        } => {
            config.apply_overrides(listen, backend, rules);
            if let Err(e) = config.validate() {
                banner::print_error(&format!("Invalid configuration: {}", e));
                return Err(e.into());
            }

            let shutdown_token = tokio_util::sync::CancellationToken::new();
            let t = shutdown_token.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    t.cancel();
                }
            });

            banner::print_step("Starting gateway...");
            if let Err(e) = server::start_server(config, shutdown_token).await {
                banner::print_error(&format!("Gateway failed: {:#}", e));
                return Err(e);
            }
        }
        Commands::Check { .. } => {
            banner::print_step("Checking configuration...");
            if let Err(e) = config.validate() {
                banner::print_error(&format!("Invalid configuration: {}", e));
                return Err(e.into());
            }
            server::build_interceptor(&config).await?;
            banner::print_success(&format!(
                "Configuration OK: {} -> {}",
                config.listen_addr()?,
                config.backend_url()?
            ));
        }
    }

    Ok(())
}
