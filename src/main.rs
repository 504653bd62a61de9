use anyhow::Context;
use clap::{Parser, Subcommand};
use llm_resilience::cli::AppConfig;
use llm_resilience::resilience::orchestrator::{InvokeError, InvokeOptions};
use llm_resilience::resilience::{BreakerRecord, CircuitState};
use llm_resilience::server::{self, AppState};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "llmr")]
#[command(about = "Retry, circuit breaking and model fallback for LLM calls", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (defaults to ~/.llm-resilience/config.toml)
    #[arg(short, long, env = "LLMR_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Send one request through the fallback chain
    Invoke {
        /// Endpoint (model) to try, in order; repeat for fallbacks
        #[arg(short, long = "endpoint", required = true)]
        endpoints: Vec<String>,
        /// JSON request body
        #[arg(short, long)]
        request: PathBuf,
        /// Overall deadline in milliseconds
        #[arg(long)]
        deadline_ms: Option<u64>,
    },
    /// Show circuit breaker state
    Status {
        /// Only this endpoint
        endpoint: Option<String>,
    },
    /// Force an endpoint's circuit closed
    Reset { endpoint: String },
    /// Show recent classified errors
    Errors {
        #[arg(short, long)]
        endpoint: Option<String>,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_record(record: &BreakerRecord) {
    let icon = match record.state {
        CircuitState::Closed => "✅",
        CircuitState::Open => "⛔",
        CircuitState::HalfOpen => "🟡",
    };
    println!(
        "{} {:<32} {:<10} failures {}/{}",
        icon, record.endpoint, record.state.as_str(), record.consecutive_failures, record.failure_threshold
    );
    if let Some(opened_at) = record.opened_at {
        println!("   opened at {}", opened_at.to_rfc3339());
    }
    if let Some(last_failure) = record.last_failure_at {
        println!("   last failure {}", last_failure.to_rfc3339());
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Get config path (use default if not specified)
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => AppConfig::default_path().unwrap_or_else(|_| PathBuf::from("config.toml")),
    };

    let config = AppConfig::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;
    init_tracing(&config);

    match cli.command {
        Commands::Serve { port } => {
            let mut config = config;

            // Override port if specified
            if let Some(port) = port {
                config.server.port = port;
            }

            println!("🛡️  LLM Resilience v{}", env!("CARGO_PKG_VERSION"));
            println!("📡 Starting server on {}:{}", config.server.host, config.server.port);
            println!("💾 Store: {:?} ({})", config.store.kind, config.store.resolved_path().display());
            println!();
            println!("Press Ctrl+C to stop");

            server::start_server(config).await?;
        }
        Commands::Invoke {
            endpoints,
            request,
            deadline_ms,
        } => {
            let body = std::fs::read_to_string(&request)
                .with_context(|| format!("Failed to read {}", request.display()))?;
            let request: serde_json::Value = serde_json::from_str(&body)
                .with_context(|| format!("{} is not valid JSON", request.display()))?;

            let state = AppState::from_config(&config).await?;
            let mut options = InvokeOptions::default();
            if let Some(ms) = deadline_ms {
                options = options.with_deadline(Duration::from_millis(ms));
            }

            let result = state.orchestrator.invoke(&endpoints, &request, options).await;
            state.flush().await;

            match result {
                Ok(response) => println!("{}", serde_json::to_string_pretty(&response)?),
                Err(InvokeError::Terminal(terminal)) => {
                    eprintln!("❌ All endpoints failed:");
                    for failure in &terminal.failures {
                        eprintln!("   • {}", failure);
                    }
                    anyhow::bail!("invocation failed");
                }
                Err(e) => anyhow::bail!("❌ {}", e),
            }
        }
        Commands::Status { endpoint } => {
            let state = AppState::from_config(&config).await?;
            match endpoint {
                Some(endpoint) => print_record(&state.breaker().snapshot(&endpoint).await?),
                None => {
                    let records = state.breaker().list().await?;
                    if records.is_empty() {
                        println!("No breaker state recorded yet");
                    }
                    for record in &records {
                        print_record(record);
                    }
                }
            }
        }
        Commands::Reset { endpoint } => {
            let state = AppState::from_config(&config).await?;
            let record = state.breaker().reset(&endpoint).await?;
            println!("✅ Circuit for '{}' reset", endpoint);
            print_record(&record);
        }
        Commands::Errors { endpoint, limit } => {
            let state = AppState::from_config(&config).await?;
            let entries = state.errors.recent(endpoint.as_deref(), limit).await?;
            if entries.is_empty() {
                println!("No errors logged");
            }
            for entry in entries {
                println!(
                    "{} {:<24} {:<12} {:<24} retry={} {}",
                    entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    entry.endpoint,
                    entry.severity.as_str(),
                    entry.error_kind,
                    entry.will_retry,
                    entry.message
                );
            }
        }
    }

    Ok(())
}
