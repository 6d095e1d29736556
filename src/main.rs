//! model-router CLI - Route prompts across AI providers

use anyhow::Result;
use clap::{Parser, Subcommand};
use model_router::{
    catalog::Capability,
    config::{Config, ConfigError},
    health::{probe_once, HealthRegistry},
    orchestrator::Orchestrator,
    router::{OperationKind, RoutingContext, RoutingRequest},
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::level_filters::LevelFilter;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "model-router")]
#[command(about = "Route AI requests to the cheapest healthy model")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbosity level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Config file (default: platform config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Route a single prompt and print the response
    Route {
        /// Prompt text
        #[arg(short, long)]
        input: String,

        /// Operation kind (chat, completion, analysis, creative, code, reasoning, tool-call)
        #[arg(short, long, default_value = "chat")]
        operation: OperationKind,

        /// User id; user-scoped responses are never written to the cache
        #[arg(short, long)]
        user: Option<String>,

        /// Maximum USD cost of the reference workload
        #[arg(short, long)]
        budget: Option<f64>,

        /// Preferred provider
        #[arg(short, long)]
        provider: Option<String>,

        /// Preferred model id
        #[arg(short, long)]
        model: Option<String>,

        /// Required capabilities (comma-separated)
        #[arg(long, value_delimiter = ',')]
        capabilities: Vec<Capability>,

        /// Print the full response as JSON
        #[arg(long)]
        json: bool,

        /// Print router and cache metrics afterwards
        #[arg(long)]
        stats: bool,
    },

    /// List catalog models
    Models {
        /// Only models from this provider
        #[arg(short, long)]
        provider: Option<String>,

        /// Include deprecated models
        #[arg(long)]
        all: bool,
    },

    /// Probe every model once and print health
    Health {
        /// Per-probe timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Manage configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Initialize configuration file with defaults
    Init {
        /// Overwrite existing config
        #[arg(long)]
        force: bool,
    },

    /// Show current configuration
    Show {
        /// Show only one section: router, cache, breaker, retry, health,
        /// providers, rules or models
        #[arg(short, long)]
        section: Option<String>,
    },

    /// Show configuration file path
    Path,

    /// Validate configuration
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // RUST_LOG, when set, takes precedence over --log-level
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::default().add_directive(LevelFilter::from_level(log_level).into())
    });

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = cli.config.unwrap_or_else(Config::default_path);

    match cli.command {
        Commands::Route {
            input,
            operation,
            user,
            budget,
            provider,
            model,
            capabilities,
            json,
            stats,
        } => {
            let context = RoutingContext {
                user_id: user,
                budget,
                required_capabilities: capabilities,
                preferred_provider: provider,
                preferred_model: model,
                ..RoutingContext::default()
            };
            let request = RoutingRequest::new(input, operation).with_context(context);
            run_route(&config_path, request, json, stats).await?;
        }
        Commands::Models { provider, all } => {
            list_models(&config_path, provider.as_deref(), all)?;
        }
        Commands::Health { timeout } => {
            check_health(&config_path, timeout).await?;
        }
        Commands::Config(cmd) => {
            run_config_command(&config_path, cmd)?;
        }
    }

    Ok(())
}

async fn run_route(
    config_path: &Path,
    request: RoutingRequest,
    json: bool,
    stats: bool,
) -> Result<()> {
    let config = Config::load_from(config_path.to_path_buf())?;
    let orchestrator = Orchestrator::from_config(&config)?;

    info!(operation = %request.operation, "Routing request");
    let result = orchestrator.router().route(request).await;

    match &result {
        Ok(response) if json => {
            println!("{}", serde_json::to_string_pretty(response)?);
        }
        Ok(response) => {
            println!("{}", response.content);
            println!("\n--- Routing ---");
            println!("Model: {} ({})", response.model_id, response.provider);
            println!("Cached: {}", response.cached);
            println!(
                "Tokens: {} in / {} out{}",
                response.tokens.input_tokens,
                response.tokens.output_tokens,
                if response.tokens.estimated { " (estimated)" } else { "" }
            );
            println!("Cost: ${:.6}", response.cost);
            println!("Latency: {}ms", response.latency_ms);
            println!("Retries: {}  Fallback: {}", response.retries, response.fallback_used);
            println!("\n{}", response.explanation);
        }
        Err(_) => {}
    }

    if stats {
        println!("\n{}", orchestrator.router().metrics());
        println!("{}", orchestrator.router().cache_metrics());
    }

    orchestrator.shutdown().await;
    result?;
    Ok(())
}

fn list_models(config_path: &Path, provider: Option<&str>, all: bool) -> Result<()> {
    let config = Config::load_from(config_path.to_path_buf())?;
    let catalog = config.catalog();
    let usable: Vec<&str> = config
        .providers
        .iter()
        .filter(|p| p.is_usable())
        .map(|p| p.name.as_str())
        .collect();

    println!(
        "{:<32} {:<10} {:>10} {:>10} {:>9} {:>3} {:>3}  capabilities",
        "model", "provider", "in/1k", "out/1k", "context", "spd", "qlt"
    );
    for model in catalog.models() {
        if provider.is_some_and(|p| p != model.provider) || (model.deprecated && !all) {
            continue;
        }
        let capabilities: Vec<String> = model.capabilities.iter().map(|c| c.to_string()).collect();
        println!(
            "{:<32} {:<10} {:>10.5} {:>10.5} {:>9} {:>3} {:>3}  {}{}{}",
            model.id,
            model.provider,
            model.pricing.input_per_1k,
            model.pricing.output_per_1k,
            model.context_window,
            model.speed,
            model.quality,
            capabilities.join(","),
            if model.deprecated { " [deprecated]" } else { "" },
            if usable.contains(&model.provider.as_str()) { "" } else { " [no key]" },
        );
    }

    Ok(())
}

async fn check_health(config_path: &Path, timeout: Option<u64>) -> Result<()> {
    let config = Config::load_from(config_path.to_path_buf())?;
    let catalog = config.catalog();
    let backends = config.backends();
    let registry = HealthRegistry::new(config.health_config());
    let timeout = Duration::from_secs(timeout.unwrap_or(config.health.probe_timeout_secs).max(1));

    println!("Probing {} models...", catalog.len());
    let report = probe_once(&registry, &catalog, &backends, timeout).await;

    for snapshot in registry.snapshot() {
        println!("{}", snapshot);
    }
    println!(
        "\nProbed: {}  Failed: {}  Skipped (no backend): {}",
        report.probed, report.failed, report.skipped
    );

    Ok(())
}

fn run_config_command(config_path: &Path, cmd: ConfigCommands) -> Result<()> {
    match cmd {
        ConfigCommands::Init { force } => config_init(config_path, force),
        ConfigCommands::Show { section } => config_show(config_path, section),
        ConfigCommands::Path => {
            config_path_info(config_path);
            Ok(())
        }
        ConfigCommands::Validate => config_validate(config_path),
    }
}

fn config_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        println!("Config file already exists at: {}", path.display());
        println!("Use --force to overwrite");
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, Config::example())?;

    println!("Configuration file created at: {}", path.display());
    println!();
    println!("Next steps:");
    println!("  1. Export at least one provider key:");
    println!("     export OPENAI_API_KEY=your_openai_key");
    println!("     export ANTHROPIC_API_KEY=your_anthropic_key");
    println!("     export GEMINI_API_KEY=your_gemini_key");
    println!();
    println!("  2. Check the setup:");
    println!("     model-router config validate");
    println!("     model-router health");

    Ok(())
}

fn config_show(path: &Path, section: Option<String>) -> Result<()> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()).into());
    }
    let mut config = Config::load_from(path.to_path_buf())?;

    // Mask API keys in display
    for provider in &mut config.providers {
        if provider.api_key.is_some() {
            provider.api_key = Some("***".to_string());
        }
    }

    let display = if let Some(sec) = section {
        match sec.to_lowercase().as_str() {
            "router" => toml::to_string_pretty(&config.router)?,
            "cache" => toml::to_string_pretty(&config.cache)?,
            "breaker" => toml::to_string_pretty(&config.breaker)?,
            "retry" => toml::to_string_pretty(&config.retry)?,
            "health" => toml::to_string_pretty(&config.health)?,
            "providers" => serde_json::to_string_pretty(&config.providers)?,
            "rules" => serde_json::to_string_pretty(&config.rules)?,
            "models" => serde_json::to_string_pretty(&config.models)?,
            _ => {
                println!("Unknown section: {}", sec);
                println!(
                    "Available: router, cache, breaker, retry, health, providers, rules, models"
                );
                return Ok(());
            }
        }
    } else {
        toml::to_string_pretty(&config)?
    };

    println!("{}", display);

    // Show environment variable status
    println!("\n--- Environment Variables ---");
    for provider in &config.providers {
        if let Some(var) = &provider.api_key_env {
            let state = if std::env::var(var).is_ok() { "set" } else { "not set" };
            println!("{}: {}", var, state);
        }
    }
    for var in ["MODEL_ROUTER_STRATEGY", "MODEL_ROUTER_FALLBACK_PROVIDERS"] {
        println!("{}: {}", var, std::env::var(var).unwrap_or_else(|_| "not set".to_string()));
    }

    Ok(())
}

fn config_path_info(path: &Path) {
    println!("{}", path.display());

    if path.exists() {
        println!("(file exists)");
    } else {
        println!("(file does not exist - run 'config init' to create)");
    }
}

fn config_validate(path: &Path) -> Result<()> {
    let config = Config::load_from(path.to_path_buf())?;

    match config.validate() {
        Ok(()) => {
            let usable = config.providers.iter().filter(|p| p.is_usable()).count();
            println!("Configuration is valid");
            println!("  Strategy: {}", config.router.strategy);
            println!("  Usable providers: {}/{}", usable, config.providers.len());
            println!("  Catalog models: {}", config.catalog().len());
            println!("  Routing rules: {}", config.rules.len());
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            Err(e.into())
        }
    }
}
