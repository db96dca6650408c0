//! sicky CLI

mod advertise;
mod signal;

use anyhow::Result;
use clap::{Parser, Subcommand};
use sicky_config::{load_config, Config};
use sicky_registry::{Pool, Reconciler, Registry, RegistryOptions};
use sicky_resolver::{ManualResolver, ResolverBridge};
use signal::SignalHandler;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "sicky")]
#[command(about = "sicky service-discovery runtime", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run discovery: watch the configured backends and advertise this process
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,

        /// Log level (trace, debug, info, warn, error)
        #[arg(short, long)]
        log_level: Option<String>,

        /// Follow a service's addresses and log every change
        #[arg(long = "resolve", value_name = "SERVICE")]
        resolve: Vec<String>,
    },

    /// Validate configuration file
    Validate {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            log_level,
            resolve,
        } => {
            let path = config;
            let config = load_config(&path)?;

            let level = log_level.unwrap_or_else(|| config.observability.log_level.clone());
            init_tracing(&level, config.observability.json_logs)?;

            tracing::info!("Starting sicky");
            tracing::info!("Config file: {}", path.display());
            tracing::info!(
                services = config.services.len(),
                backends = config.registries.enabled_count(),
                "Configuration loaded"
            );

            serve(config, resolve).await
        }

        Commands::Validate { config } => {
            tracing_subscriber::fmt().with_target(false).init();

            tracing::info!("Validating configuration: {}", config.display());

            match load_config(&config) {
                Ok(cfg) => {
                    tracing::info!("✓ Configuration is valid");
                    tracing::info!("  Consul: {}", enabled(cfg.registries.consul.is_some()));
                    tracing::info!("  mDNS: {}", enabled(cfg.registries.mdns.is_some()));
                    tracing::info!("  Redis: {}", enabled(cfg.registries.redis.is_some()));
                    tracing::info!("  Services: {}", cfg.services.len());
                    tracing::info!("  Reconcile interval: {}s", cfg.reconcile.interval_secs);
                    match cfg.advertise {
                        Some(ref adv) => tracing::info!(
                            "  Advertise: {} at {} ({} servers, {} topics)",
                            adv.service,
                            adv.address,
                            adv.servers.len(),
                            adv.topics.len()
                        ),
                        None => tracing::info!("  Advertise: none"),
                    }
                    Ok(())
                }
                Err(e) => {
                    tracing::error!("✗ Configuration validation failed: {}", e);
                    std::process::exit(1);
                }
            }
        }

        Commands::Version => {
            println!("sicky service-discovery runtime");
            println!("Version: {}", env!("CARGO_PKG_VERSION"));
            println!("Rust version: {}", env!("CARGO_PKG_RUST_VERSION"));
            Ok(())
        }
    }
}

fn enabled(on: bool) -> &'static str {
    if on {
        "enabled"
    } else {
        "disabled"
    }
}

async fn serve(config: Config, resolve: Vec<String>) -> Result<()> {
    let token = CancellationToken::new();
    let pool = Pool::new();

    advertise::declare_services(&pool, &config);

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let instance = match config.advertise {
        Some(ref adv) => {
            let instance = advertise::build_instance(adv).await?;
            tracing::info!(
                service = %instance.service,
                instance = %instance.id,
                servers = instance.servers.len(),
                "Advertising this process"
            );
            Some(instance)
        }
        None => None,
    };

    let registries = connect_backends(&config).await;
    advertise::start_backends(&pool, registries, instance.as_ref()).await;

    if let Some(ref instance) = instance {
        tasks.extend(advertise::spawn_refresh(
            pool.clone(),
            instance.clone(),
            token.child_token(),
        ));
    }

    tasks.extend(Reconciler::new(pool.clone(), config.reconcile.interval()).spawn(token.child_token()));

    for service in resolve {
        let resolver = Arc::new(ManualResolver::new());
        tasks.push(log_resolver_updates(service.clone(), &resolver, token.child_token()));
        tasks.push(ResolverBridge::spawn(
            pool.clone(),
            service,
            resolver,
            token.child_token(),
        ));
    }

    tracing::info!("Discovery running");
    SignalHandler::new(token.clone()).run().await;

    tracing::info!("Shutting down");
    token.cancel();

    if let Some(ref instance) = instance {
        advertise::withdraw(&pool, instance).await;
    }
    for registry in pool.registries() {
        registry.stop();
    }
    futures::future::join_all(tasks).await;

    tracing::info!("Stopped");
    Ok(())
}

/// Construct every configured backend; a backend that fails is logged and skipped
async fn connect_backends(config: &Config) -> Vec<Arc<dyn Registry>> {
    let mut registries: Vec<Arc<dyn Registry>> = Vec::new();

    if let Some(ref consul) = config.registries.consul {
        match sicky_registry::ConsulRegistry::connect(consul, RegistryOptions::new("consul")).await {
            Ok(registry) => registries.push(Arc::new(registry)),
            Err(e) => tracing::error!(error = %e, "Skipping Consul backend"),
        }
    }

    if let Some(ref mdns) = config.registries.mdns {
        match sicky_registry::MdnsRegistry::new(mdns, RegistryOptions::new("mdns")) {
            Ok(registry) => registries.push(Arc::new(registry)),
            Err(e) => tracing::error!(error = %e, "Skipping mDNS backend"),
        }
    }

    if let Some(ref redis) = config.registries.redis {
        match sicky_registry::RedisRegistry::connect(redis, RegistryOptions::new("redis")).await {
            Ok(registry) => registries.push(Arc::new(registry)),
            Err(e) => tracing::error!(error = %e, "Skipping Redis backend"),
        }
    }

    registries
}

fn log_resolver_updates(
    service: String,
    resolver: &ManualResolver,
    token: CancellationToken,
) -> JoinHandle<()> {
    let mut updates = resolver.subscribe();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let addresses: Vec<String> =
                        updates.borrow_and_update().iter().map(|a| a.to_string()).collect();
                    tracing::info!(service = %service, addresses = ?addresses, "Resolved addresses changed");
                }
            }
        }
    })
}

fn init_tracing(level: &str, json: bool) -> Result<()> {
    let filter = match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(filter.into())
        // mdns-sd logs multicast failures on tunnel interfaces at ERROR
        .add_directive("mdns_sd=warn".parse()?);

    let registry = tracing_subscriber::registry().with(env_filter);

    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(false))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_level(true),
            )
            .init();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_serve() {
        let cli = Cli::try_parse_from([
            "sicky", "serve", "-c", "sicky.yaml", "--resolve", "orders", "--resolve", "billing",
        ])
        .unwrap();

        match cli.command {
            Commands::Serve {
                config,
                log_level,
                resolve,
            } => {
                assert_eq!(config, PathBuf::from("sicky.yaml"));
                assert!(log_level.is_none());
                assert_eq!(resolve, vec!["orders", "billing"]);
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_cli_validate_default_path() {
        let cli = Cli::try_parse_from(["sicky", "validate"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Validate { config } if config == PathBuf::from("config.yaml")
        ));
    }

    #[tokio::test]
    async fn test_no_backends_configured() {
        let config = Config::default();
        assert!(connect_backends(&config).await.is_empty());
    }
}
