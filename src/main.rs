//! SmartRent gateway - service registry and load-balanced edge proxy

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use smartrent_gateway::{config::Args, server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("smartrent_gateway={},info", args.log_level).into());
    let registry = tracing_subscriber::registry().with(filter);
    if args.log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let routes = match args.load_routes() {
        Ok(routes) => routes,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    info!("======================================");
    info!("  SmartRent Gateway");
    info!("======================================");
    info!("Node ID: {}", args.node_id);
    info!("Proxy listen: {}", args.listen);
    info!("Registry listen: {}", args.registry_listen);
    info!("Lease: {}s", args.lease_duration_secs);
    info!(
        "Sweep every {}ms, rebuild every {}ms (staleness bound {}ms)",
        args.sweep_interval_ms,
        args.rebuild_interval_ms,
        args.staleness_bound().as_millis()
    );
    match args.self_preservation_threshold {
        Some(threshold) => info!("Self-preservation: {:.0}%", threshold * 100.0),
        None => info!("Self-preservation: disabled"),
    }
    info!("Load balancing: {}", args.lb_policy);
    info!("Routes: {}", routes.len());
    for route in &routes {
        info!(
            "  {} -> {} (strip: {}, timeout: {}ms, retries: {})",
            route.prefix,
            route.service,
            route.strip_prefix,
            route.timeout.as_millis(),
            route.retries
        );
    }
    info!("======================================");

    server::run(args, routes).await?;
    Ok(())
}
