// FlowSwap LP node binary.

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

mod api;
mod context;

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use flowswap_core::LpConfig;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "FlowSwap liquidity-provider node", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "flowswap.toml")]
    config: String,

    /// Bind address for the API server
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn load_config(args: &Args) -> anyhow::Result<LpConfig> {
    let mut cfg: LpConfig = config::Config::builder()
        .add_source(config::File::with_name(&args.config).required(false))
        .build()?
        .try_deserialize()?;

    // Environment overrides.
    if let Ok(v) = std::env::var("LP_ID") {
        cfg.identity.lp_id = v;
    }
    if let Ok(v) = std::env::var("LP_NAME") {
        cfg.identity.lp_name = v;
    }
    if let Ok(v) = std::env::var("LP_FLOWSWAP_DB") {
        cfg.store.db_path = v.into();
    }
    cfg.validate()?;
    Ok(cfg)
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let args = Args::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if args.debug { "debug" } else { "info" })
    });
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    let port = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8700u16);

    info!(lp_id = %config.identity.lp_id, lp_name = %config.identity.lp_name, "starting flowswap node");

    let ctx = match context::AppContext::start(config).await {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => {
            error!("failed to start node: {e:#}");
            std::process::exit(1);
        }
    };

    let server = api::serve(ctx.clone(), &args.bind, port);
    let result = tokio::select! {
        r = server => r,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received");
            Ok(())
        }
    };

    match Arc::try_unwrap(ctx) {
        Ok(ctx) => ctx.shutdown().await,
        Err(_) => info!("context still shared at exit; skipping drain"),
    }
    result
}
