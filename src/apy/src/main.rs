use anyhow::{Context, Result, bail};
use apy_config::{FileConfig, StoreCfg, load_config};
use apy_core::{Endpoint, HttpForwarder, Pipeline, RateLimiter, Registry, SystemClock};
use apy_crypto::{JwtAuthority, random_alphanumeric};
use apy_gateway::Gateway;
use apy_memory::{Memory, Store};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(version, about = "Apy: dynamic API gateway with per-endpoint rate limiting, auth and caching")]
struct Args {
    /// Path to config file (yaml/json/toml)
    #[arg(short, long, default_value = "./apy.yaml")]
    config: String,
    /// Bind address, overrides config and APY_HOST
    #[arg(long)]
    host: Option<String>,
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    // Config loading warns before the configured subscriber exists.
    let file =
        tracing::subscriber::with_default(apy_tracing::bootstrap_subscriber(), || resolve_config(&args))?;

    let service_name = if file.tracing.service_name.is_empty() {
        file.gateway.name.clone()
    } else {
        file.tracing.service_name.clone()
    };
    let _tracing = apy_tracing::init(
        &service_name,
        Some(file.tracing.otlp_endpoint.as_str()),
        &file.logging.level,
        &file.logging.format,
    )?;
    info!("Apy Gateway starting with args: {:?}", args);

    // store + registry
    let store = open_store(&file.store).await?;
    info!(engine = %file.store.engine, "store opened");
    let registry = Arc::new(Registry::new(
        store,
        Duration::from_millis(file.limits.persist_timeout_ms),
    ));
    if let Err(e) = registry.hydrate().await {
        warn!(error = %e, "could not list persisted endpoints, starting empty");
    }
    for endpoint in startup_endpoints(&file) {
        // Persisted state (counters, cache) wins over the config copy.
        if registry.lookup(&endpoint.path, &endpoint.method).is_ok() {
            continue;
        }
        registry.register(endpoint).await;
    }
    info!(endpoints = registry.len(), "registry ready");

    // auth
    let secret = if file.auth.secret.is_empty() {
        warn!("no signing secret configured, generated one; issued tokens will not survive a restart");
        random_alphanumeric(48)
    } else {
        file.auth.secret.clone()
    };
    let tokens = Arc::new(JwtAuthority::new(&secret, file.auth.token_ttl_secs));

    let upstream = Arc::new(
        HttpForwarder::new(
            Duration::from_millis(file.limits.upstream_timeout_ms),
            &apy_gateway::server_name(),
        )
        .context("build upstream client")?,
    );
    let limiter = RateLimiter::new(
        Duration::from_secs(file.limits.window_secs),
        Arc::new(SystemClock),
    );
    let pipeline = Arc::new(Pipeline::new(registry, limiter, tokens.clone(), upstream));
    let gw = Arc::new(Gateway::new(pipeline, tokens)?);

    let addr: SocketAddr = format!("{}:{}", file.gateway.host, file.gateway.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", file.gateway.host, file.gateway.port))?;
    let server_task = tokio::spawn(gw.serve(addr));

    tokio::select! {
        res = server_task => match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(e) => return Err(e.into()),
        },
        _ = signal::ctrl_c() => { info!("Shutting down") }
    }

    Ok(())
}

fn resolve_config(args: &Args) -> Result<FileConfig> {
    let mut file = load_config(&args.config)?;
    file.apply_env();
    if let Some(host) = &args.host {
        file.gateway.host = host.clone();
    }
    if let Some(port) = args.port {
        file.gateway.port = port;
    }
    Ok(file)
}

/// Configured endpoints that pass the same rules as `POST /add`; the rest
/// are logged and skipped.
fn startup_endpoints(file: &FileConfig) -> Vec<Endpoint> {
    file.endpoints
        .iter()
        .map(|e| e.clone().normalized())
        .filter(|e| match e.validate() {
            Ok(()) => true,
            Err(errors) => {
                warn!(name = %e.name, route = %e.route_id(), ?errors, "skipping invalid configured endpoint");
                false
            }
        })
        .collect()
}

async fn open_store(cfg: &StoreCfg) -> Result<Arc<dyn Store>> {
    match cfg.engine.as_str() {
        "memory" => Ok(Arc::new(Memory::memory())),
        "lmdb" => Ok(Arc::new(
            Memory::open_lmdb(&cfg.path).with_context(|| format!("open lmdb at {}", cfg.path))?,
        )),
        #[cfg(feature = "redis")]
        "redis" => Ok(Arc::new(
            Memory::connect_redis(&cfg.url)
                .await
                .context("connect redis store")?,
        )),
        #[cfg(not(feature = "redis"))]
        "redis" => bail!("redis store requested but apy was built without the `redis` feature"),
        other => bail!("unknown store engine: {other}"),
    }
}
