use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use upscale_proxy::config::{parse_host_list, ProxyConfig, UpscalerConfig, DEFAULT_LOG_FILTER};
use upscale_proxy::engine::pipeline::Pipeline;
use upscale_proxy::server::handler::{AppState, ProxyServer};

/// Serve `/api/{W}x{H}/{host}/{path}`: fetch, upscale, resize and cache images.
#[derive(Parser, Debug)]
#[command(name = "upscale-proxy", version, about, long_about = None)]
struct Cli {
    /// Port to listen on.
    #[arg(long, env = "APP_PORT", default_value_t = 8080)]
    port: u16,

    /// Root of the image cache.
    #[arg(long, env = "APP_CACHE_DIR", default_value = "./var")]
    cache_dir: PathBuf,

    /// Comma-separated hosts images may be fetched from.
    #[arg(long, env = "APP_ALLOWED_HOSTS", default_value = "")]
    allowed_hosts: String,

    /// Scheme used for upstream requests (http or https).
    #[arg(long, env = "APP_UPSTREAM_SCHEME", default_value = "https")]
    upstream_scheme: String,

    /// Super-resolution executable.
    #[arg(long, env = "APP_UPSCALER", default_value = "./lib/realesr/realesrgan-ncnn-vulkan")]
    upscaler: PathBuf,

    /// Model passed to the upscaler.
    #[arg(long, env = "APP_UPSCALER_MODEL", default_value = "realesrgan-x4plus")]
    upscaler_model: String,

    /// Upscale factor.
    #[arg(long, env = "APP_UPSCALE_FACTOR", default_value_t = 4)]
    upscale_factor: u32,

    /// Resize executable (ImageMagick `convert` compatible).
    #[arg(long, env = "APP_RESIZER", default_value = "convert")]
    resizer: PathBuf,

    #[arg(long, env = "APP_FETCH_TIMEOUT_SECS", default_value_t = 30)]
    fetch_timeout_secs: u64,

    #[arg(long, env = "APP_TRANSFORM_TIMEOUT_SECS", default_value_t = 300)]
    transform_timeout_secs: u64,

    /// Largest accepted width or height.
    #[arg(long, env = "APP_MAX_DIMENSION", default_value_t = 8192)]
    max_dimension: u32,
}

impl Cli {
    fn into_config(self) -> ProxyConfig {
        ProxyConfig {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], self.port)),
            cache_dir: self.cache_dir,
            allowed_hosts: parse_host_list(&self.allowed_hosts),
            upstream_scheme: self.upstream_scheme,
            upscaler: UpscalerConfig {
                program: self.upscaler,
                model: self.upscaler_model,
                factor: self.upscale_factor,
                ..UpscalerConfig::default()
            },
            resizer: self.resizer,
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            transform_timeout: Duration::from_secs(self.transform_timeout_secs),
            max_dimension: self.max_dimension,
        }
    }
}

fn init_tracing() {
    // RUST_LOG wins, then LOG_LEVEL.
    let filter = EnvFilter::try_from_default_env()
        .ok()
        .or_else(|| std::env::var("LOG_LEVEL").ok().and_then(|v| log_level_filter(&v)))
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// `LOG_LEVEL` is either a numeric level (`-4` debug, `0` info, `4` warn,
/// `8` error, anything in between rounds up) or an `EnvFilter` directive.
fn log_level_filter(value: &str) -> Option<EnvFilter> {
    let value = value.trim();
    match value.parse::<i32>() {
        Ok(n) => Some(EnvFilter::default().add_directive(numeric_level(n).into())),
        Err(_) => EnvFilter::try_new(value).ok(),
    }
}

fn numeric_level(n: i32) -> LevelFilter {
    match n {
        i32::MIN..=-4 => LevelFilter::DEBUG,
        -3..=0 => LevelFilter::INFO,
        1..=4 => LevelFilter::WARN,
        _ => LevelFilter::ERROR,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Settings usually live in a `.env` next to the binary; a missing file is fine.
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = Cli::parse().into_config();
    config.validate()?;

    tokio::fs::create_dir_all(&config.cache_dir)
        .await
        .with_context(|| format!("creating cache dir {}", config.cache_dir.display()))?;

    info!(
        "starting: cache_dir={} allowed_hosts={:?}",
        config.cache_dir.display(),
        config.allowed_hosts
    );

    let pipeline = Pipeline::new(&config)?;
    let server = ProxyServer::start(config.listen_addr, AppState::new(pipeline, config)).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.shutdown().await;
    Ok(())
}
