//! wxdl - local interception proxy for the WeChat Channels web client.
//!
//! Point the browser at the proxy, install the generated root CA, and browse
//! Channels as usual. Profiles land in `<output-dir>/profiles`, page and
//! script snapshots in `html/` and `js/`.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use directories::ProjectDirs;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use wxdl_core::ASSET_VERSION;
use wxdl_proxy::{AssetBundle, ProxyConfig, ProxyServer, DEFAULT_PROXY_PORT, DEFAULT_TIMEOUT};

/// wxdl - capture and annotate WeChat Channels web traffic
#[derive(Parser, Debug)]
#[command(name = "wxdl", version, about)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PROXY_PORT)]
    port: u16,

    /// Directory receiving profiles/, html/ and js/
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Directory with lib/jszip.min.js or lib/FileSaver.min.js overriding the built-in copies
    #[arg(long)]
    assets_dir: Option<PathBuf>,

    /// Directory for the root CA (defaults to the user data directory)
    #[arg(long)]
    ca_dir: Option<PathBuf>,

    /// Version appended to rewritten script references
    #[arg(long, default_value = ASSET_VERSION)]
    asset_version: String,

    /// Do not fetch profile and feed data for newly seen accounts
    #[arg(long)]
    no_enrich: bool,

    /// Timeout in seconds for each enrichment call
    #[arg(long, default_value_t = DEFAULT_TIMEOUT.as_secs())]
    enrich_timeout: u64,

    /// Do not save page and script snapshots
    #[arg(long)]
    no_snapshots: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "wxdl", "wxdl").map(|dirs| dirs.data_dir().join("logs"))
}

/// Initialize console logging plus a daily-rotated file log.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "wxdl={level},wxdl_core={level},wxdl_proxy={level},warn",
            level = log_level
        ))
    });

    if let Some(log_dir) = logs_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("wxdl")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stdout))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::info!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

fn build_config(args: &Args) -> anyhow::Result<ProxyConfig> {
    let mut config = match &args.ca_dir {
        Some(dir) => ProxyConfig::with_ca_dir(dir),
        None => ProxyConfig::new()?,
    };

    config = config
        .with_port(args.port)
        .with_output_dir(&args.output_dir)
        .with_version(&args.asset_version)
        .with_enrich_timeout(Duration::from_secs(args.enrich_timeout));

    if let Some(dir) = &args.assets_dir {
        config = config.with_assets(AssetBundle::load(dir));
    }
    if args.no_enrich {
        config = config.without_enrichment();
    }
    if args.no_snapshots {
        config = config.without_snapshots();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _guard = init_logging(&args);

    tracing::info!("wxdl v{} starting", env!("CARGO_PKG_VERSION"));

    let config = build_config(&args)?;
    let server = ProxyServer::new(config)?;
    let store = server.store().clone();

    tracing::info!("Proxy address: http://{}", server.addr());
    tracing::info!(
        "Install {:?} as a trusted root CA in the browser",
        server.ca_cert_path()
    );
    tracing::info!("Writing output under {:?}", args.output_dir);

    tokio::select! {
        result = server.run() => result?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("Shutting down");
        }
    }

    tracing::info!("Collected {} profiles", store.len());
    Ok(())
}
