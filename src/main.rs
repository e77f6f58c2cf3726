//! dnstt-keeper - CLI entry point
//!
//! Loads configuration (from `-config` or a fixed search list), initializes
//! logging, and runs the supervisor until SIGINT/SIGTERM. Exit code 0 on
//! graceful shutdown, 1 on configuration or bootstrap failure.
//!
//! Go-style single-dash long options are accepted alongside the standard
//! double-dash form: `-config` and `--config` both work.

use clap::Parser;
use dnstt_keeper::config::{find_config_file, LogConfig};
use dnstt_keeper::{App, Config, VERSION};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Long options that callers may pass with a single dash, Go flag style.
const GO_STYLE_LONG_OPTIONS: &[&str] = &["-config", "-version"];

/// Convert Go-style single-dash long options to the double-dash format
/// clap expects.
fn normalize_args() -> Vec<String> {
    std::env::args()
        .map(|arg| {
            if GO_STYLE_LONG_OPTIONS.contains(&arg.as_str()) {
                format!("-{}", arg)
            } else {
                arg
            }
        })
        .collect()
}

#[derive(Parser, Debug)]
#[command(name = "dnstt-keeper")]
#[command(about = "Resilient supervisor for a dnstt DNS-tunnel client")]
#[command(disable_version_flag = true)]
struct Args {
    /// Path to configuration file (auto-detected when omitted)
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Print version information and exit
    #[arg(long = "version")]
    version: bool,
}

/// Set up the tracing subscriber from config. The returned guard keeps the
/// non-blocking file writer flushing; hold it for the process lifetime.
fn init_logging(config: &LogConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_new(&config.level)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let (writer, guard) = match config.file {
        Some(ref path) => {
            let dir = path
                .parent()
                .filter(|d| !d.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("dnstt-keeper.log"));
            let appender = tracing_appender::rolling::never(dir, name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stdout), None),
    };

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(writer))
            .init();
    }
    guard
}

#[tokio::main]
async fn main() {
    let args = Args::parse_from(normalize_args());

    if args.version {
        println!("dnstt-keeper version {}", VERSION);
        return;
    }

    let config_path = match args.config.or_else(find_config_file) {
        Some(path) => path,
        None => {
            eprintln!("error: no config file found; pass -config <path>");
            std::process::exit(1);
        }
    };

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let _guard = init_logging(&config.log);
    info!("dnstt-keeper version {} starting", VERSION);
    info!("configuration loaded from {}", config_path.display());

    let app = match App::new(config) {
        Ok(app) => app,
        Err(e) => {
            error!("failed to initialize: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = app.run().await {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
