mod runner;

use anyhow::Context;
use bridge_core::config::{self, AppConfig};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Headless controller that drives a MikroTik router's wireless interface
/// from a small browser UI.
#[derive(Debug, Parser)]
#[command(name = "bridge-daemon", version)]
struct Args {
    /// TOML file replacing the built-in defaults.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the HTTP listen address.
    #[arg(long, value_name = "ADDR")]
    bind: Option<SocketAddr>,

    /// Override the directory the UI is served from.
    #[arg(long, value_name = "DIR")]
    ui_dir: Option<PathBuf>,
}

fn load_app_config(args: &Args) -> anyhow::Result<AppConfig> {
    let mut app = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            config::load_config_from_toml_str(&text)
                .with_context(|| format!("invalid config file {}", path.display()))?
        }
        None => config::builtin_config().context("built-in configuration is invalid")?,
    };

    if let Some(bind) = args.bind {
        app.ap.bind_addr = bind;
    }
    if let Some(dir) = &args.ui_dir {
        app.paths.ui_dir = dir.clone();
    }
    Ok(app)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志，RUST_LOG 控制级别
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let app = load_app_config(&args)?;
    tracing::info!(
        bind = %app.ap.bind_addr,
        ui_dir = %app.paths.ui_dir.display(),
        runtime_config = %app.paths.runtime_config.display(),
        "🚀 Starting bridge daemon"
    );

    runner::run(app).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_apply_on_top_of_defaults() {
        let args = Args::parse_from([
            "bridge-daemon",
            "--bind",
            "127.0.0.1:8080",
            "--ui-dir",
            "/tmp/ui",
        ]);
        let app = load_app_config(&args).unwrap();
        assert_eq!(app.ap.bind_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(app.paths.ui_dir, PathBuf::from("/tmp/ui"));
        assert_eq!(app.ap.ssid, "MikroTikSetup");
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let args = Args::parse_from(["bridge-daemon", "--config", "/nonexistent/bridge.toml"]);
        assert!(load_app_config(&args).is_err());
    }
}
