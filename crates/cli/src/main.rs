// ntfy-relay CLI
//
// Design Decision: Use clap derive for argument parsing; `-json` is accepted as
// an alias of `--json` for compatibility with existing ntfy-notify unit files.
// Design Decision: Exit 0 on a graceful stop or clean remote close, 1 otherwise,
// so a supervisor restart (and the gap-fill that comes with it) is the recovery path.

mod logging;

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use ntfy_relay::{CommandNotifier, Config, Relay, RelaySettings, RunSummary};

use crate::logging::LogFormat;

#[derive(Parser, Debug)]
#[command(name = "ntfy-relay")]
#[command(about = "Relay ntfy topic messages to desktop notifications")]
#[command(version)]
pub struct Cli {
    /// Config file path
    #[arg(
        short = 'c',
        long = "config",
        env = "NTFY_RELAY_CONFIG",
        default_value = "./config.yml"
    )]
    pub config: PathBuf,

    /// Debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log as JSON lines
    #[arg(long)]
    pub json: bool,
}

/// Rewrite single-dash `-json` to `--json`
fn normalize_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    args.into_iter()
        .map(|arg| {
            if arg.as_os_str() == "-json" {
                OsString::from("--json")
            } else {
                arg
            }
        })
        .collect()
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_from(normalize_args(std::env::args_os()));
    logging::init(LogFormat::from_flag(cli.json), cli.verbose);

    match run(&cli).await {
        Ok(summary) if summary.exit.is_clean() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "ntfy-relay failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> anyhow::Result<RunSummary> {
    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;
    tracing::debug!(config = ?config, "loaded config");

    let settings = RelaySettings::from_config(&config).context("invalid config")?;
    let relay = Relay::new(settings, Arc::new(CommandNotifier::new()));

    tracing::info!(topics = %config.topics, "started ntfy-relay");
    let summary = relay.run(shutdown_signal()).await?;
    tracing::info!("bye");
    Ok(summary)
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received interrupt"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(normalize_args(args.iter().map(OsString::from))).unwrap()
    }

    #[test]
    fn test_defaults() {
        let cli = parse(&["ntfy-relay"]);
        assert!(!cli.verbose);
        assert!(!cli.json);
        // NTFY_RELAY_CONFIG may be set in the environment
        if std::env::var_os("NTFY_RELAY_CONFIG").is_none() {
            assert_eq!(cli.config, PathBuf::from("./config.yml"));
        }
    }

    #[test]
    fn test_single_dash_json() {
        let cli = parse(&["ntfy-relay", "-json", "-v", "-c", "/etc/relay.yml"]);
        assert!(cli.json);
        assert!(cli.verbose);
        assert_eq!(cli.config, PathBuf::from("/etc/relay.yml"));
    }

    #[test]
    fn test_long_flags() {
        let cli = parse(&["ntfy-relay", "--json", "--config", "relay.yml"]);
        assert!(cli.json);
        assert_eq!(cli.config, PathBuf::from("relay.yml"));
    }

    #[test]
    fn test_normalize_leaves_other_args() {
        let args = normalize_args(["x", "-jsonx", "-json"].map(OsString::from));
        assert_eq!(args, ["x", "-jsonx", "--json"].map(OsString::from).to_vec());
    }
}
