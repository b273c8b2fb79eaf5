use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use webserv::{Config, Reactor, Result, Shutdown};

#[derive(Parser)]
#[command(name = "webserv")]
#[command(about = "HTTP/1.1 server with CGI support", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(default_value = "config/default.toml")]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long, default_value_t = false)]
    check: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            // No subscriber yet: the log level comes from this file.
            eprintln!("webserv: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if cli.check {
        info!(path = %cli.config.display(), servers = config.servers.len(), "configuration is valid");
        return ExitCode::SUCCESS;
    }

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "server failed");
            ExitCode::FAILURE
        }
    }
}

fn run(config: Config) -> Result<()> {
    let shutdown = Shutdown::new();
    shutdown.install_signal_handlers()?;

    let mut reactor = Reactor::new(config)?;
    for addr in reactor.local_addrs() {
        info!("Server started on http://{}/", addr);
    }
    reactor.run(&shutdown)?;
    info!("shutdown complete");
    Ok(())
}
