//! ioforge CLI entry point

use ioforge::config::cli::{Cli, LogLevel};
use ioforge::program;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let cli = Cli::parse_args();
    init_tracing(cli.log_level, cli.log_time_prefix);

    info!("initializing ioforge version {}", env!("CARGO_PKG_VERSION"));

    let outcome = cli
        .build()
        .and_then(|(settings, live)| program::run(settings, live));

    match outcome {
        Ok(()) => {
            info!("exit(0)");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{:#}", err);
            info!("exit(1)");
            ExitCode::FAILURE
        }
    }
}

/// `output` keeps only the STATS records (emitted on the dedicated `stats`
/// target) plus warnings; `info` and `debug` widen from there.
fn init_tracing(level: LogLevel, time_prefix: bool) {
    let directives = match level {
        LogLevel::Output => "warn,stats=info",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(directives))
        .with_target(false);

    if time_prefix {
        builder.init();
    } else {
        builder.without_time().init();
    }
}
