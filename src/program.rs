//! Top-level program wiring
//!
//! Builds the component graph (controller, reporter, command channel),
//! registers signal handlers, runs the 500 ms supervision loop (command
//! script dispatch, duration expiry, liveness polls) and tears everything
//! down in order: stop flag, reporter (2 s grace), controller with its
//! engine, command channel, target file.

use crate::command::{CommandChannel, CommandHandler, OutputSink};
use crate::config::{LiveConfig, Settings};
use crate::controller::Controller;
use crate::reporter::{Reporter, ShiftSlot};
use crate::Result;
use anyhow::Context;
use signal_hook::consts::{SIGINT, SIGTERM};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

/// Supervision poll interval.
const SUPERVISE_POLL: Duration = Duration::from_millis(500);

/// Run the workload to completion. Returns after full teardown.
pub fn run(settings: Settings, live: LiveConfig) -> Result<()> {
    let settings = Arc::new(settings);
    let live = Arc::new(live);
    let stop = Arc::new(AtomicBool::new(false));

    register_signals(&stop)?;

    let start = Instant::now();
    let controller = Controller::new(settings.clone(), live.clone(), stop.clone())?;

    let shift = Arc::new(ShiftSlot::new());
    let reporter = Reporter::spawn(
        live.clone(),
        controller.stats(),
        shift.clone(),
        stop.clone(),
        settings.stats_interval_s,
        start,
    );

    let handler = Arc::new(CommandHandler::new(
        live,
        shift,
        stop.clone(),
        settings.stats_interval_s,
    ));
    let channel = match CommandChannel::spawn(handler.clone(), settings.socket.clone(), stop.clone())
    {
        Ok(channel) => channel,
        Err(err) => {
            stop.store(true, Ordering::Relaxed);
            reporter.join_with_grace();
            drop(controller);
            return Err(err);
        }
    };

    let result = supervise(&settings, &handler, &controller, &reporter, &channel, &stop, start);

    // teardown order: reporter first, then the engine via the controller,
    // then the command channel; the target file closes with the controller
    stop.store(true, Ordering::Relaxed);
    reporter.join_with_grace();
    drop(controller);
    drop(channel);

    result
}

fn supervise(
    settings: &Settings,
    handler: &CommandHandler,
    controller: &Controller,
    reporter: &Reporter,
    channel: &CommandChannel,
    stop: &AtomicBool,
    start: Instant,
) -> Result<()> {
    let mut script = settings.command_script.clone();

    while !stop.load(Ordering::Relaxed) {
        let elapsed_s = start.elapsed().as_secs();
        while let Some(cmd) = script.pop_due(elapsed_s) {
            info!("command_script time={}s, command: {}", cmd.at_s, cmd.command);
            handler.handle(&cmd.command, &mut OutputSink::log());
        }
        if stop.load(Ordering::Relaxed) {
            break;
        }

        if settings.duration_s > 0 && start.elapsed().as_secs() > settings.duration_s {
            info!("duration time exceeded: {} seconds", settings.duration_s);
            break;
        }

        if !controller.is_active()? || !channel.is_active()? {
            break;
        }
        reporter.check()?;

        thread::sleep(SUPERVISE_POLL);
    }

    Ok(())
}

/// First SIGTERM/SIGINT sets the stop flag and lets teardown run on the
/// main thread; a further signal while already stopping escalates to the
/// default termination.
fn register_signals(stop: &Arc<AtomicBool>) -> Result<()> {
    for signal in [SIGTERM, SIGINT] {
        signal_hook::flag::register_conditional_shutdown(signal, 1, stop.clone())
            .context("can't register shutdown escalation")?;
        signal_hook::flag::register(signal, stop.clone())
            .context("can't register signal handler")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::script::CommandScript;
    use crate::config::IoEngineKind;
    use tempfile::TempDir;

    #[test]
    fn test_run_to_duration_expiry() {
        let dir = TempDir::new().unwrap();
        let filename = dir.path().join("target.dat");
        std::fs::write(&filename, vec![0u8; 10 * 1024 * 1024]).unwrap();

        let settings = Settings {
            filename,
            create_file: false,
            delete_file: false,
            filesize_mib: 0,
            socket: None,
            duration_s: 1,
            stats_interval_s: 1,
            io_engine: IoEngineKind::Posix,
            o_direct: false,
            o_dsync: false,
            command_script: CommandScript::default(),
        };
        let live = LiveConfig::new(IoEngineKind::Posix, false, 0, 4, 1, 0, 0.0, 0.0, false);

        let started = Instant::now();
        run(settings, live).unwrap();
        // duration expiry plus bounded teardown
        assert!(started.elapsed() < Duration::from_secs(8));
    }

    #[test]
    fn test_scripted_stop() {
        let dir = TempDir::new().unwrap();
        let filename = dir.path().join("target.dat");
        std::fs::write(&filename, vec![0u8; 10 * 1024 * 1024]).unwrap();

        let settings = Settings {
            filename,
            create_file: false,
            delete_file: false,
            filesize_mib: 0,
            socket: None,
            duration_s: 30,
            stats_interval_s: 1,
            io_engine: IoEngineKind::Posix,
            o_direct: false,
            o_dsync: false,
            command_script: "0:stop".parse().unwrap(),
        };
        let live = LiveConfig::new(IoEngineKind::Posix, false, 0, 4, 1, 0, 0.0, 0.0, false);

        let started = Instant::now();
        run(settings, live).unwrap();
        assert!(started.elapsed() < Duration::from_secs(8));
    }
}
