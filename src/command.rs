//! Command channel
//!
//! Two ingress paths feed one handler: line-oriented standard input
//! (monitored with a cancellable poll-based read) and an optional Unix
//! stream socket. Recognized commands:
//!
//! - `stop`: set the global stop flag
//! - `shift_report_time <ms>`: shift the next STATS record
//! - `wait=<bool>`: pause/resume the workload
//! - `<param>=<value>`: live mutation of `block_size`, `iodepth`,
//!   `write_ratio`, `random_ratio`, `flush_blocks`
//! - `help`: list the supported commands
//!
//! Responses go to an [`OutputSink`]: the process logger for stdin and
//! scripted commands, or back to the peer for socket commands (prefixed
//! `DEBUG:`/`WARN:`/`ERROR:`, plain on success).

use crate::config::LiveConfig;
use crate::reporter::ShiftSlot;
use crate::Result;
use anyhow::Context;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Poll interval of the cancellable stdin read; bounds how long the channel
/// takes to observe `stop`.
const STDIN_POLL_MS: libc::c_int = 500;
/// Accept retry interval of the nonblocking socket listener.
const ACCEPT_POLL: Duration = Duration::from_millis(200);
/// Read timeout of accepted connections, so they also observe `stop`.
const CONNECTION_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Routes command responses to the logger or back to a socket peer.
pub struct OutputSink<'a> {
    peer: Option<&'a mut dyn Write>,
    debug_enabled: bool,
}

impl<'a> OutputSink<'a> {
    /// Responses go to the process-wide logger.
    pub fn log() -> OutputSink<'static> {
        OutputSink {
            peer: None,
            debug_enabled: false,
        }
    }

    /// Responses go back to a socket peer.
    pub fn to_peer(peer: &'a mut dyn Write) -> OutputSink<'a> {
        OutputSink {
            peer: Some(peer),
            debug_enabled: tracing::enabled!(tracing::Level::DEBUG),
        }
    }

    pub fn debug(&mut self, msg: &str) {
        match self.peer.as_mut() {
            None => debug!("{}", msg),
            Some(peer) => {
                if self.debug_enabled {
                    let _ = writeln!(peer, "DEBUG: {}", msg);
                }
            }
        }
    }

    pub fn info(&mut self, msg: &str) {
        match self.peer.as_mut() {
            None => info!("{}", msg),
            Some(peer) => {
                let _ = writeln!(peer, "{}", msg);
            }
        }
    }

    pub fn warn(&mut self, msg: &str) {
        match self.peer.as_mut() {
            None => warn!("{}", msg),
            Some(peer) => {
                let _ = writeln!(peer, "WARN: {}", msg);
            }
        }
    }

    pub fn error(&mut self, msg: &str) {
        match self.peer.as_mut() {
            None => error!("{}", msg),
            Some(peer) => {
                let _ = writeln!(peer, "ERROR: {}", msg);
            }
        }
    }
}

/// Shared dispatcher for every command ingress (stdin, socket, script).
pub struct CommandHandler {
    live: Arc<LiveConfig>,
    shift: Arc<ShiftSlot>,
    stop: Arc<AtomicBool>,
    stats_interval_s: u32,
}

impl CommandHandler {
    pub fn new(
        live: Arc<LiveConfig>,
        shift: Arc<ShiftSlot>,
        stop: Arc<AtomicBool>,
        stats_interval_s: u32,
    ) -> Self {
        Self {
            live,
            shift,
            stop,
            stats_interval_s,
        }
    }

    /// Dispatch one command line. Command failures are reported through the
    /// sink; the running workload is never affected by a bad command.
    pub fn handle(&self, line: &str, sink: &mut OutputSink<'_>) {
        let command = line.trim();
        if command.is_empty() {
            return;
        }

        if command == "stop" {
            self.stop.store(true, Ordering::Relaxed);
            sink.info("stop command received");
            return;
        }

        if let Some(rest) = command.strip_prefix("shift_report_time ") {
            match rest.trim().parse::<i64>() {
                Ok(ms) => match self.shift.request(ms, self.stats_interval_s) {
                    Ok(msg) => sink.info(&msg),
                    Err(err) => sink.error(&format!("{:#}", err)),
                },
                Err(_) => sink.error(&format!("invalid command: {}", command)),
            }
            return;
        }

        if let Err(err) = self.live.apply_command(command, sink) {
            sink.error(&format!("{:#}", err));
        }
    }
}

/// Owns the stdin monitor thread and the optional socket listener.
pub struct CommandChannel {
    stop: Arc<AtomicBool>,
    failure: Arc<Mutex<Option<anyhow::Error>>>,
    stdin_thread: Option<thread::JoinHandle<()>>,
    listener_thread: Option<thread::JoinHandle<()>>,
    socket_path: Option<PathBuf>,
}

impl CommandChannel {
    pub fn spawn(
        handler: Arc<CommandHandler>,
        socket: Option<PathBuf>,
        stop: Arc<AtomicBool>,
    ) -> Result<Self> {
        let failure = Arc::new(Mutex::new(None));

        let stdin_thread = {
            let handler = handler.clone();
            let stop = stop.clone();
            let failure = failure.clone();
            thread::spawn(move || {
                debug!("command reader thread initiated");
                if let Err(err) = stdin_main(&handler, &stop) {
                    *failure.lock().unwrap() = Some(err);
                }
                debug!("command reader thread finished");
            })
        };

        let listener_thread = match socket {
            Some(ref path) => {
                info!("initiating command socket: {}", path.display());
                let listener = UnixListener::bind(path)
                    .with_context(|| format!("can't bind command socket {}", path.display()))?;
                listener.set_nonblocking(true)?;

                let stop = stop.clone();
                Some(thread::spawn(move || accept_loop(listener, handler, stop)))
            }
            None => None,
        };

        Ok(Self {
            stop,
            failure,
            stdin_thread: Some(stdin_thread),
            listener_thread,
            socket_path: socket,
        })
    }

    /// Whether the channel is still serving. Re-raises a captured stdin
    /// monitor error.
    pub fn is_active(&self) -> Result<bool> {
        if let Some(err) = self.failure.lock().unwrap().take() {
            return Err(err);
        }
        Ok(!self.stop.load(Ordering::Relaxed))
    }
}

impl Drop for CommandChannel {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.stdin_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.listener_thread.take() {
            let _ = handle.join();
        }
        if let Some(path) = self.socket_path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Monitor stdin with a cancellable blocking read. EOF terminates the run,
/// so the generator stops when a driving harness closes the pipe.
fn stdin_main(handler: &CommandHandler, stop: &AtomicBool) -> Result<()> {
    let fd = libc::STDIN_FILENO;
    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 512];

    while !stop.load(Ordering::Relaxed) {
        let mut pollfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let ready = unsafe { libc::poll(&mut pollfd, 1, STDIN_POLL_MS) };
        if ready < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err).context("poll on stdin failed");
        }
        if ready == 0 || pollfd.revents & (libc::POLLIN | libc::POLLHUP) == 0 {
            continue;
        }

        let n = unsafe { libc::read(fd, chunk.as_mut_ptr() as *mut libc::c_void, chunk.len()) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
                _ => return Err(err).context("read from stdin failed"),
            }
        }
        if n == 0 {
            debug!("stdin closed");
            stop.store(true, Ordering::Relaxed);
            break;
        }

        pending.extend_from_slice(&chunk[..n as usize]);
        while let Some(newline) = pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = pending.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            handler.handle(line.trim(), &mut OutputSink::log());
        }
    }

    Ok(())
}

fn accept_loop(listener: UnixListener, handler: Arc<CommandHandler>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, _)) => {
                debug!("command socket connection accepted");
                let handler = handler.clone();
                let stop = stop.clone();
                thread::spawn(move || {
                    if let Err(err) = connection_main(stream, &handler, &stop) {
                        debug!("socket connection failed: {:#}", err);
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                warn!("socket accept failed: {}", err);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

/// Serve one connection: half-duplex, one response per command line.
fn connection_main(stream: UnixStream, handler: &CommandHandler, stop: &AtomicBool) -> Result<()> {
    stream.set_read_timeout(Some(CONNECTION_READ_TIMEOUT))?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;

    let mut line = String::new();
    while !stop.load(Ordering::Relaxed) {
        match reader.read_line(&mut line) {
            Ok(0) => break, // peer closed
            Ok(_) => {
                let command = line.trim().to_string();
                line.clear();
                if command.is_empty() {
                    continue;
                }
                info!("command received from socket: {}", command);
                let mut sink = OutputSink::to_peer(&mut writer);
                sink.debug(&format!("message received: {}", command));
                handler.handle(&command, &mut sink);
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(err) => return Err(err).context("socket read failed"),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IoEngineKind;
    use tempfile::TempDir;

    fn handler_parts() -> (Arc<LiveConfig>, Arc<ShiftSlot>, Arc<AtomicBool>, CommandHandler) {
        let live = Arc::new(LiveConfig::new(
            IoEngineKind::Prwv2,
            false,
            10,
            4,
            4,
            0,
            0.0,
            0.0,
            false,
        ));
        let shift = Arc::new(ShiftSlot::new());
        let stop = Arc::new(AtomicBool::new(false));
        let handler = CommandHandler::new(live.clone(), shift.clone(), stop.clone(), 1);
        (live, shift, stop, handler)
    }

    #[test]
    fn test_sink_prefixes() {
        let mut out = Vec::new();
        let mut sink = OutputSink::to_peer(&mut out);
        sink.info("ok");
        sink.warn("careful");
        sink.error("broken");

        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "ok\nWARN: careful\nERROR: broken\n");
    }

    #[test]
    fn test_handler_stop() {
        let (_live, _shift, stop, handler) = handler_parts();
        let mut out = Vec::new();
        handler.handle("stop", &mut OutputSink::to_peer(&mut out));

        assert!(stop.load(Ordering::Relaxed));
        assert!(String::from_utf8(out).unwrap().contains("stop command received"));
    }

    #[test]
    fn test_handler_shift_report_time() {
        let (_live, shift, _stop, handler) = handler_parts();
        let mut out = Vec::new();
        handler.handle("shift_report_time 250", &mut OutputSink::to_peer(&mut out));

        assert_eq!(shift.take_us(), 250_000);
        assert!(String::from_utf8(out).unwrap().contains("set shift_report_time = 250ms"));

        let mut out = Vec::new();
        handler.handle("shift_report_time 900", &mut OutputSink::to_peer(&mut out));
        assert!(String::from_utf8(out).unwrap().starts_with("ERROR:"));
    }

    #[test]
    fn test_handler_mutation_and_errors() {
        let (live, _shift, stop, handler) = handler_parts();
        let mut out = Vec::new();

        handler.handle("iodepth=16", &mut OutputSink::to_peer(&mut out));
        assert_eq!(live.iodepth(), 16);

        handler.handle("nonsense", &mut OutputSink::to_peer(&mut out));
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("set iodepth=16"));
        assert!(text.contains("ERROR: invalid command"));
        // a bad command never stops the workload
        assert!(!stop.load(Ordering::Relaxed));
    }

    #[test]
    fn test_socket_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("control.sock");

        let (live, _shift, stop, handler) = handler_parts();
        let listener = UnixListener::bind(&path).unwrap();
        listener.set_nonblocking(true).unwrap();

        let acceptor = {
            let handler = Arc::new(handler);
            let stop = stop.clone();
            thread::spawn(move || accept_loop(listener, handler, stop))
        };

        let mut client = UnixStream::connect(&path).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut responses = BufReader::new(client.try_clone().unwrap());

        client.write_all(b"wait=true\n").unwrap();
        let mut reply = String::new();
        responses.read_line(&mut reply).unwrap();
        assert!(reply.contains("set wait=true"));
        assert!(live.wait());

        client.write_all(b"block_size=2\n").unwrap();
        reply.clear();
        responses.read_line(&mut reply).unwrap();
        assert!(reply.starts_with("ERROR:"));

        client.write_all(b"stop\n").unwrap();
        reply.clear();
        responses.read_line(&mut reply).unwrap();
        assert!(reply.contains("stop command received"));
        assert!(stop.load(Ordering::Relaxed));

        acceptor.join().unwrap();
    }
}
