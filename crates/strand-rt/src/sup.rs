//! Worker side of the hot-swap supervisor handshake.
//!
//! The supervisor launches a new worker generation with inherited listening
//! sockets, passed as fd numbers in single-dash flags:
//!
//! ```text
//! -http_fd N      plain listener
//! -https_fd N     TLS listener
//! -udp_fds N[,N]  UDP sockets
//! -private_fd N   internal-traffic listener
//! -cmd_fd N       bidirectional command pipe
//! ```
//!
//! Single-byte commands arrive on the command pipe; the worker answers with
//! the single ok byte `b'o'`:
//!
//! | byte | meaning                                  |
//! |------|------------------------------------------|
//! | 0x00 | start accepting                          |
//! | 0x01 | stop accepting (quiesce), reply ok, exit |
//! | 0x02 | sync -- reply ok                         |
//!
//! The worker writes its first ok byte as soon as the runtime is up and the
//! command loop is armed; the supervisor kills workers that stay silent for
//! about a second. On stop, the worker quiesces (stops accepting, waits for
//! live pipes to drain, bounded, then stops the reactor), writes a second
//! ok, and exits.

use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::error::{Result, RtError};
use crate::pipe::{self, Pipe, SocketKind};
use crate::task;

pub const CMD_START: u8 = 0x00;
pub const CMD_STOP: u8 = 0x01;
pub const CMD_SYNC: u8 = 0x02;
pub const OK_BYTE: u8 = b'o';

// ---------------------------------------------------------------------------
// InheritedFds
// ---------------------------------------------------------------------------

/// Listener fds handed down by the supervisor.
#[derive(Clone, Debug, Default)]
pub struct InheritedFds {
    pub http_fd: Option<RawFd>,
    pub https_fd: Option<RawFd>,
    pub udp_fds: Vec<RawFd>,
    pub private_fd: Option<RawFd>,
    pub cmd_fd: Option<RawFd>,
}

impl InheritedFds {
    /// Parse the supervisor's flags out of an argument list. Unrecognized
    /// arguments are ignored (the worker may have flags of its own).
    pub fn parse<I, S>(args: I) -> Result<InheritedFds>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out = InheritedFds::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            let name = arg.as_ref();
            let wants_value = matches!(
                name,
                "-http_fd" | "-https_fd" | "-udp_fds" | "-private_fd" | "-cmd_fd"
            );
            if !wants_value {
                continue;
            }
            let value = args
                .next()
                .ok_or_else(|| RtError::Setup(format!("{} requires a value", name)))?;
            let value = value.as_ref();
            match name {
                "-udp_fds" => {
                    for part in value.split(',') {
                        out.udp_fds.push(parse_fd(name, part)?);
                    }
                }
                "-http_fd" => out.http_fd = Some(parse_fd(name, value)?),
                "-https_fd" => out.https_fd = Some(parse_fd(name, value)?),
                "-private_fd" => out.private_fd = Some(parse_fd(name, value)?),
                "-cmd_fd" => out.cmd_fd = Some(parse_fd(name, value)?),
                _ => unreachable!(),
            }
        }
        Ok(out)
    }
}

fn parse_fd(flag: &str, value: &str) -> Result<RawFd> {
    value
        .trim()
        .parse::<RawFd>()
        .map_err(|_| RtError::Setup(format!("{}: '{}' is not an fd number", flag, value)))
}

// ---------------------------------------------------------------------------
// Command loop
// ---------------------------------------------------------------------------

/// Drive the supervisor command loop on the current task.
///
/// Writes the startup ok byte immediately, then dispatches commands until
/// stop: `on_start` fires for 0x00 (idempotence is the caller's concern);
/// 0x01 runs `on_stop`, replies ok, and returns. `on_stop` performs the
/// whole quiesce -- stop accepting, drain pipes, stop the reactor -- so
/// the ok byte is the last thing the worker says.
pub fn run_command_loop(
    cmd_fd: RawFd,
    mut on_start: impl FnMut(),
    on_stop: impl FnOnce(),
) -> Result<()> {
    let pipe = Pipe::new(cmd_fd, SocketKind::Unix);
    pipe.write_all(&[OK_BYTE])?;
    log::info!("command loop armed on fd {}", cmd_fd);

    let mut on_stop = Some(on_stop);
    loop {
        let mut cmd = [0u8; 1];
        pipe.read(&mut cmd)?;
        match cmd[0] {
            CMD_START => {
                log::info!("supervisor: start accepting");
                on_start();
            }
            CMD_SYNC => {
                pipe.write_all(&[OK_BYTE])?;
            }
            CMD_STOP => {
                log::info!("supervisor: stop requested, quiescing");
                if let Some(stop) = on_stop.take() {
                    stop();
                }
                pipe.write_all(&[OK_BYTE])?;
                return Ok(());
            }
            other => {
                log::error!("unknown supervisor command {:#04x} - ignored", other);
            }
        }
    }
}

/// Quiesce helper: poll the net-pipe count down to zero, bounded by
/// `timeout`. Returns whether the runtime drained in time.
pub fn drain_net_pipes(timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while pipe::net_pipe_count() > 0 {
        if std::time::Instant::now() >= deadline {
            log::warn!(
                "quiesce timeout with {} pipe(s) still open",
                pipe::net_pipe_count()
            );
            return false;
        }
        task::sleep(Duration::from_millis(100));
    }
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
