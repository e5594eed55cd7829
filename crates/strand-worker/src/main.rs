//! Supervised HTTP worker.
//!
//! Runs standalone (`-port N`) or under the hot-swap supervisor with
//! inherited fds (`-http_fd N -cmd_fd N`). Under supervision, accepting
//! starts on command 0x00 and the worker quiesces and exits on 0x01; see
//! the strand-rt `sup` module for the byte protocol.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use strand_rt::http::parse::Response;
use strand_rt::http::server::{Builder as HttpBuilder, HttpServer};
use strand_rt::net::DEFAULT_BACKLOG;
use strand_rt::runtime::{Runtime, RuntimeConfig};
use strand_rt::sup::{self, InheritedFds};
use strand_rt::task;

struct Options {
    fds: InheritedFds,
    port: Option<u16>,
    threads: usize,
}

fn parse_options() -> Options {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let fds = match InheritedFds::parse(args.iter()) {
        Ok(fds) => fds,
        Err(e) => {
            eprintln!("{}", e);
            usage();
        }
    };
    let mut port = None;
    let mut threads = 0usize;
    let mut it = args.iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-port" => {
                port = it.next().and_then(|v| v.parse().ok());
                if port.is_none() {
                    usage();
                }
            }
            "-threads" => {
                threads = match it.next().and_then(|v| v.parse().ok()) {
                    Some(n) => n,
                    None => usage(),
                };
            }
            "-help" | "--help" => usage(),
            _ => {}
        }
    }
    Options { fds, port, threads }
}

fn usage() -> ! {
    eprintln!("usage: strand-worker [-port N | -http_fd N] [-cmd_fd N] [-threads N]");
    eprintln!("  -port N      bind a listener on port N (standalone mode)");
    eprintln!("  -http_fd N   accept on the inherited listening socket fd N");
    eprintln!("  -cmd_fd N    supervisor command pipe fd");
    eprintln!("  -threads N   worker threads (default: hardware concurrency)");
    std::process::exit(1);
}

fn handle_request(
    req: &strand_rt::http::parse::Request,
    _peer: &std::net::SocketAddrV6,
) -> Response {
    match req.path() {
        "/" => Response::text(200, "strand worker\n"),
        "/healthz" => Response::text(200, "ok\n"),
        "/echo" => Response::text(200, String::from_utf8_lossy(&req.body).to_string()),
        _ => Response::text(404, "not found\n"),
    }
}

fn start_http(opts: &Options) -> HttpServer {
    let builder = HttpBuilder::new().io_block_time(60);
    let result = match (opts.fds.http_fd, opts.port) {
        (Some(fd), _) => builder.serve_fd(fd, handle_request),
        (None, Some(port)) => builder.serve(port, DEFAULT_BACKLOG, handle_request),
        (None, None) => usage(),
    };
    match result {
        Ok(server) => server,
        Err(e) => {
            log::error!("failed to start http server: {}", e);
            std::process::exit(1);
        }
    }
}

fn main() {
    env_logger::init();
    let opts = parse_options();

    let rt = match Runtime::init(RuntimeConfig {
        workers: opts.threads,
        use_calling_thread: true,
    }) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("runtime init failed: {}", e);
            std::process::exit(1);
        }
    };

    match opts.fds.cmd_fd {
        Some(cmd_fd) => {
            // Supervised: accepting is gated on the start command, and stop
            // quiesces then brings the runtime down.
            let server: Arc<Mutex<Option<HttpServer>>> = Arc::new(Mutex::new(None));
            let opts = Arc::new(opts);
            let (srv_start, srv_stop) = (Arc::clone(&server), Arc::clone(&server));
            let opts_start = Arc::clone(&opts);
            task::Builder::new()
                .name("supervisor command loop")
                .spawn(move || {
                    let result = sup::run_command_loop(
                        cmd_fd,
                        move || {
                            let mut slot = srv_start.lock();
                            if slot.is_none() {
                                *slot = Some(start_http(&opts_start));
                            }
                        },
                        move || {
                            // Quiesce order: stop accepting, drain live
                            // pipes (bounded), stop the reactor. The ok
                            // byte goes out after all of this.
                            if let Some(server) = srv_stop.lock().take() {
                                server.stop();
                            }
                            sup::drain_net_pipes(Duration::from_secs(5));
                            Runtime::global().stop();
                        },
                    );
                    if let Err(e) = result {
                        log::error!("command loop failed: {}", e);
                        // A broken command pipe must still bring the
                        // runtime down; stop() is idempotent.
                        Runtime::global().stop();
                    }
                })
                .expect("spawning command loop failed");
        }
        None => {
            let server = start_http(&opts);
            log::info!(
                "serving on port {}",
                server.local_port().unwrap_or_default()
            );
            // Standalone: keep serving until the process is killed; the
            // server handle must outlive the worker loop below.
            std::mem::forget(server);
        }
    }

    // Join the reactor pool with this thread; returns when the runtime
    // stops (supervised mode) or never (standalone).
    rt.start_this_thread();
    rt.join();
    log::info!("worker exiting");
}
