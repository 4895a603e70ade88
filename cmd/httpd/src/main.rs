//! # gvdispatch HTTP/1.1 server
//!
//! Every connection is a chain of queue tasks: receive, parse, respond,
//! send. No thread ever blocks on a socket; the reactor thread polls and the
//! worker pool runs the completions.
//!
//! ## Usage
//!
//!     cargo run -p gvdispatch-httpd --release -- [--port 8080] [--workers 4]
//!
//! ## Benchmark
//!
//!     wrk -t4 -c100 -d10s http://127.0.0.1:8080/

use gvdispatch::{
    drain_main, kerror, kinfo, respond_with, utility_queue, HttpServer, Request, Response,
    RuntimeConfig, ServerConfig,
};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const HELLO_BODY: &str = "Hello from gvdispatch!\n";
const STATS_INTERVAL: Duration = Duration::from_secs(5);

static RUNNING: AtomicBool = AtomicBool::new(true);
static TOTAL_REQUESTS: AtomicU64 = AtomicU64::new(0);

fn hello(_request: Request) -> Response {
    TOTAL_REQUESTS.fetch_add(1, Ordering::Relaxed);
    Response::ok(HELLO_BODY).header("Content-Type", "text/plain")
}

/// Print request rate every few seconds, rescheduling itself on the
/// utility queue until shutdown
fn schedule_stats(server: Arc<HttpServer>, start: Instant, last_reqs: u64) {
    utility_queue().after(STATS_INTERVAL, move || {
        if !RUNNING.load(Ordering::Relaxed) {
            return;
        }
        let total = TOTAL_REQUESTS.load(Ordering::Relaxed);
        let rps = (total - last_reqs) as f64 / STATS_INTERVAL.as_secs_f64();
        let stats = server.server();
        eprintln!(
            "[{:.1}s] active={} total_conns={} reqs={} rps={:.0}",
            start.elapsed().as_secs_f64(),
            stats.active_connections(),
            stats.accepted(),
            total,
            rps,
        );
        schedule_stats(Arc::clone(&server), start, total);
    });
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    // Phase 1: environment (GVD_PORT, GVD_NUM_WORKERS, ...)
    let mut server_config = ServerConfig::from_env();
    let mut runtime_config = RuntimeConfig::from_env();

    // Phase 2: CLI flags override the environment
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                i += 1;
                if let Some(p) = args.get(i).and_then(|s| s.parse().ok()) {
                    server_config = server_config.port(p);
                }
            }
            "--workers" | "-w" => {
                i += 1;
                if let Some(w) = args.get(i).and_then(|s| s.parse().ok()) {
                    runtime_config = runtime_config.num_workers(w);
                }
            }
            s => {
                if let Ok(p) = s.parse::<u16>() {
                    server_config = server_config.port(p);
                }
            }
        }
        i += 1;
    }

    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as usize);
        libc::signal(libc::SIGTERM, handle_sigint as usize);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    eprintln!(
        "gvdispatch-httpd: port={} workers={}",
        server_config.port, runtime_config.num_workers
    );

    if let Err(e) = gvdispatch::init(runtime_config) {
        kerror!("runtime: {}", e);
        std::process::exit(1);
    }

    let server = match HttpServer::with_config(server_config, respond_with(hello)) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            kerror!("cannot listen: {}", e);
            std::process::exit(1);
        }
    };
    server.start(|e| kerror!("accept loop: {}", e));
    if let Ok(port) = server.local_port() {
        eprintln!("gvdispatch-httpd: listening on http://0.0.0.0:{}/", port);
    }
    schedule_stats(Arc::clone(&server), Instant::now(), 0);

    // The main thread serves the main queue until a signal arrives
    while RUNNING.load(Ordering::Relaxed) {
        drain_main();
        std::thread::sleep(Duration::from_millis(100));
    }

    server.stop();
    let stats = server.server();
    kinfo!("shutdown requested");
    eprintln!(
        "\ngvdispatch-httpd: shutdown - {} requests, {} connections",
        TOTAL_REQUESTS.load(Ordering::Relaxed),
        stats.accepted()
    );
}

extern "C" fn handle_sigint(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}
