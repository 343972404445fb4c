mod backup;
mod calc;
mod config;
mod db;
mod ipc;
mod layout;
mod rapor;

use std::io::{self, BufRead, Write};
use std::time::Instant;
use tracing::{debug, info, warn};

fn init_logging(cfg: &config::DaemonConfig) {
    // stdout carries IPC responses; logs must go to stderr.
    let filter = tracing_subscriber::EnvFilter::try_from_env("RAPORD_LOG")
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&cfg.log_level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(false);
    match cfg.log_format {
        config::LogFormat::Json => builder.json().init(),
        config::LogFormat::Text => builder.init(),
    }
}

fn main() {
    let cfg = match config::DaemonConfig::load() {
        Ok(v) => v,
        Err(e) => {
            eprintln!("rapord: invalid configuration, using defaults: {e}");
            config::DaemonConfig::default()
        }
    };
    init_logging(&cfg);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        batch_concurrency = cfg.batch_concurrency,
        "rapord starting"
    );

    let mut state = ipc::AppState {
        workspace: None,
        db: None,
        batch_concurrency: cfg.batch_concurrency,
    };
    if let Some(path) = cfg.workspace.as_ref() {
        match db::open_db(path) {
            Ok(conn) => {
                info!(workspace = %path.display(), "workspace opened from config");
                state.workspace = Some(path.clone());
                state.db = Some(conn);
            }
            Err(e) => warn!(workspace = %path.display(), error = %e, "configured workspace failed to open"),
        }
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply without id.
                warn!(error = %e, "unparseable request line");
                let body = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{}", body);
                let _ = stdout.flush();
                continue;
            }
        };

        let started = Instant::now();
        let id = req.id.clone();
        let method = req.method.clone();
        let resp = ipc::handle_request(&mut state, req);
        let ok = resp.get("ok").and_then(|v| v.as_bool()).unwrap_or(false);
        debug!(
            id = %id,
            method = %method,
            ok,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "handled request"
        );
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }

    info!("stdin closed, rapord exiting");
}
