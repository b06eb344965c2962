use std::collections::VecDeque;
use std::sync::{Mutex, OnceLock};

use chrono::Local;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

static LOG_TX: OnceLock<mpsc::UnboundedSender<String>> = OnceLock::new();
static EARLY_LOG: OnceLock<Mutex<VecDeque<String>>> = OnceLock::new();
static WEBHOOK_TX: OnceLock<mpsc::UnboundedSender<String>> = OnceLock::new();

const EARLY_LOG_MAX_LINES: usize = 1000;

// Discord rejects payloads above this; longer lines are truncated.
const WEBHOOK_CONTENT_MAX: usize = 2000;

pub fn debug_enabled() -> bool {
    static DEBUG: OnceLock<bool> = OnceLock::new();
    *DEBUG.get_or_init(|| std::env::var("DEBUG").is_ok_and(|v| v == "true"))
}

/// Emits one event line: timestamp, component, optional task, message.
/// Lines go to the log file (buffered until the writer starts) and to
/// the webhook sink when one is configured. With DEBUG=true they are
/// echoed on stderr as well.
pub fn tm_event(component: &str, task: Option<&str>, msg: impl AsRef<str>) {
    let ts = Local::now().format("%Y-%m-%d_%H:%M:%S%.3f");
    let line = match task {
        Some(t) => format!("{ts} [{component}] task={t} {}", msg.as_ref()),
        None => format!("{ts} [{component}] {}", msg.as_ref()),
    };

    if debug_enabled() {
        eprintln!("{line}");
    }

    if let Some(tx) = WEBHOOK_TX.get() {
        let _ = tx.send(line.clone());
    }

    if let Some(tx) = LOG_TX.get() {
        let _ = tx.send(line);
    } else {
        let q = EARLY_LOG.get_or_init(|| Mutex::new(VecDeque::new()));
        let mut g = q.lock().unwrap_or_else(|p| p.into_inner());
        g.push_back(line);
        while g.len() > EARLY_LOG_MAX_LINES {
            g.pop_front();
        }
    }
}

pub fn tm_debug(component: &str, task: Option<&str>, msg: impl AsRef<str>) {
    if debug_enabled() {
        tm_event(component, task, msg);
    }
}

/// Starts the background log writer over the already-truncated log file
/// and, when a webhook URL is configured, the forwarder that posts each
/// event line. Must run inside the runtime. Safe to call once.
pub fn start_log_writer(file: std::fs::File, webhook: &str) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    if LOG_TX.set(tx).is_err() {
        return;
    }

    if !webhook.is_empty() {
        start_webhook_forwarder(webhook.to_string());
    }

    tokio::spawn(async move {
        let mut f = tokio::fs::File::from_std(file);

        // Flush lines logged before the writer existed.
        if let Some(q) = EARLY_LOG.get() {
            let drained: Vec<String> = {
                let mut g = q.lock().unwrap_or_else(|p| p.into_inner());
                g.drain(..).collect()
            };
            for line in drained {
                let _ = f.write_all(format!("{line}\n").as_bytes()).await;
            }
            let _ = f.flush().await;
        }

        while let Some(line) = rx.recv().await {
            if f.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                return;
            }
            let _ = f.flush().await;
        }
    });
}

/// One consumer posts lines in order, so webhook delivery never
/// interleaves and never blocks the caller of `tm_event`.
fn start_webhook_forwarder(url: String) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    if WEBHOOK_TX.set(tx).is_err() {
        return;
    }

    tokio::spawn(async move {
        let client = reqwest::Client::new();
        while let Some(mut content) = rx.recv().await {
            content.truncate(WEBHOOK_CONTENT_MAX);
            let body = serde_json::json!({ "content": content });
            match client.post(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) if debug_enabled() => {
                    eprintln!("webhook: unexpected status {}", resp.status());
                }
                Err(e) if debug_enabled() => {
                    eprintln!("webhook: post failed: {e}");
                }
                _ => {}
            }
        }
    });
}
