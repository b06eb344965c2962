use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::tm::cli::DaemonArgs;
use crate::tm::config::Config;
use crate::tm::error::Error;
use crate::tm::log::{start_log_writer, tm_event};
use crate::tm::rpc::{Request, Response, DEFAULT_SOCKET};
use crate::tm::supervisor::Supervisor;
use crate::tm::util;

/// Entry point for the taskmasterd binary. The default run re-execs a
/// detached copy of ourselves and returns immediately.
pub async fn main(args: DaemonArgs) -> anyhow::Result<()> {
    if args.daemon {
        return daemonize();
    }

    let cfg = Config::load(args.config.as_deref())?;

    let (log_path, log_file) = util::open_log_file()?;
    start_log_writer(log_file, &cfg.webhook);
    tm_event("boot", None, format!("taskmasterd starting, log={}", log_path.display()));

    if !cfg.drop_to_user.is_empty() {
        let user = cfg.drop_to_user.clone();
        util::drop_to_user(&user)?;
        tm_event("boot", None, format!("dropped privileges to {user}"));
    }

    run(cfg, Path::new(DEFAULT_SOCKET)).await
}

/// Binds the control socket, autostarts tasks, and serves requests
/// until a termination signal arrives.
pub async fn run(cfg: Config, sock: &Path) -> anyhow::Result<()> {
    prepare_socket(sock)?;
    let listener = UnixListener::bind(sock)
        .with_context(|| format!("failed to bind socket {}", sock.display()))?;

    let sup = Supervisor::new(cfg);

    // Children only start once the control socket is live, so a client
    // launched right after the daemon always reaches it.
    match sup.autostart().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tm_event("autostart", None, format!("errors: {e}")),
        Err(e) => tm_event("autostart", None, format!("batch panicked: {e}")),
    }

    let shutdown = CancellationToken::new();
    spawn_signal_listener(sup.clone(), shutdown.clone());

    tm_event("rpc", None, format!("listening sock={}", sock.display()));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            r = listener.accept() => match r {
                Ok((stream, _addr)) => {
                    let sup = sup.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(sup, stream).await {
                            tm_event("rpc", None, format!("connection error: {e}"));
                        }
                    });
                }
                Err(e) => {
                    tm_event("rpc", None, format!("accept error: {e}"));
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
        }
    }

    tm_event("shutdown", None, "signal received, stopping all services");
    drop(listener);
    let res = sup.close().await;
    let _ = std::fs::remove_file(sock);
    res.map_err(|e| anyhow::anyhow!("shutdown errors: {e}"))
}

/// SIGINT and SIGTERM end the daemon loop; SIGHUP reloads the
/// configuration in place. Children receive their task's configured
/// stop signal, never these.
fn spawn_signal_listener(sup: Supervisor, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut term = unix_signal(SignalKind::terminate()).expect("SIGTERM handler");
        let mut int = unix_signal(SignalKind::interrupt()).expect("SIGINT handler");
        let mut hup = unix_signal(SignalKind::hangup()).expect("SIGHUP handler");
        loop {
            tokio::select! {
                _ = term.recv() => {
                    tm_event("signal", None, "SIGTERM, exiting");
                    shutdown.cancel();
                    return;
                }
                _ = int.recv() => {
                    tm_event("signal", None, "SIGINT, exiting");
                    shutdown.cancel();
                    return;
                }
                _ = hup.recv() => {
                    tm_event("signal", None, "SIGHUP, reloading");
                    let (changed, res) = sup.reload().await;
                    match res {
                        Ok(()) => tm_event("signal", None, format!("config reloaded, changed={changed}")),
                        Err(e) => tm_event("signal", None, format!("reload failed (changed={changed}): {e}")),
                    }
                }
            }
        }
    });
}

/// Serves one connection: any number of newline-framed JSON exchanges
/// until the peer hangs up.
async fn handle_connection(sup: Supervisor, stream: UnixStream) -> anyhow::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(());
        }
        if line.trim().is_empty() {
            continue;
        }
        let resp = match serde_json::from_str::<Request>(line.trim_end()) {
            Ok(req) => dispatch(&sup, req).await,
            Err(e) => Response::failure(format!("invalid request: {e}")),
        };
        let out = serde_json::to_string(&resp)? + "\n";
        write.write_all(out.as_bytes()).await?;
        write.flush().await?;
    }
}

pub(crate) async fn dispatch(sup: &Supervisor, req: Request) -> Response {
    if sup.is_closed() {
        // The sentinel tells clients to announce the closure and leave
        // their loop.
        return Response::failure(Error::ServiceClosed);
    }
    match req {
        Request::List => {
            let names = sup.list().await;
            Response { names, ..Response::success() }
        }
        Request::Status { name } => {
            let status = sup.status(&name).await;
            Response { status: Some(status), ..Response::success() }
        }
        Request::GetPid { name } => match sup.get_pid(&name).await {
            Ok(pid) => Response { pid: Some(pid), ..Response::success() },
            Err(e) => Response::failure(e),
        },
        Request::Start { name } => match sup.start(&name).await {
            Ok(()) => Response::success(),
            Err(e) => Response::failure(e),
        },
        Request::Stop { name } => match sup.stop(&name).await {
            Ok(()) => Response::success(),
            Err(e) => Response::failure(e),
        },
        Request::ReloadConfig => {
            let (changed, res) = sup.reload().await;
            match res {
                Ok(()) => Response { changed: Some(changed), ..Response::success() },
                Err(e) => Response { changed: Some(changed), ..Response::failure(e) },
            }
        }
    }
}

fn prepare_socket(sock: &Path) -> anyhow::Result<()> {
    if sock.exists() {
        std::fs::remove_file(sock)
            .with_context(|| format!("failed to remove stale socket {}", sock.display()))?;
    }
    Ok(())
}

/// Re-execs this binary detached from the terminal with stdio pointed
/// at the log file, then returns so the parent can exit cleanly.
fn daemonize() -> anyhow::Result<()> {
    let exe = std::env::current_exe().context("failed to find executable path")?;
    let mut args: Vec<std::ffi::OsString> = vec!["--daemon=false".into()];
    let mut it = std::env::args_os().skip(1).peekable();
    while let Some(a) = it.next() {
        let s = a.to_string_lossy();
        if s.starts_with("--daemon=") {
            continue;
        }
        if s == "--daemon" {
            // Swallow the space-separated value form too.
            if it
                .peek()
                .map(|v| matches!(v.to_string_lossy().as_ref(), "true" | "false"))
                .unwrap_or(false)
            {
                it.next();
            }
            continue;
        }
        args.push(a);
    }

    let (_, log_file) = util::open_log_file()?;

    let mut cmd = std::process::Command::new(exe);
    cmd.args(args)
        .stdin(std::process::Stdio::null())
        .stdout(log_file.try_clone().context("failed to clone log handle")?)
        .stderr(log_file);
    unsafe {
        use std::os::unix::process::CommandExt;
        cmd.pre_exec(|| {
            nix::unistd::setsid().map_err(std::io::Error::from)?;
            Ok(())
        });
    }

    let child = cmd.spawn().context("failed to daemonize")?;
    println!("Daemon started with PID: {}", child.id());
    Ok(())
}
