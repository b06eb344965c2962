use std::path::{Path, PathBuf};

use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::tm::cli::ShellArgs;
use crate::tm::config::Config;
use crate::tm::error::Error;
use crate::tm::log::{start_log_writer, tm_event};
use crate::tm::process::ProcessStatus;
use crate::tm::rpc::{client_call, CallError, Request};
use crate::tm::supervisor::Supervisor;
use crate::tm::term::{Term, TermError};
use crate::tm::util;

const NAME_WIDTH: usize = 20;

// ---- Remote client: drives a running daemon over the control socket ----

/// Entry point for the taskmasterctl binary.
pub async fn run_remote(sock: PathBuf) -> anyhow::Result<()> {
    let mut term = Term::new();

    let s = sock.clone();
    term.add_cmd(
        "status",
        "Show the status of tasks (all when no names are given).",
        Box::new(move |args| {
            let s = s.clone();
            Box::pin(async move { remote_status(&s, args).await })
        }),
    );

    let s = sock.clone();
    term.add_cmd(
        "start",
        "Start one or more tasks by name.",
        Box::new(move |args| {
            let s = s.clone();
            Box::pin(async move { remote_start(&s, args).await })
        }),
    );

    let s = sock.clone();
    term.add_cmd(
        "stop",
        "Gracefully stop one or more tasks by name.",
        Box::new(move |args| {
            let s = s.clone();
            Box::pin(async move { remote_stop(&s, args).await })
        }),
    );

    let s = sock.clone();
    term.add_cmd(
        "reload",
        "Reload the daemon configuration.",
        Box::new(move |args| {
            let s = s.clone();
            Box::pin(async move { remote_reload(&s, args).await })
        }),
    );

    if let Ok(resp) = client_call(&sock, &Request::List).await {
        term.set_completions(completion_set(resp.names));
    }

    term.run().await?;
    Ok(())
}

/// A daemon reply carrying the service-closed sentinel means the same
/// thing as a dead socket: the daemon is going away.
fn service_closed(err: &CallError) -> bool {
    if err.is_connection_lost() {
        return true;
    }
    matches!(err, CallError::Daemon(msg) if *msg == Error::ServiceClosed.to_string())
}

/// A closed daemon is announced and ends the loop. Everything else is
/// shown as "<cmd>: <cause>".
fn report(cmd: &str, err: CallError) -> Result<(), TermError> {
    if service_closed(&err) {
        println!("service is closed");
        return Err(TermError::Exit);
    }
    println!("{cmd}: {err}");
    Err(TermError::Command(format!("{cmd}: {err}")))
}

async fn remote_status(sock: &Path, args: Vec<String>) -> Result<(), TermError> {
    let cmd = args[0].clone();
    let names: Vec<String> = if args.len() <= 1 || args[1] == "all" {
        match client_call(sock, &Request::List).await {
            Ok(r) => r.names,
            Err(e) => return report(&cmd, e),
        }
    } else {
        args[1..].to_vec()
    };

    let mut errs = Vec::new();
    for name in names {
        match remote_status_line(sock, &name).await {
            Ok(()) => {}
            Err(e) if service_closed(&e) => return report(&cmd, e),
            Err(e) => {
                println!("{cmd}: {e}");
                errs.push(e.to_string());
            }
        }
    }
    if errs.is_empty() {
        Ok(())
    } else {
        Err(TermError::Command(format!("{cmd}: {}", errs.join("; "))))
    }
}

async fn remote_status_line(sock: &Path, name: &str) -> Result<(), CallError> {
    let resp = client_call(sock, &Request::Status { name: name.to_string() }).await?;
    let status = resp.status.unwrap_or(ProcessStatus::Unknown);
    let pid = match client_call(sock, &Request::GetPid { name: name.to_string() }).await {
        Ok(r) => r.pid.unwrap_or(0),
        // Not running is a normal answer here, shown as pid 0.
        Err(CallError::Daemon(msg)) if msg != Error::ServiceClosed.to_string() => 0,
        Err(e) => return Err(e),
    };
    println!("{name:<NAME_WIDTH$} {status} {pid}");
    Ok(())
}

async fn remote_start(sock: &Path, args: Vec<String>) -> Result<(), TermError> {
    let cmd = args[0].clone();
    if args.len() <= 1 {
        println!("{cmd}: missing parameter");
        return Err(TermError::Command(format!("{cmd}: missing parameter")));
    }
    for name in &args[1..] {
        match client_call(sock, &Request::Start { name: name.clone() }).await {
            Ok(_) => println!("running task {name}"),
            Err(e) => return report(&cmd, e),
        }
    }
    Ok(())
}

async fn remote_stop(sock: &Path, args: Vec<String>) -> Result<(), TermError> {
    let cmd = args[0].clone();
    if args.len() <= 1 {
        println!("{cmd}: missing parameter");
        return Err(TermError::Command(format!("{cmd}: missing parameter")));
    }
    for name in &args[1..] {
        if let Err(e) = client_call(sock, &Request::Stop { name: name.clone() }).await {
            return report(&cmd, e);
        }
    }
    Ok(())
}

async fn remote_reload(sock: &Path, args: Vec<String>) -> Result<(), TermError> {
    let cmd = args[0].clone();
    match client_call(sock, &Request::ReloadConfig).await {
        Ok(resp) => {
            println!("config reloaded, changed: {}", resp.changed.unwrap_or(false));
            Ok(())
        }
        Err(e) => report(&cmd, e),
    }
}

// ---- Merged binary: supervisor and shell in one process ----

/// Entry point for the taskmaster binary: no socket, the editor calls
/// straight into the supervision engine.
pub async fn run_local(args: ShellArgs) -> anyhow::Result<()> {
    let cfg = Config::load(args.config.as_deref())?;

    let (log_path, log_file) = util::open_log_file()?;
    start_log_writer(log_file, &cfg.webhook);
    tm_event("boot", None, format!("taskmaster starting, log={}", log_path.display()));

    if !cfg.drop_to_user.is_empty() {
        let user = cfg.drop_to_user.clone();
        util::drop_to_user(&user)?;
        tm_event("boot", None, format!("dropped privileges to {user}"));
    }

    let sup = Supervisor::new(cfg);

    let spinner = util::Spinner::start("Auto starting tasks...");
    match sup.autostart().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tm_event("autostart", None, format!("errors: {e}")),
        Err(e) => tm_event("autostart", None, format!("batch panicked: {e}")),
    }
    spinner.stop().await;

    let mut term = Term::new();
    register_local_commands(&mut term, sup.clone());
    term.set_completions(completion_set(sup.list().await));

    spawn_shell_signal_listener(sup.clone(), term.stop_token());

    term.run().await?;

    if let Err(e) = sup.close().await {
        tm_event("close", None, format!("failed to close the service: {e}"));
        anyhow::bail!("shutdown errors: {e}");
    }
    Ok(())
}

fn register_local_commands(term: &mut Term, sup: Supervisor) {
    let s = sup.clone();
    term.add_cmd(
        "status",
        "Show the status of tasks (all when no names are given).",
        Box::new(move |args| {
            let s = s.clone();
            Box::pin(async move { local_status(s, args).await })
        }),
    );

    let s = sup.clone();
    term.add_cmd(
        "start",
        "Start one or more tasks by name.",
        Box::new(move |args| {
            let s = s.clone();
            Box::pin(async move { local_start(s, args).await })
        }),
    );

    let s = sup.clone();
    term.add_cmd(
        "stop",
        "Gracefully stop one or more tasks by name.",
        Box::new(move |args| {
            let s = s.clone();
            Box::pin(async move { local_stop(s, args).await })
        }),
    );

    let s = sup.clone();
    term.add_cmd(
        "reload",
        "Reload the configuration file.",
        Box::new(move |args| {
            let s = s.clone();
            Box::pin(async move { local_reload(s, args).await })
        }),
    );

    let s = sup;
    term.add_cmd(
        "info",
        "Print configured tasks, or one task's full descriptor.",
        Box::new(move |args| {
            let s = s.clone();
            Box::pin(async move { local_info(s, args).await })
        }),
    );
}

fn report_local(cmd: &str, err: Error) -> Result<(), TermError> {
    println!("{cmd}: {err}");
    Err(TermError::Command(format!("{cmd}: {err}")))
}

async fn local_status(sup: Supervisor, args: Vec<String>) -> Result<(), TermError> {
    let names: Vec<String> = if args.len() <= 1 || args[1] == "all" {
        sup.list().await
    } else {
        args[1..].to_vec()
    };
    for name in names {
        let status = sup.status(&name).await;
        let pid = sup.get_pid(&name).await.unwrap_or(0);
        println!("{name:<NAME_WIDTH$} {status} {pid}");
    }
    Ok(())
}

async fn local_start(sup: Supervisor, args: Vec<String>) -> Result<(), TermError> {
    let cmd = args[0].clone();
    if args.len() <= 1 {
        println!("{cmd}: missing parameter");
        return Err(TermError::Command(format!("{cmd}: missing parameter")));
    }
    for name in &args[1..] {
        match sup.start(name).await {
            Ok(()) => println!("running task {name}"),
            Err(e) => return report_local(&cmd, e),
        }
    }
    Ok(())
}

async fn local_stop(sup: Supervisor, args: Vec<String>) -> Result<(), TermError> {
    let cmd = args[0].clone();
    if args.len() <= 1 {
        println!("{cmd}: missing parameter");
        return Err(TermError::Command(format!("{cmd}: missing parameter")));
    }
    for name in &args[1..] {
        if let Err(e) = sup.stop(name).await {
            return report_local(&cmd, e);
        }
    }
    Ok(())
}

async fn local_reload(sup: Supervisor, args: Vec<String>) -> Result<(), TermError> {
    let cmd = args[0].clone();
    let (changed, res) = sup.reload().await;
    match res {
        Ok(()) => {
            println!("config reloaded, changed: {changed}");
            Ok(())
        }
        Err(e) => report_local(&cmd, e),
    }
}

async fn local_info(sup: Supervisor, args: Vec<String>) -> Result<(), TermError> {
    let cfg = sup.config().await;
    if args.len() <= 1 || args[1] == "all" {
        for name in cfg.tasks.keys() {
            println!("  - {name}");
        }
        return Ok(());
    }
    for name in &args[1..] {
        match cfg.tasks.get(name) {
            Some(task) => println!("{task}"),
            None => println!("task '{name}' not found"),
        }
        println!();
    }
    Ok(())
}

/// SIGINT and SIGTERM stop the editor, which lets the caller run the
/// shutdown sequence; SIGHUP reloads in place.
fn spawn_shell_signal_listener(sup: Supervisor, stop: CancellationToken) {
    tokio::spawn(async move {
        let mut term = unix_signal(SignalKind::terminate()).expect("SIGTERM handler");
        let mut int = unix_signal(SignalKind::interrupt()).expect("SIGINT handler");
        let mut hup = unix_signal(SignalKind::hangup()).expect("SIGHUP handler");
        loop {
            tokio::select! {
                _ = term.recv() => {
                    tm_event("signal", None, "SIGTERM, stopping editor");
                    stop.cancel();
                    return;
                }
                _ = int.recv() => {
                    tm_event("signal", None, "SIGINT, stopping editor");
                    stop.cancel();
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

/// Instance names plus their task prefixes, deduplicated, for tab
/// completion. Task names never contain an underscore, so the prefix
/// before the first one is the owning task.
fn completion_set(instances: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for name in instances {
        if let Some(task) = name.split('_').next() {
            if !out.iter().any(|t| t == task) {
                out.push(task.to_string());
            }
        }
        if !out.iter().any(|t| t == &name) {
            out.push(name);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_set_adds_task_prefixes() {
        let got = completion_set(vec!["web_00".into(), "web_01".into(), "db".into()]);
        assert_eq!(got, vec!["web".to_string(), "web_00".into(), "web_01".into(), "db".into()]);
    }
}
