use std::fmt;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::tm::error::Error;
use crate::tm::task::Task;

/// Monotonic spawn epoch shared by every record. A watcher remembers the
/// epoch of the child it waits on and ignores the record if it has been
/// re-equipped or replaced since.
static SPAWN_EPOCH: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Unknown,
    Idle,
    Running,
    Exited,
    Stopped,
    Failed,
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessStatus::Unknown => "UNKNOWN",
            ProcessStatus::Idle => "IDLE",
            ProcessStatus::Running => "RUNNING",
            ProcessStatus::Exited => "EXITED",
            ProcessStatus::Stopped => "STOPPED",
            ProcessStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// One runtime instance of a task.
///
/// The record owns the child handle as a pid; the `tokio` child itself is
/// moved into the watcher task, which is the only waiter. The completion
/// channel is allocated fresh on every spawn and written exactly once by
/// that spawn's watcher.
pub(crate) struct Process {
    pub(crate) task: Arc<Task>,
    pub(crate) name: String,
    pub(crate) pid: Option<Pid>,
    pub(crate) epoch: u64,
    pub(crate) started_at: Instant,
    pub(crate) start_count: u32,
    pub(crate) status: ProcessStatus,
    pub(crate) done: mpsc::Receiver<Option<Error>>,
}

impl Process {
    pub(crate) fn new(name: String, task: Arc<Task>) -> Self {
        // The placeholder channel has no sender; it is replaced on spawn.
        let (_tx, rx) = mpsc::channel(1);
        Process {
            task,
            name,
            pid: None,
            epoch: 0,
            started_at: Instant::now(),
            start_count: 0,
            status: ProcessStatus::Idle,
            done: rx,
        }
    }

    /// Stamps the start time, bumps the attempt counter, and spawns the
    /// child. On success the pid slot is populated and the caller
    /// receives the child plus the sender half of a fresh completion
    /// channel, both destined for the watcher.
    pub(crate) fn start(&mut self) -> Result<(Child, mpsc::Sender<Option<Error>>), Error> {
        self.started_at = Instant::now();
        self.start_count += 1;

        let mut cmd = Command::new(&self.task.cmd);
        cmd.args(&self.task.args);
        cmd.arg0(&self.name);
        if let Some(dir) = &self.task.workingdir {
            cmd.current_dir(dir);
        }
        cmd.envs(&self.task.env);
        cmd.stdin(Stdio::null());
        cmd.stdout(self.stdio_for(self.task.stdout.as_deref())?);
        cmd.stderr(self.stdio_for(self.task.stderr.as_deref())?);
        cmd.kill_on_drop(true);

        if self.task.umask != 0 {
            let mask = self.task.umask as libc::mode_t;
            unsafe {
                cmd.pre_exec(move || {
                    nix::sys::stat::umask(nix::sys::stat::Mode::from_bits_truncate(mask));
                    Ok(())
                });
            }
        }

        let child = cmd.spawn().map_err(|e| Error::Spawn {
            name: self.name.clone(),
            source: e,
        })?;

        self.pid = child.id().map(|p| Pid::from_raw(p as i32));
        self.epoch = SPAWN_EPOCH.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(1);
        self.done = rx;
        Ok((child, tx))
    }

    fn stdio_for(&self, path: Option<&std::path::Path>) -> Result<Stdio, Error> {
        match path {
            // No path configured: the child shares the daemon's output,
            // which points at the log file once daemonized.
            None => Ok(Stdio::inherit()),
            Some(p) => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(p)
                    .map_err(|e| Error::Spawn {
                        name: self.name.clone(),
                        source: e,
                    })?;
                Ok(Stdio::from(file))
            }
        }
    }

    /// The child died before the start window elapsed and attempts
    /// remain. Only meaningful once the watcher observed the exit.
    pub(crate) fn should_retry_start(&self) -> bool {
        self.start_count < self.task.startretries
            && self.started_at.elapsed() < self.task.starttime
    }

    /// The child outlived the start window and the policy wants it back.
    /// A user stop is never auto-undone. Only meaningful once the
    /// watcher observed the exit.
    pub(crate) fn should_restart(&self, exit_code: i32) -> bool {
        self.started_at.elapsed() >= self.task.starttime
            && self.task.should_restart(exit_code)
            && self.status != ProcessStatus::Stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(task: Task) -> Process {
        Process::new("t".into(), Arc::new(task))
    }

    #[test]
    fn fresh_record_is_idle() {
        let p = record(Task::default());
        assert_eq!(p.status, ProcessStatus::Idle);
        assert!(p.pid.is_none());
        assert_eq!(p.start_count, 0);
    }

    #[test]
    fn retry_window_requires_remaining_attempts() {
        let mut p = record(Task { startretries: 2, starttime: Duration::from_secs(60), ..Task::default() });
        p.start_count = 1;
        assert!(p.should_retry_start());
        p.start_count = 2;
        assert!(!p.should_retry_start());
    }

    #[test]
    fn retry_window_closes_after_start_time() {
        let mut p = record(Task { startretries: 5, starttime: Duration::from_millis(0), ..Task::default() });
        p.start_count = 1;
        assert!(!p.should_retry_start());
    }

    #[test]
    fn restart_needs_elapsed_window_and_policy() {
        let task = Task {
            autorestart: crate::tm::task::AutoRestart::Always,
            starttime: Duration::from_millis(0),
            ..Task::default()
        };
        let mut p = record(task);
        assert!(p.should_restart(1));
        p.status = ProcessStatus::Stopped;
        assert!(!p.should_restart(1));
    }

    #[tokio::test]
    async fn start_populates_handle_and_completion() {
        let mut p = record(Task { cmd: "/bin/sleep".into(), args: vec!["5".into()], ..Task::default() });
        let (mut child, _tx) = p.start().unwrap();
        assert!(p.pid.is_some());
        assert_eq!(p.start_count, 1);
        assert!(p.epoch > 0);
        child.start_kill().unwrap();
        let _ = child.wait().await;
    }

    #[tokio::test]
    async fn spawn_failure_reports_the_instance() {
        let mut p = record(Task { cmd: "/no/such/binary".into(), ..Task::default() });
        match p.start() {
            Err(Error::Spawn { name, .. }) => assert_eq!(name, "t"),
            other => panic!("expected spawn error, got {other:?}"),
        }
    }
}
