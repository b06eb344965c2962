use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::tm::config::Config;
use crate::tm::error::Error;
use crate::tm::log::tm_event;
use crate::tm::process::{Process, ProcessStatus};

// How long reload lets stopped children settle before their replacements
// are started through the ordinary start path.
const RELOAD_SETTLE: Duration = Duration::from_millis(500);

type OpFuture = Pin<Box<dyn Future<Output = Result<(), Error>> + Send>>;

struct Inner {
    cfg: Config,
    table: BTreeMap<String, Process>,
}

impl Inner {
    fn build_table(cfg: &Config) -> BTreeMap<String, Process> {
        let mut table = BTreeMap::new();
        for (name, task) in &cfg.tasks {
            let task = Arc::new(task.clone());
            for key in task.instance_names(name) {
                table.insert(key.clone(), Process::new(key, Arc::clone(&task)));
            }
        }
        table
    }

    /// Replaces the record with a fresh Idle one built from the same
    /// task, then stamps the given status. The completion channel is
    /// freshly allocated as part of the replacement.
    fn reset(&mut self, key: &str, status: ProcessStatus) {
        if let Some(rec) = self.table.get_mut(key) {
            let mut fresh = Process::new(rec.name.clone(), Arc::clone(&rec.task));
            fresh.status = status;
            *rec = fresh;
        }
    }
}

/// The supervision engine: owns the process table and drives every
/// lifecycle transition. Cheap to clone; all clones share the table.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Mutex<Inner>>,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new(cfg: Config) -> Supervisor {
        let table = Inner::build_table(&cfg);
        Supervisor {
            inner: Arc::new(Mutex::new(Inner { cfg, table })),
            cancel: CancellationToken::new(),
        }
    }

    /// True once close() has run; control handlers refuse new work.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn list(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner.table.keys().cloned().collect()
    }

    pub async fn status(&self, name: &str) -> ProcessStatus {
        let inner = self.inner.lock().await;
        inner.table.get(name).map(|r| r.status).unwrap_or(ProcessStatus::Unknown)
    }

    /// Snapshot of the active configuration.
    pub async fn config(&self) -> Config {
        self.inner.lock().await.cfg.clone()
    }

    pub async fn get_pid(&self, name: &str) -> Result<i32, Error> {
        let inner = self.inner.lock().await;
        let rec = inner.table.get(name).ok_or(Error::Unknown)?;
        let pid = rec.pid.ok_or(Error::Nil)?;
        if rec.status != ProcessStatus::Running {
            return Err(Error::NotRunning);
        }
        // Probe that the child is actually alive.
        kill(pid, None).map_err(|_| Error::NotRunning)?;
        Ok(pid.as_raw())
    }

    /// Starts every instance of the named task. Per-instance failures
    /// are joined into one error.
    pub async fn start(&self, name: &str) -> Result<(), Error> {
        let keys = {
            let inner = self.inner.lock().await;
            let task = inner.cfg.tasks.get(name).ok_or(Error::Unknown)?;
            task.instance_names(name)
        };
        self.batch(keys, |s, k| Box::pin(async move { s.start_instance(&k).await }))
            .await
    }

    /// Gracefully stops every instance of the named task.
    pub async fn stop(&self, name: &str) -> Result<(), Error> {
        let keys = {
            let inner = self.inner.lock().await;
            let task = inner.cfg.tasks.get(name).ok_or(Error::Unknown)?;
            task.instance_names(name)
        };
        self.batch(keys, |s, k| Box::pin(async move { s.stop_instance(&k).await }))
            .await
    }

    /// Spawns the autostart batch in the background and returns a waiter
    /// that resolves when every autostart task has been driven through
    /// the start protocol. Daemon readiness does not depend on child
    /// stabilization, but "fully up" stays observable.
    pub fn autostart(&self) -> JoinHandle<Result<(), Error>> {
        let sup = self.clone();
        tokio::spawn(async move {
            let names: Vec<String> = {
                let inner = sup.inner.lock().await;
                inner
                    .cfg
                    .tasks
                    .iter()
                    .filter(|(name, t)| {
                        t.autostart && inner.table.contains_key(&t.instance_names(name)[0])
                    })
                    .map(|(n, _)| n.clone())
                    .collect()
            };
            tm_event("autostart", None, format!("starting {} task(s)", names.len()));
            sup.batch(names, |s, n| Box::pin(async move { s.start(&n).await }))
                .await
        })
    }

    /// Stops every running instance, then cancels the supervisor's
    /// context so any straggler children are killed by their watchers.
    /// An instance that needed SIGKILL, or was already gone, is stopped
    /// either way and does not count as a shutdown failure.
    pub async fn close(&self) -> Result<(), Error> {
        let running: Vec<String> = {
            let inner = self.inner.lock().await;
            inner
                .table
                .iter()
                .filter(|(_, r)| r.pid.is_some())
                .map(|(k, _)| k.clone())
                .collect()
        };
        let res = self
            .batch(running, |s, k| {
                Box::pin(async move {
                    match s.stop_instance(&k).await {
                        Ok(()) | Err(Error::NotRunning) => Ok(()),
                        Err(e) if e.is_stopped_anyway() => Ok(()),
                        Err(e) => Err(e),
                    }
                })
            })
            .await;
        self.cancel.cancel();
        tm_event("close", None, "service closed");
        res
    }

    /// Re-reads the configuration and mutates the live process table
    /// with minimal disruption. Returns whether the effective
    /// configuration changed, plus the joined errors of all phases.
    pub async fn reload(&self) -> (bool, Result<(), Error>) {
        struct Plan {
            new_cfg: Config,
            removed: Vec<String>,
            restart: Vec<String>,
            added_autostart: Vec<String>,
        }

        let plan = {
            let inner = self.inner.lock().await;
            let new_cfg = match Config::load_from(&inner.cfg.path) {
                Ok(c) => c,
                Err(e) => return (false, Err(e)),
            };
            if inner.cfg.same_tasks(&new_cfg) {
                return (false, Ok(()));
            }

            // Instance key -> owning task name, for the new document.
            let mut new_keys: BTreeMap<String, String> = BTreeMap::new();
            for (tname, task) in &new_cfg.tasks {
                for key in task.instance_names(tname) {
                    new_keys.insert(key, tname.clone());
                }
            }

            let mut removed = Vec::new();
            let mut restart = Vec::new();
            for (key, rec) in &inner.table {
                match new_keys.get(key) {
                    None => {
                        if rec.pid.is_some() {
                            removed.push(key.clone());
                        }
                    }
                    Some(tname) => {
                        if rec.pid.is_some()
                            && rec.task.diff_requires_restart(&new_cfg.tasks[tname])
                        {
                            restart.push(key.clone());
                        }
                    }
                }
            }
            let added_autostart: Vec<String> = new_keys
                .iter()
                .filter(|(key, tname)| {
                    !inner.table.contains_key(key.as_str())
                        && new_cfg.tasks[tname.as_str()].autostart
                })
                .map(|(key, _)| key.clone())
                .collect();

            Plan { new_cfg, removed, restart, added_autostart }
        };

        let mut errs = Vec::new();

        // Stop instances that disappeared. A failure here aborts before
        // the swap; a child that needed SIGKILL or was already gone is
        // stopped either way and does not count.
        for key in &plan.removed {
            tm_event("reload", Some(key), "stopping removed instance");
            match self.stop_instance(key).await {
                Ok(()) | Err(Error::NotRunning) => {}
                Err(e) if e.is_stopped_anyway() => {}
                Err(e) => errs.push(e),
            }
        }
        if !errs.is_empty() {
            return (false, Err(Error::join(errs).expect("nonempty")));
        }

        // Stop instances whose task changed in a spawn-visible way; they
        // come back through the ordinary start path after the swap.
        for key in &plan.restart {
            tm_event("reload", Some(key), "stopping for restart");
            match self.stop_instance(key).await {
                Ok(()) | Err(Error::NotRunning) => {}
                Err(e) if e.is_stopped_anyway() => {}
                Err(e) => errs.push(e),
            }
        }
        if !plan.restart.is_empty() {
            tokio::time::sleep(RELOAD_SETTLE).await;
        }

        // Swap. Records whose task is unchanged in every spawn-visible
        // field are adopted into the new table, live child included;
        // their task reference moves to the new descriptor so policy
        // fields update silently.
        {
            let mut inner = self.inner.lock().await;
            let mut new_table = BTreeMap::new();
            for (tname, task) in &plan.new_cfg.tasks {
                let arc = Arc::new(task.clone());
                for key in task.instance_names(tname) {
                    let rec = match inner.table.remove(&key) {
                        Some(mut old) if !old.task.diff_requires_restart(task) => {
                            old.task = Arc::clone(&arc);
                            old
                        }
                        _ => Process::new(key.clone(), Arc::clone(&arc)),
                    };
                    new_table.insert(key, rec);
                }
            }
            inner.cfg = plan.new_cfg;
            inner.table = new_table;
        }
        tm_event("reload", None, "configuration swapped");

        // Start replacements and added autostart instances.
        for key in plan.restart.iter().chain(plan.added_autostart.iter()) {
            if let Err(e) = self.start_instance(key).await {
                errs.push(e);
            }
        }

        match Error::join(errs) {
            None => (true, Ok(())),
            Some(e) => (true, Err(e)),
        }
    }

    /// Fan-out helper: runs `op` for every name concurrently and joins
    /// the failures.
    async fn batch<F>(&self, names: Vec<String>, op: F) -> Result<(), Error>
    where
        F: Fn(Supervisor, String) -> OpFuture,
    {
        let mut set = JoinSet::new();
        for name in names {
            set.spawn(op(self.clone(), name));
        }
        let mut errs = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errs.push(e),
                Err(e) => errs.push(Error::Wait {
                    name: "batch".into(),
                    source: std::io::Error::other(e),
                }),
            }
        }
        match Error::join(errs) {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// The start protocol for one instance: spawn, give the child the
    /// start window to stabilize, retry early deaths up to the task's
    /// start-retries count.
    pub(crate) async fn start_instance(&self, key: &str) -> Result<(), Error> {
        let (attempts, window) = {
            let inner = self.inner.lock().await;
            let rec = inner.table.get(key).ok_or(Error::Unknown)?;
            if rec.pid.is_some() {
                return Err(Error::AlreadyStarted);
            }
            (rec.task.startretries.max(1), rec.task.starttime)
        };

        for attempt in 1..=attempts {
            let epoch = {
                let mut inner = self.inner.lock().await;
                let rec = inner.table.get_mut(key).ok_or(Error::Unknown)?;
                if rec.pid.is_some() {
                    // Raced with another caller that won the spawn.
                    return Err(Error::AlreadyStarted);
                }
                let (child, done_tx) = rec.start()?;
                tm_event(
                    "start",
                    Some(key),
                    format!(
                        "spawned pid={} attempt={attempt}/{attempts}",
                        rec.pid.map(|p| p.as_raw()).unwrap_or(-1)
                    ),
                );
                let epoch = rec.epoch;
                self.spawn_watcher(key.to_string(), child, done_tx, epoch);
                epoch
            };

            // The lock is released while the window runs so the watcher
            // can record an early death.
            tokio::time::sleep(window).await;

            {
                let mut inner = self.inner.lock().await;
                match inner.table.get_mut(key) {
                    None => return Err(Error::Unknown),
                    Some(rec) if rec.pid.is_some() && rec.epoch == epoch => {
                        rec.status = ProcessStatus::Running;
                        tm_event("start", Some(key), "status=running");
                        return Ok(());
                    }
                    Some(rec) if rec.status == ProcessStatus::Stopped => {
                        // Stopped by the user before stabilizing; never undo that.
                        return Err(Error::NotRunning);
                    }
                    Some(_) => {
                        // Died inside the window; the next iteration retries.
                    }
                }
            }
        }

        let mut inner = self.inner.lock().await;
        if let Some(rec) = inner.table.get_mut(key) {
            if rec.pid.is_none() {
                rec.status = ProcessStatus::Failed;
            }
        }
        tm_event("start", Some(key), "gave up, status=failed");
        Err(Error::NotRunning)
    }

    /// The stop protocol for one instance: configured signal, then a
    /// select between the watcher's completion delivery and the grace
    /// timer; the timer path escalates to SIGKILL. Resetting the record
    /// stays with the watcher.
    pub(crate) async fn stop_instance(&self, key: &str) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        let rec = inner.table.get_mut(key).ok_or(Error::Unknown)?;
        let pid = rec.pid.ok_or(Error::NotRunning)?;
        let sig = rec.task.stop_signal()?;
        let grace = rec.task.stoptime;

        match kill(pid, sig) {
            Ok(()) => {}
            // Exited just now; the watcher's completion is (or will be)
            // buffered, so fall through to the select.
            Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => return Err(Error::Signal { name: key.to_string(), source: e }),
        }
        tm_event("stop", Some(key), format!("signalled pid={pid} signal={sig}"));

        tokio::select! {
            delivered = rec.done.recv() => match delivered {
                Some(Some(err)) => Err(err),
                _ => Ok(()),
            },
            _ = tokio::time::sleep(grace) => {
                let _ = kill(pid, Signal::SIGKILL);
                tm_event("stop", Some(key), "grace elapsed, sent SIGKILL");
                Err(Error::ForciblyKilled(key.to_string()))
            }
        }
    }

    /// One watcher per spawned child: waits for the exit, delivers the
    /// outcome to the record's completion channel, then decides what
    /// happens to the record. The watcher is the single place a record
    /// is reset.
    fn spawn_watcher(
        &self,
        name: String,
        mut child: Child,
        done_tx: mpsc::Sender<Option<Error>>,
        epoch: u64,
    ) {
        let sup = self.clone();
        tokio::spawn(async move {
            let cancel = sup.cancel.clone();
            let wait_res = tokio::select! {
                r = child.wait() => r,
                _ = cancel.cancelled() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            let (code, signalled, payload): (i32, bool, Option<Error>) = match wait_res {
                Ok(status) => match status.code() {
                    Some(0) => (0, false, None),
                    Some(c) => (c, false, Some(Error::Exited { name: name.clone(), code: c })),
                    // Killed by a signal; treated as externally stopped.
                    None => (-1, true, None),
                },
                Err(e) => (1, false, Some(Error::Wait { name: name.clone(), source: e })),
            };

            // Deliver before touching the lock: a stop may be selecting
            // on this channel while it holds the lock.
            let _ = done_tx.try_send(payload);
            tm_event("watch", Some(&name), format!("exited code={code} signalled={signalled}"));

            enum Decision {
                Ignore,
                Reset(ProcessStatus),
                MarkRetry,
                Restart,
            }

            let mut inner = sup.inner.lock().await;
            let decision = match inner.table.get(&name) {
                None => Decision::Ignore,
                Some(rec) if rec.epoch != epoch => Decision::Ignore,
                Some(rec) => {
                    if signalled {
                        Decision::Reset(ProcessStatus::Stopped)
                    } else if code == 0 {
                        Decision::Reset(ProcessStatus::Exited)
                    } else if rec.should_retry_start() {
                        Decision::MarkRetry
                    } else if rec.should_restart(code) {
                        Decision::Restart
                    } else {
                        Decision::Reset(ProcessStatus::Exited)
                    }
                }
            };

            match decision {
                Decision::Ignore => {}
                Decision::Reset(status) => inner.reset(&name, status),
                Decision::MarkRetry => {
                    // Died before stabilizing with attempts left: clear
                    // the handle so the start loop performs the retry.
                    if let Some(rec) = inner.table.get_mut(&name) {
                        rec.pid = None;
                        rec.status = ProcessStatus::Failed;
                    }
                }
                Decision::Restart => {
                    inner.reset(&name, ProcessStatus::Idle);
                    drop(inner);
                    tm_event("watch", Some(&name), "policy wants a restart");
                    let sup2 = sup.clone();
                    let key = name.clone();
                    tokio::spawn(async move {
                        if let Err(e) = sup2.start_instance(&key).await {
                            tm_event("watch", Some(&key), format!("restart failed: {e}"));
                        }
                    });
                }
            }
        });
    }
}
