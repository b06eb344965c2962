use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use nix::sys::signal::Signal;
use serde::{Deserialize, Deserializer};

use crate::tm::error::Error;

pub const MAX_NUM_PROCS: u32 = 99;

pub(crate) const DEFAULT_WINDOW: Duration = Duration::from_secs(3);
pub(crate) const DEFAULT_START_RETRIES: u32 = 3;

/// Restart policy evaluated by the watcher after a child exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoRestart {
    Always,
    #[default]
    Never,
    Unexpected,
}

/// Immutable descriptor for one program that should be kept running.
///
/// Durations are written as integer seconds in YAML and normalized at
/// load time; zero values fall back to the 3 second default.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Task {
    pub cmd: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Number of instances to keep running, 1 to 99.
    #[serde(default = "default_numprocs")]
    pub numprocs: u32,

    /// Umask applied to the child at spawn; 0 inherits the daemon's.
    #[serde(default)]
    pub umask: u32,

    #[serde(default)]
    pub workingdir: Option<PathBuf>,

    #[serde(default)]
    pub autostart: bool,

    #[serde(default)]
    pub autorestart: AutoRestart,

    /// Exit codes considered an expected exit. Empty means {0}.
    #[serde(default)]
    pub exitcodes: Vec<i32>,

    #[serde(default = "default_start_retries")]
    pub startretries: u32,

    /// How long a fresh child must stay alive to count as started.
    #[serde(default = "default_window", deserialize_with = "de_secs")]
    pub starttime: Duration,

    /// Signal name used for graceful stop; empty means TERM.
    #[serde(default)]
    pub stopsignal: String,

    /// Grace period after the stop signal before SIGKILL.
    #[serde(default = "default_window", deserialize_with = "de_secs")]
    pub stoptime: Duration,

    #[serde(default)]
    pub stdout: Option<PathBuf>,

    #[serde(default)]
    pub stderr: Option<PathBuf>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_numprocs() -> u32 {
    1
}

fn default_start_retries() -> u32 {
    DEFAULT_START_RETRIES
}

fn default_window() -> Duration {
    DEFAULT_WINDOW
}

fn de_secs<'de, D>(d: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = u64::deserialize(d)?;
    Ok(Duration::from_secs(secs))
}

impl Default for Task {
    fn default() -> Self {
        Task {
            cmd: String::new(),
            args: Vec::new(),
            numprocs: 1,
            umask: 0,
            workingdir: None,
            autostart: false,
            autorestart: AutoRestart::default(),
            exitcodes: Vec::new(),
            startretries: DEFAULT_START_RETRIES,
            starttime: DEFAULT_WINDOW,
            stopsignal: String::new(),
            stoptime: DEFAULT_WINDOW,
            stdout: None,
            stderr: None,
            env: BTreeMap::new(),
        }
    }
}

impl Task {
    /// True when reloading from `self` to `other` must restart a running
    /// child. Policy fields (autostart, autorestart, exitcodes, retries,
    /// windows, stopsignal) update in place without disturbing children;
    /// everything the child observed at spawn does not.
    pub fn diff_requires_restart(&self, other: &Task) -> bool {
        self.cmd != other.cmd
            || self.args != other.args
            || self.numprocs != other.numprocs
            || self.umask != other.umask
            || self.workingdir != other.workingdir
            || self.stdout != other.stdout
            || self.stderr != other.stderr
            || self.env != other.env
    }

    pub fn is_expected_exit_code(&self, code: i32) -> bool {
        if self.exitcodes.is_empty() {
            return code == 0;
        }
        self.exitcodes.contains(&code)
    }

    pub fn should_restart(&self, exit_code: i32) -> bool {
        match self.autorestart {
            AutoRestart::Always => true,
            AutoRestart::Never => false,
            AutoRestart::Unexpected => !self.is_expected_exit_code(exit_code),
        }
    }

    /// Translates the configured stop signal name. Accepts the name with
    /// or without the SIG prefix; empty defaults to TERM.
    pub fn stop_signal(&self) -> Result<Signal, Error> {
        match self.stopsignal.as_str() {
            "" | "TERM" | "SIGTERM" => Ok(Signal::SIGTERM),
            "INT" | "SIGINT" => Ok(Signal::SIGINT),
            "KILL" | "SIGKILL" => Ok(Signal::SIGKILL),
            "HUP" | "SIGHUP" => Ok(Signal::SIGHUP),
            "USR1" | "SIGUSR1" => Ok(Signal::SIGUSR1),
            "USR2" | "SIGUSR2" => Ok(Signal::SIGUSR2),
            other => Err(Error::UnsupportedSignal(other.to_string())),
        }
    }

    /// Instance names for this task: the bare task name when numprocs is
    /// 1, otherwise `name_00 .. name_NN`.
    pub fn instance_names(&self, name: &str) -> Vec<String> {
        if self.numprocs <= 1 {
            return vec![name.to_string()];
        }
        (0..self.numprocs).map(|i| format!("{name}_{i:02}")).collect()
    }

    /// Replaces zero windows with the default so both stay strictly
    /// positive, and lifts numprocs 0 to 1. Called by the loader.
    pub(crate) fn normalize(&mut self) {
        if self.numprocs == 0 {
            self.numprocs = 1;
        }
        if self.starttime.is_zero() {
            self.starttime = DEFAULT_WINDOW;
        }
        if self.stoptime.is_zero() {
            self.stoptime = DEFAULT_WINDOW;
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Cmd: {}", self.cmd)?;
        writeln!(f, "  Args: {}", self.args.join(" "))?;
        writeln!(f, "  NumProcs: {}", self.numprocs)?;
        writeln!(f, "  Umask: {:o}", self.umask)?;
        writeln!(
            f,
            "  WorkingDir: {}",
            self.workingdir.as_deref().map(|p| p.display().to_string()).unwrap_or_default()
        )?;
        writeln!(f, "  AutoStart: {}", self.autostart)?;
        writeln!(f, "  AutoRestart: {:?}", self.autorestart)?;
        writeln!(f, "  ExitCodes: {:?}", self.exitcodes)?;
        writeln!(f, "  StartRetries: {}", self.startretries)?;
        writeln!(f, "  StartTime: {:?}", self.starttime)?;
        writeln!(f, "  StopSignal: {}", self.stopsignal)?;
        writeln!(f, "  StopTime: {:?}", self.stoptime)?;
        writeln!(
            f,
            "  Stdout: {}",
            self.stdout.as_deref().map(|p| p.display().to_string()).unwrap_or_default()
        )?;
        writeln!(
            f,
            "  Stderr: {}",
            self.stderr.as_deref().map(|p| p.display().to_string()).unwrap_or_default()
        )?;
        write!(f, "  Env: {:?}", self.env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_defaults() {
        let t: Task = serde_yaml::from_str("cmd: /bin/true\n").unwrap();
        assert_eq!(t.numprocs, 1);
        assert_eq!(t.startretries, 3);
        assert_eq!(t.starttime, Duration::from_secs(3));
        assert_eq!(t.stoptime, Duration::from_secs(3));
        assert_eq!(t.autorestart, AutoRestart::Never);
        assert!(!t.autostart);
    }

    #[test]
    fn equality_covers_every_field() {
        let a = Task { cmd: "echo".into(), ..Task::default() };
        let mut b = a.clone();
        assert_eq!(a, b);
        b.startretries = 5;
        assert_ne!(a, b);
    }

    #[test]
    fn policy_only_diff_does_not_require_restart() {
        let a = Task { cmd: "echo".into(), ..Task::default() };
        let mut b = a.clone();
        b.autorestart = AutoRestart::Always;
        b.exitcodes = vec![0, 2];
        b.startretries = 9;
        b.stopsignal = "INT".into();
        b.autostart = true;
        assert!(!a.diff_requires_restart(&b));
    }

    #[test]
    fn spawn_visible_diff_requires_restart() {
        let a = Task { cmd: "echo".into(), ..Task::default() };

        let mut b = a.clone();
        b.args = vec!["hello".into()];
        assert!(a.diff_requires_restart(&b));

        let mut c = a.clone();
        c.env.insert("KEY".into(), "value".into());
        assert!(a.diff_requires_restart(&c));

        let mut d = a.clone();
        d.numprocs = 2;
        assert!(a.diff_requires_restart(&d));
    }

    #[test]
    fn should_restart_matrix() {
        let mut t = Task::default();

        t.autorestart = AutoRestart::Always;
        assert!(t.should_restart(0));
        assert!(t.should_restart(7));

        t.autorestart = AutoRestart::Never;
        assert!(!t.should_restart(7));

        t.autorestart = AutoRestart::Unexpected;
        assert!(!t.should_restart(0));
        assert!(t.should_restart(7));

        t.exitcodes = vec![0, 7];
        assert!(!t.should_restart(7));
        assert!(t.should_restart(1));
    }

    #[test]
    fn expected_exit_defaults_to_zero() {
        let t = Task::default();
        assert!(t.is_expected_exit_code(0));
        assert!(!t.is_expected_exit_code(1));
    }

    #[test]
    fn stop_signal_closed_set() {
        let mut t = Task::default();
        assert_eq!(t.stop_signal().unwrap(), Signal::SIGTERM);
        t.stopsignal = "SIGUSR2".into();
        assert_eq!(t.stop_signal().unwrap(), Signal::SIGUSR2);
        t.stopsignal = "STOP".into();
        assert!(matches!(t.stop_signal(), Err(Error::UnsupportedSignal(_))));
    }

    #[test]
    fn instance_naming() {
        let mut t = Task::default();
        assert_eq!(t.instance_names("web"), vec!["web"]);
        t.numprocs = 3;
        assert_eq!(t.instance_names("web"), vec!["web_00", "web_01", "web_02"]);
    }
}
