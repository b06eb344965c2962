use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::tm::error::Error;
use crate::tm::task::{Task, MAX_NUM_PROCS};

/// Top-level configuration document: task descriptors plus the optional
/// webhook sink and privilege-drop user. Replaced atomically at reload.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub webhook: String,

    #[serde(default, rename = "dropToUser")]
    pub drop_to_user: String,

    #[serde(default)]
    pub tasks: BTreeMap<String, Task>,

    /// Where this document was loaded from; reload re-reads it.
    #[serde(skip)]
    pub path: PathBuf,
}

impl Config {
    /// Resolves the config path and loads it. An explicit path must
    /// exist; otherwise `./config.yaml` is tried first, then
    /// `$XDG_CONFIG_HOME/taskmaster/config.yaml`.
    pub fn load(explicit: Option<&Path>) -> Result<Config, Error> {
        let path = match explicit {
            Some(p) => {
                if !p.exists() {
                    return Err(Error::ConfigInvalid(format!("no such file: {}", p.display())));
                }
                p.to_path_buf()
            }
            None => search_paths()
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| Error::ConfigInvalid("missing config file".into()))?,
        };
        Self::load_from(&path)
    }

    /// Loads and validates the document at `path`.
    pub fn load_from(path: &Path) -> Result<Config, Error> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigInvalid(format!("failed to read {}: {e}", path.display())))?;
        let mut cfg: Config = serde_yaml::from_str(&raw)
            .map_err(|e| Error::ConfigInvalid(format!("failed to parse {}: {e}", path.display())))?;
        cfg.path = path.to_path_buf();
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&mut self) -> Result<(), Error> {
        for (name, task) in self.tasks.iter_mut() {
            if name.contains('_') {
                // The underscore is the instance separator.
                return Err(Error::ConfigInvalid(format!(
                    "unauthorized character in task name: {name}"
                )));
            }
            if task.cmd.trim().is_empty() {
                return Err(Error::ConfigInvalid(format!("task {name}: cmd is empty")));
            }
            if task.numprocs > MAX_NUM_PROCS {
                return Err(Error::ConfigInvalid(format!(
                    "too many processes: task {name} has {}",
                    task.numprocs
                )));
            }
            task.normalize();
            if let Err(e) = task.stop_signal() {
                return Err(Error::ConfigInvalid(format!("task {name}: {e}")));
            }
        }

        if !self.drop_to_user.is_empty()
            && users::get_user_by_name(&self.drop_to_user).is_none()
        {
            return Err(Error::ConfigInvalid(format!(
                "unknown user: {}",
                self.drop_to_user
            )));
        }

        if !self.webhook.is_empty() {
            reqwest::Url::parse(&self.webhook)
                .map_err(|e| Error::ConfigInvalid(format!("invalid webhook url: {e}")))?;
        }

        Ok(())
    }

    /// Structural equality over the task set. Webhook and privilege
    /// settings are fixed for the daemon lifetime and do not count.
    pub fn same_tasks(&self, other: &Config) -> bool {
        self.tasks == other.tasks
    }
}

fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("config.yaml")];
    if let Some(dir) = user_config_dir() {
        paths.push(dir.join("taskmaster").join("config.yaml"));
    }
    paths
}

fn user_config_dir() -> Option<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        if !xdg.trim().is_empty() {
            return Some(PathBuf::from(xdg));
        }
    }
    std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    fn write_config(doc: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(doc.as_bytes()).unwrap();
        f
    }

    #[test]
    fn loads_tasks_with_defaults() {
        let f = write_config(
            "tasks:\n  web:\n    cmd: /bin/sleep\n    args: [\"60\"]\n    autostart: true\n",
        );
        let cfg = Config::load_from(f.path()).unwrap();
        let t = &cfg.tasks["web"];
        assert_eq!(t.numprocs, 1);
        assert_eq!(t.starttime, Duration::from_secs(3));
        assert!(t.autostart);
        assert_eq!(cfg.path, f.path());
    }

    #[test]
    fn normalizes_zero_windows() {
        let f = write_config(
            "tasks:\n  w:\n    cmd: /bin/true\n    starttime: 0\n    stoptime: 0\n    numprocs: 0\n",
        );
        let cfg = Config::load_from(f.path()).unwrap();
        let t = &cfg.tasks["w"];
        assert_eq!(t.starttime, Duration::from_secs(3));
        assert_eq!(t.stoptime, Duration::from_secs(3));
        assert_eq!(t.numprocs, 1);
    }

    #[test]
    fn rejects_underscore_in_task_name() {
        let f = write_config("tasks:\n  a_b:\n    cmd: /bin/true\n");
        assert!(matches!(Config::load_from(f.path()), Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn rejects_numprocs_above_limit() {
        let f = write_config("tasks:\n  a:\n    cmd: /bin/true\n    numprocs: 100\n");
        assert!(matches!(Config::load_from(f.path()), Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn rejects_unknown_stop_signal() {
        let f = write_config("tasks:\n  a:\n    cmd: /bin/true\n    stopsignal: STOP\n");
        assert!(matches!(Config::load_from(f.path()), Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn rejects_missing_explicit_path() {
        let err = Config::load(Some(Path::new("/no/such/config.yaml"))).unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[test]
    fn same_tasks_ignores_webhook() {
        let f = write_config("webhook: \"\"\ntasks:\n  a:\n    cmd: /bin/true\n");
        let a = Config::load_from(f.path()).unwrap();
        let mut b = a.clone();
        b.webhook = "https://example.invalid/hook".into();
        assert!(a.same_tasks(&b));
        b.tasks.get_mut("a").unwrap().startretries = 9;
        assert!(!a.same_tasks(&b));
    }
}
