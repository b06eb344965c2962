use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use nix::unistd::{setgid, setuid, Gid, Uid};
use tokio_util::sync::CancellationToken;

/// Opens the daemon log file at `$XDG_CACHE_HOME/taskmaster/taskmaster.log`
/// (fallback `~/.cache`), truncating any previous contents.
pub fn open_log_file() -> anyhow::Result<(PathBuf, std::fs::File)> {
    let dir = cache_dir()
        .context("cannot determine user cache dir")?
        .join("taskmaster");
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create cache dir {}", dir.display()))?;
    std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))
        .with_context(|| format!("failed to restrict cache dir {}", dir.display()))?;

    let path = dir.join("taskmaster.log");
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&path)
        .with_context(|| format!("failed to create log file {}", path.display()))?;
    Ok((path, file))
}

fn cache_dir() -> Option<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_CACHE_HOME") {
        if !xdg.trim().is_empty() {
            return Some(PathBuf::from(xdg));
        }
    }
    std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".cache"))
}

/// Drops root privileges to the named user, group first so the group
/// switch still has the permission to happen.
pub fn drop_to_user(username: &str) -> anyhow::Result<()> {
    let user = users::get_user_by_name(username)
        .with_context(|| format!("unknown user: {username}"))?;
    setgid(Gid::from_raw(user.primary_group_id())).context("failed to drop group privileges")?;
    setuid(Uid::from_raw(user.uid())).context("failed to drop user privileges")?;
    Ok(())
}

/// Terminal spinner shown while the autostart batch runs.
pub struct Spinner {
    done: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl Spinner {
    pub fn start(msg: &str) -> Spinner {
        let done = CancellationToken::new();
        let token = done.clone();
        let msg = msg.to_string();
        let handle = tokio::spawn(async move {
            let frames = ['|', '/', '-', '\\'];
            let mut idx = 0;
            let mut tick = tokio::time::interval(Duration::from_millis(100));
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {
                        print!("\r\x1b[2K{} {msg}", frames[idx]);
                        let _ = std::io::stdout().flush();
                        idx = (idx + 1) % frames.len();
                    }
                }
            }
        });
        Spinner { done, handle }
    }

    pub async fn stop(self) {
        self.done.cancel();
        let _ = self.handle.await;
        println!("\r\x1b[2KDone.");
    }
}
