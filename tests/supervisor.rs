use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};

use taskmaster::tm::config::Config;
use taskmaster::tm::error::Error;
use taskmaster::tm::process::ProcessStatus;
use taskmaster::tm::supervisor::Supervisor;
use taskmaster::tm::task::{AutoRestart, Task};

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn config_with(tasks: Vec<(&str, Task)>) -> Config {
    let mut map = BTreeMap::new();
    for (name, task) in tasks {
        map.insert(name.to_string(), task);
    }
    Config { tasks: map, ..Config::default() }
}

fn sleeper(start_window: Duration) -> Task {
    Task {
        cmd: "/bin/sleep".into(),
        args: vec!["60".into()],
        starttime: start_window,
        stoptime: Duration::from_secs(2),
        ..Task::default()
    }
}

async fn wait_for_status(
    sup: &Supervisor,
    name: &str,
    want: ProcessStatus,
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if sup.status(name).await == want {
            return true;
        }
        tokio::time::sleep(ms(25)).await;
    }
    false
}

async fn wait_for_other_pid(
    sup: &Supervisor,
    name: &str,
    old: i32,
    timeout: Duration,
) -> Option<i32> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Ok(pid) = sup.get_pid(name).await {
            if pid != old {
                return Some(pid);
            }
        }
        tokio::time::sleep(ms(25)).await;
    }
    None
}

#[tokio::test]
async fn stable_child_starts_and_stops_on_request() {
    let sup = Supervisor::new(config_with(vec![("t", sleeper(ms(100)))]));

    sup.start("t").await.unwrap();
    assert_eq!(sup.status("t").await, ProcessStatus::Running);
    assert!(sup.list().await.contains(&"t".to_string()));
    let pid = sup.get_pid("t").await.unwrap();
    assert!(pid > 0);

    sup.stop("t").await.unwrap();
    assert!(wait_for_status(&sup, "t", ProcessStatus::Stopped, ms(1000)).await);
    assert!(matches!(sup.get_pid("t").await, Err(Error::Nil)));
}

#[tokio::test]
async fn crash_loop_exhausts_retries_and_fails() {
    let task = Task {
        cmd: "/bin/false".into(),
        startretries: 3,
        starttime: ms(200),
        ..Task::default()
    };
    let sup = Supervisor::new(config_with(vec![("t", task)]));

    let begin = Instant::now();
    let err = sup.start("t").await.unwrap_err();
    assert_eq!(err.to_string(), "process is not running");
    // Three attempts, each bounded by the 200 ms window.
    assert!(begin.elapsed() >= ms(400));
    assert_eq!(sup.status("t").await, ProcessStatus::Failed);
}

#[tokio::test]
async fn unexpected_exit_triggers_restart_with_new_pid() {
    let task = Task {
        cmd: "/bin/sh".into(),
        args: vec!["-c".into(), "sleep 0.2; exit 7".into()],
        autorestart: AutoRestart::Unexpected,
        startretries: 1,
        starttime: ms(50),
        ..Task::default()
    };
    let sup = Supervisor::new(config_with(vec![("t", task)]));

    sup.start("t").await.unwrap();
    let first = sup.get_pid("t").await.unwrap();

    let second = wait_for_other_pid(&sup, "t", first, Duration::from_secs(2))
        .await
        .expect("watcher should have restarted the task");
    assert_ne!(first, second);

    // A graceful stop ends the restart cycle; a user stop is final. The
    // child may be mid-respawn, so retry until a live one is caught.
    for _ in 0..20 {
        if sup.stop("t").await.is_ok() {
            break;
        }
        tokio::time::sleep(ms(50)).await;
    }
    assert!(wait_for_status(&sup, "t", ProcessStatus::Stopped, ms(1000)).await);
}

#[tokio::test]
async fn expected_exit_does_not_restart() {
    let task = Task {
        cmd: "/bin/sh".into(),
        args: vec!["-c".into(), "sleep 0.2; exit 7".into()],
        autorestart: AutoRestart::Unexpected,
        exitcodes: vec![0, 7],
        startretries: 1,
        starttime: ms(50),
        ..Task::default()
    };
    let sup = Supervisor::new(config_with(vec![("t", task)]));

    sup.start("t").await.unwrap();
    assert!(wait_for_status(&sup, "t", ProcessStatus::Exited, Duration::from_secs(1)).await);
    assert!(matches!(sup.get_pid("t").await, Err(Error::Nil)));
}

#[tokio::test]
async fn stop_is_idempotent() {
    let sup = Supervisor::new(config_with(vec![("t", sleeper(ms(100)))]));

    sup.start("t").await.unwrap();
    sup.stop("t").await.unwrap();
    assert!(wait_for_status(&sup, "t", ProcessStatus::Stopped, ms(1000)).await);

    let err = sup.stop("t").await.unwrap_err();
    assert_eq!(err.to_string(), "process is not running");
    assert_eq!(sup.status("t").await, ProcessStatus::Stopped);
}

#[tokio::test]
async fn double_start_reports_already_started() {
    let sup = Supervisor::new(config_with(vec![("t", sleeper(ms(100)))]));

    sup.start("t").await.unwrap();
    let err = sup.start("t").await.unwrap_err();
    assert_eq!(err.to_string(), "process already started");

    let _ = sup.stop("t").await;
}

#[tokio::test]
async fn unknown_task_is_rejected() {
    let sup = Supervisor::new(config_with(vec![("t", sleeper(ms(100)))]));
    assert_eq!(sup.start("nope").await.unwrap_err().to_string(), "process unknown");
    assert_eq!(sup.stop("nope").await.unwrap_err().to_string(), "process unknown");
    assert_eq!(sup.status("nope").await, ProcessStatus::Unknown);
}

#[tokio::test]
async fn kill_stop_signal_skips_the_grace_dance() {
    let task = Task {
        cmd: "/bin/sleep".into(),
        args: vec!["60".into()],
        starttime: ms(100),
        stopsignal: "KILL".into(),
        stoptime: Duration::from_secs(2),
        ..Task::default()
    };
    let sup = Supervisor::new(config_with(vec![("t", task)]));

    sup.start("t").await.unwrap();
    let begin = Instant::now();
    sup.stop("t").await.unwrap();
    assert!(begin.elapsed() < Duration::from_secs(2));
    assert!(wait_for_status(&sup, "t", ProcessStatus::Stopped, ms(1000)).await);
}

#[tokio::test]
async fn stubborn_child_is_forcibly_killed() {
    // Traps TERM and keeps sleeping; only SIGKILL ends it.
    let task = Task {
        cmd: "/bin/sh".into(),
        args: vec!["-c".into(), "trap '' TERM; sleep 60".into()],
        starttime: ms(100),
        stoptime: ms(300),
        ..Task::default()
    };
    let sup = Supervisor::new(config_with(vec![("t", task)]));

    sup.start("t").await.unwrap();
    let err = sup.stop("t").await.unwrap_err();
    assert!(err.to_string().contains("forcibly killed"));
    assert!(wait_for_status(&sup, "t", ProcessStatus::Stopped, ms(1000)).await);
}

#[tokio::test]
async fn multi_process_task_gets_numbered_instances() {
    let task = Task {
        numprocs: 3,
        ..sleeper(ms(100))
    };
    let sup = Supervisor::new(config_with(vec![("t", task)]));

    let names = sup.list().await;
    assert_eq!(names, vec!["t_00".to_string(), "t_01".into(), "t_02".into()]);

    sup.start("t").await.unwrap();
    let mut pids = Vec::new();
    for name in &names {
        pids.push(sup.get_pid(name).await.unwrap());
    }
    pids.sort_unstable();
    pids.dedup();
    assert_eq!(pids.len(), 3);

    sup.stop("t").await.unwrap();
    for name in &names {
        assert!(wait_for_status(&sup, name, ProcessStatus::Stopped, ms(1000)).await);
    }
}

#[tokio::test]
async fn autostart_batch_starts_flagged_tasks_only() {
    let auto = Task { autostart: true, ..sleeper(ms(100)) };
    let manual = sleeper(ms(100));
    let sup = Supervisor::new(config_with(vec![("auto", auto), ("manual", manual)]));

    sup.autostart().await.unwrap().unwrap();
    assert_eq!(sup.status("auto").await, ProcessStatus::Running);
    assert_eq!(sup.status("manual").await, ProcessStatus::Idle);

    let _ = sup.stop("auto").await;
}

#[tokio::test]
async fn close_stops_everything_and_refuses_further_work() {
    let sup = Supervisor::new(config_with(vec![("t", sleeper(ms(100)))]));
    sup.start("t").await.unwrap();

    sup.close().await.unwrap();
    assert!(sup.is_closed());
    assert!(wait_for_status(&sup, "t", ProcessStatus::Stopped, ms(1000)).await);
}

#[tokio::test]
async fn close_tolerates_a_forcibly_killed_child() {
    // Ignores TERM, so shutdown has to escalate to SIGKILL. That is
    // still a normal shutdown, not a failure.
    let task = Task {
        cmd: "/bin/sh".into(),
        args: vec!["-c".into(), "trap '' TERM; sleep 60".into()],
        starttime: ms(100),
        stoptime: ms(300),
        ..Task::default()
    };
    let sup = Supervisor::new(config_with(vec![("t", task)]));
    sup.start("t").await.unwrap();

    sup.close().await.unwrap();
    assert!(sup.is_closed());
    assert!(wait_for_status(&sup, "t", ProcessStatus::Stopped, ms(1000)).await);
}

// ---- Reload scenarios drive the supervisor through a real config file ----

fn write_config(path: &Path, doc: &str) {
    std::fs::write(path, doc).unwrap();
}

#[tokio::test]
async fn noop_reload_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    write_config(
        &path,
        "tasks:\n  t:\n    cmd: /bin/sleep\n    args: [\"60\"]\n    starttime: 1\n",
    );
    let sup = Supervisor::new(Config::load_from(&path).unwrap());

    sup.start("t").await.unwrap();
    let pid = sup.get_pid("t").await.unwrap();

    let (changed, res) = sup.reload().await;
    assert!(!changed);
    res.unwrap();
    assert_eq!(sup.get_pid("t").await.unwrap(), pid);

    let _ = sup.stop("t").await;
}

#[tokio::test]
async fn policy_only_reload_keeps_the_child() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    write_config(
        &path,
        "tasks:\n  t:\n    cmd: /bin/sleep\n    args: [\"60\"]\n    starttime: 1\n    autorestart: never\n",
    );
    let sup = Supervisor::new(Config::load_from(&path).unwrap());

    sup.start("t").await.unwrap();
    let pid = sup.get_pid("t").await.unwrap();

    write_config(
        &path,
        "tasks:\n  t:\n    cmd: /bin/sleep\n    args: [\"60\"]\n    starttime: 1\n    autorestart: always\n    startretries: 9\n",
    );
    let (changed, res) = sup.reload().await;
    assert!(changed);
    res.unwrap();

    // Same child, new policy.
    assert_eq!(sup.get_pid("t").await.unwrap(), pid);
    assert_eq!(sup.status("t").await, ProcessStatus::Running);

    let _ = sup.stop("t").await;
}

#[tokio::test]
async fn spawn_visible_reload_restarts_the_child() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    write_config(
        &path,
        "tasks:\n  t:\n    cmd: /bin/sleep\n    args: [\"60\"]\n    starttime: 1\n",
    );
    let sup = Supervisor::new(Config::load_from(&path).unwrap());

    sup.start("t").await.unwrap();
    let pid = sup.get_pid("t").await.unwrap();

    write_config(
        &path,
        "tasks:\n  t:\n    cmd: /bin/sleep\n    args: [\"61\"]\n    starttime: 1\n",
    );
    let (changed, res) = sup.reload().await;
    assert!(changed);
    res.unwrap();

    let new_pid = sup.get_pid("t").await.unwrap();
    assert_ne!(pid, new_pid);

    let _ = sup.stop("t").await;
}

#[tokio::test]
async fn rename_reload_swaps_the_instance_set() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    write_config(
        &path,
        "tasks:\n  a:\n    cmd: /bin/sleep\n    args: [\"60\"]\n    starttime: 1\n",
    );
    let sup = Supervisor::new(Config::load_from(&path).unwrap());

    sup.start("a").await.unwrap();

    write_config(
        &path,
        "tasks:\n  b:\n    cmd: /bin/sleep\n    args: [\"60\"]\n    starttime: 1\n    autostart: true\n",
    );
    let (changed, res) = sup.reload().await;
    assert!(changed);
    res.unwrap();

    assert_eq!(sup.list().await, vec!["b".to_string()]);
    assert_eq!(sup.status("a").await, ProcessStatus::Unknown);
    assert_eq!(sup.status("b").await, ProcessStatus::Running);

    let _ = sup.stop("b").await;
}
