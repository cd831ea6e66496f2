use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Barrier};
use std::thread;

use netspace_handle::*;
use tracing_subscriber::EnvFilter;

/// Check if running as root
fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Root alone is not enough inside restricted containers, so try unshare
/// on a throwaway thread
fn privileged() -> bool {
    is_root() && thread::spawn(|| NetNs::new().is_ok()).join().unwrap_or(false)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn scratch_config(tag: &str) -> (PathBuf, NetnsConfig) {
    let dir = std::env::temp_dir().join(format!("netspace-it-{}-{tag}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();

    // Same split as the defaults: created names and `ip netns` names apart
    let config = NetnsConfig::new()
        .with_run_dir(dir.join("ns"))
        .with_netns_dir(dir.join("netns"));
    std::fs::create_dir_all(&config.run_dir).unwrap();
    std::fs::create_dir_all(&config.netns_dir).unwrap();
    (dir, config)
}

/// Fresh anonymous namespace, created on a throwaway thread
fn fresh_namespace() -> NetNs {
    thread::spawn(|| {
        let origin = NetNs::current().unwrap();
        let ns = NetNs::new().unwrap();
        origin.enter().unwrap();
        ns
    })
    .join()
    .unwrap()
}

/// Create, switch back, close, and check the thread ends where it started.
fn get_new_set_close() {
    let origin = NetNs::current().unwrap();

    let mut fresh = NetNs::new().unwrap();
    assert!(!fresh.is_same(&origin), "new namespace matches the original");
    assert!(NetNs::current().unwrap().is_same(&fresh));

    origin.enter().unwrap();
    fresh.close().unwrap();
    assert!(!fresh.is_open());
    assert!(!fresh.is_same(&origin));

    let now = NetNs::current().unwrap();
    assert!(now.is_same(&origin), "thread did not return to the original namespace");
}

#[test]
fn test_unprivileged_new_is_refused() {
    if privileged() {
        eprintln!("Skipping: namespace creation is permitted");
        return;
    }

    let (unchanged, result) = thread::spawn(|| {
        let origin = NetNs::current().unwrap();
        let result = NetNs::new().map(|_| ());
        (origin.is_same(&NetNs::current().unwrap()), result)
    })
    .join()
    .unwrap();

    let err = result.unwrap_err();
    assert!(matches!(err, Error::PrivilegeOrKernel { .. }));
    assert!(err.is_permission_denied());
    assert!(unchanged, "failed unshare moved the thread");
}

#[test]
fn test_get_new_set_close() {
    if !privileged() {
        eprintln!("Skipping: requires root");
        return;
    }
    init_tracing();

    thread::spawn(get_new_set_close).join().unwrap();
}

#[test]
fn test_threaded() {
    if !privileged() {
        eprintln!("Skipping: requires root");
        return;
    }
    init_tracing();

    let workers = thread::available_parallelism().map_or(2, |n| n.get().max(2));
    let barrier = Arc::new(Barrier::new(workers));
    let origin = NetNs::current().unwrap();
    let origin_id = origin.id().unwrap();

    let handles: Vec<_> = (0..workers)
        .map(|_| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let start = NetNs::current().unwrap();
                let fresh = NetNs::new().unwrap();

                // Every worker now sits in its own namespace at the same time
                barrier.wait();
                let seen = NetNs::current().unwrap();
                assert!(seen.is_same(&fresh));
                let id = seen.id().unwrap();

                barrier.wait();
                start.enter().unwrap();
                assert!(NetNs::current().unwrap().is_same(&start));

                get_new_set_close();
                id
            })
        })
        .collect();

    let mut ids: Vec<NsId> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(ids.iter().all(|id| *id != origin_id));
    ids.sort_by_key(|id| (id.dev(), id.ino()));
    ids.dedup();
    assert_eq!(ids.len(), workers, "threads observed each other's namespace");

    assert!(NetNs::current().unwrap().is_same(&origin));
}

#[test]
fn test_enter_then_current() {
    if !privileged() {
        eprintln!("Skipping: requires root");
        return;
    }
    let target = fresh_namespace();

    thread::spawn(move || {
        let origin = NetNs::current().unwrap();

        target.enter().unwrap();
        assert!(NetNs::current().unwrap().is_same(&target));

        // Process-level path still reports the main thread's namespace
        let by_pid = NetNs::from_pid(ProcessId::current()).unwrap();
        assert!(by_pid.is_same(&origin));
        assert!(!by_pid.is_same(&target));

        origin.enter().unwrap();
    })
    .join()
    .unwrap();
}

#[test]
fn test_named_namespace_outlives_thread_switch() {
    if !privileged() {
        eprintln!("Skipping: requires root");
        return;
    }
    init_tracing();
    let (dir, config) = scratch_config("blue");

    let creator_config = config.clone();
    let named = thread::spawn(move || {
        let origin = NetNs::current().unwrap();
        let named = NetNs::new_named_in(&creator_config, "blue").unwrap();
        assert!(!named.is_same(&origin));
        assert!(NetNs::current().unwrap().is_same(&named));

        origin.enter().unwrap();
        named
    })
    .join()
    .unwrap();

    assert_eq!(named.path(), config.run_dir.join("blue"));

    let lookup_config = config.clone();
    let found = thread::spawn(move || NetNs::from_name_in(&lookup_config, "blue").unwrap())
        .join()
        .unwrap();
    assert!(found.is_same(&named));
    assert!(!found.is_same(&NetNs::current().unwrap()));

    NetNs::remove_named_in(&config, "blue").unwrap();
    assert!(!config.run_dir.join("blue").exists());

    // Open handles keep the namespace alive after the mount is gone
    assert!(found.is_same(&named));
    assert!(matches!(
        NetNs::from_name_in(&config, "blue"),
        Err(Error::NotFound { .. })
    ));

    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_named_collision_is_mount_conflict() {
    if !privileged() {
        eprintln!("Skipping: requires root");
        return;
    }
    let (dir, config) = scratch_config("collision");

    let first = NetNs::new_named_on_worker(&config, "shared").unwrap();
    let before = NetNs::current().unwrap();

    let err = NetNs::new_named_on_worker(&config, "shared").unwrap_err();
    assert!(matches!(err, Error::MountConflict { .. }));

    // Loser leaves the winner's mount intact
    let found = NetNs::from_name_in(&config, "shared").unwrap();
    assert!(found.is_same(&first));
    assert!(NetNs::current().unwrap().is_same(&before));

    NetNs::remove_named_in(&config, "shared").unwrap();
    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_new_named_on_worker_keeps_caller() {
    if !privileged() {
        eprintln!("Skipping: requires root");
        return;
    }
    let (dir, config) = scratch_config("worker");
    let before = NetNs::current().unwrap();

    let named = NetNs::new_named_on_worker(&config, "side").unwrap();

    assert!(!named.is_same(&before));
    assert!(NetNs::current().unwrap().is_same(&before));

    NetNs::remove_named_in(&config, "side").unwrap();
    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_run_switches_only_worker() {
    if !privileged() {
        eprintln!("Skipping: requires root");
        return;
    }
    let target = fresh_namespace();
    let before = NetNs::current().unwrap();

    let inside = target
        .run(|| NetNs::current().map(|ns| ns.id()).unwrap())
        .unwrap();

    assert_eq!(inside, target.id());
    assert!(NetNs::current().unwrap().is_same(&before));
}

#[test]
fn test_run_reports_panic() {
    if !privileged() {
        eprintln!("Skipping: requires root");
        return;
    }
    let target = fresh_namespace();

    let result: Result<()> = target.run(|| panic!("boom"));
    assert!(matches!(result, Err(Error::WorkerPanicked)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_async_leaves_runtime_threads_alone() {
    if !privileged() {
        eprintln!("Skipping: requires root");
        return;
    }
    let target = fresh_namespace();
    let before = NetNs::current().unwrap();

    let inside = target
        .run_async(|| NetNs::current().map(|ns| ns.id()).unwrap())
        .await
        .unwrap();

    assert_eq!(inside, target.id());
    assert!(NetNs::current().unwrap().is_same(&before));
}

#[test]
fn test_guard_restores_on_drop() {
    if !privileged() {
        eprintln!("Skipping: requires root");
        return;
    }
    let target = fresh_namespace();

    thread::spawn(move || {
        let origin = NetNs::current().unwrap();

        {
            let guard = target.enter_scoped().unwrap();
            assert!(guard.original().is_same(&origin));
            assert!(NetNs::current().unwrap().is_same(&target));
        }
        assert!(NetNs::current().unwrap().is_same(&origin));

        let guard = target.enter_scoped().unwrap();
        guard.restore().unwrap();
        assert!(NetNs::current().unwrap().is_same(&origin));
    })
    .join()
    .unwrap();
}

#[test]
fn test_named_default_layout_round_trip() {
    if !privileged() {
        eprintln!("Skipping: requires root");
        return;
    }
    init_tracing();
    std::fs::create_dir_all(DEFAULT_RUN_DIR).unwrap();
    let name = format!("netspace-it-{}", std::process::id());

    let worker_name = name.clone();
    let created = thread::spawn(move || {
        let origin = NetNs::current().unwrap();
        let created = NetNs::new_named(&worker_name).unwrap();
        origin.enter().unwrap();
        created
    })
    .join()
    .unwrap();
    assert_eq!(created.path(), Path::new(DEFAULT_RUN_DIR).join(&name));

    let found = NetNs::from_name(&name).unwrap();
    assert!(found.is_same(&created));

    NetNs::remove_named(&name).unwrap();
    assert!(matches!(NetNs::from_name(&name), Err(Error::NotFound { .. })));
}

const ROLLBACK_DIR_ENV: &str = "NETSPACE_ROLLBACK_DIR";

/// A user namespace that owns a network namespace but no mount namespace:
/// unshare(CLONE_NEWNET) is allowed there, mount(2) is not
fn user_namespace_command() -> Command {
    let mut cmd = Command::new("unshare");
    cmd.args(["--user", "--map-root-user", "--net", "--"]);
    cmd
}

fn user_namespaces_available() -> bool {
    user_namespace_command()
        .arg("true")
        .status()
        .is_ok_and(|status| status.success())
}

fn assert_bind_failure_rolls_back(dir: &Path) {
    let config = NetnsConfig::new().with_run_dir(dir);
    let target = dir.join("rollback");

    thread::spawn(move || {
        let origin = NetNs::current().unwrap();

        let err = NetNs::new_named_in(&config, "rollback").unwrap_err();
        assert!(matches!(err, Error::MountConflict { .. }), "unexpected error: {err}");

        assert!(!target.exists(), "mount point left behind");
        assert!(
            NetNs::current().unwrap().is_same(&origin),
            "thread stayed in the detached namespace"
        );
    })
    .join()
    .unwrap();
}

#[test]
fn test_failed_bind_mount_rolls_back() {
    // Re-executed inside the user namespace below
    if let Ok(dir) = std::env::var(ROLLBACK_DIR_ENV) {
        assert_bind_failure_rolls_back(Path::new(&dir));
        return;
    }

    if !user_namespaces_available() {
        eprintln!("Skipping: unprivileged user namespaces unavailable");
        return;
    }
    let (dir, config) = scratch_config("rollback");

    let status = user_namespace_command()
        .arg(std::env::current_exe().unwrap())
        .args(["--exact", "test_failed_bind_mount_rolls_back", "--test-threads=1", "--nocapture"])
        .env(ROLLBACK_DIR_ENV, &config.run_dir)
        .status()
        .unwrap();

    assert!(status.success(), "rollback checks failed inside user namespace");
    std::fs::remove_dir_all(&dir).unwrap();
}
