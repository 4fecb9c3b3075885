//! End-to-end checks against real worker processes (spawned by re-exec'ing
//! this very test binary). `harness = false` in Cargo.toml is what lets
//! this file have a plain `fn main` that calls `run_worker_if_invoked()`
//! before anything else -- the default libtest harness doesn't give a hook
//! early enough for that.
//!
//! Linux-only: worker discovery for the shutdown checks below scans
//! `/proc`, which only exists there. The rest of the crate is Unix-general.

use std::time::Duration;

use parallel_exec::context::{cache_scope, current, ContextOptions};
use parallel_exec::{register_retire, remote_task, run_sync, run_worker_if_invoked, RemoteTask};

struct Square;
impl RemoteTask for Square {
    const NAME: &'static str = "worker_lifecycle::square";
    type Args = i64;
    type Output = i64;
    fn call(n: i64) -> i64 {
        n * n
    }
}
remote_task!(Square);

struct DivByZero;
impl RemoteTask for DivByZero {
    const NAME: &'static str = "worker_lifecycle::div_by_zero";
    type Args = ();
    type Output = i64;
    fn call(_: ()) -> i64 {
        let zero = std::hint::black_box(0);
        1 / zero
    }
}
remote_task!(DivByZero);

struct BusyLoop;
impl RemoteTask for BusyLoop {
    const NAME: &'static str = "worker_lifecycle::busy_loop";
    type Args = u64;
    type Output = ();
    fn call(millis: u64) {
        std::thread::sleep(Duration::from_millis(millis));
    }
}
remote_task!(BusyLoop);

fn retire_after_three() -> bool {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static COUNT: AtomicUsize = AtomicUsize::new(0);
    COUNT.fetch_add(1, Ordering::SeqCst) >= 3
}
register_retire!("worker_lifecycle::retire_after_three", retire_after_three);

fn main() {
    run_worker_if_invoked();
    let _ = env_logger::try_init();

    let rt = tokio::runtime::Runtime::new().expect("build tokio runtime");
    rt.block_on(async {
        round_trip().await;
        user_panic_is_reported_and_worker_reused().await;
        lifo_reuse().await;
        cancellable_kills_worker().await;
        scope_isolation_and_clean_exit().await;
    });

    println!("worker_lifecycle: all checks passed");
}

async fn round_trip() {
    let result = run_sync::<Square>(7, false, None).await.unwrap();
    assert_eq!(result, 49, "S1: run_sync(square, 7) should be 49");
}

async fn user_panic_is_reported_and_worker_reused() {
    let before = current().cache.len();
    let err = run_sync::<DivByZero>((), false, None).await.unwrap_err();
    assert!(
        matches!(err, parallel_exec::BrokenWorker::UserPanic { .. }),
        "S2: division by zero should surface as a user panic, got {err:?}"
    );
    // A user-function failure returns the worker to the cache instead of
    // killing it.
    assert_eq!(
        current().cache.len(),
        before + 1,
        "worker that only saw a user panic should still be cached"
    );
}

async fn lifo_reuse() {
    // Drain whatever's cached from earlier checks so this one starts clean.
    let ctx = current();
    while ctx.cache.pop().is_some() {}

    run_sync::<Square>(1, false, None).await.unwrap();
    run_sync::<Square>(2, false, None).await.unwrap();
    assert_eq!(
        ctx.cache.len(),
        1,
        "successive sequential calls should reuse one worker, not accumulate two"
    );
}

async fn cancellable_kills_worker() {
    let before = worker_process_count();
    let task = tokio::spawn(run_sync::<BusyLoop>(2_000, true, None));
    tokio::time::sleep(Duration::from_millis(50)).await;
    task.abort();
    let _ = task.await;

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if worker_process_count() <= before {
            break;
        }
        if std::time::Instant::now() > deadline {
            panic!("S3: cancelled worker process did not exit within grace period");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn scope_isolation_and_clean_exit() {
    let before = worker_process_count();
    let result = cache_scope(
        ContextOptions {
            idle_timeout: Duration::from_millis(100),
            ..ContextOptions::default()
        },
        || async {
            run_sync::<Square>(3, false, None).await.unwrap();
        },
    )
    .await;
    assert!(result.is_ok(), "scope with healthy workers should exit cleanly");

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if worker_process_count() <= before {
            break;
        }
        if std::time::Instant::now() > deadline {
            panic!("S5/S9: scope exit should leave no orphaned worker processes");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Number of live processes carrying our worker-marker env var. Used as a
/// Linux-specific proxy for "how many of our worker processes are alive
/// right now", since the dispatcher doesn't expose PIDs to callers.
fn worker_process_count() -> usize {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().parse::<u32>().is_ok())
        .filter(|e| {
            std::fs::read(e.path().join("environ"))
                .map(|bytes| {
                    bytes
                        .split(|&b| b == 0)
                        .any(|var| var == b"PARALLEL_EXEC_WORKER=1")
                })
                .unwrap_or(false)
        })
        .count()
}
