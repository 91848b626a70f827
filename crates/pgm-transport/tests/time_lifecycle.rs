//! # Time source lifecycle
//!
//! Init/shutdown ordering for the process-wide clock. These run in their
//! own test binary (own process) because they tear the source down, which
//! would disturb unit tests that rely on it staying up. Within the binary
//! they serialise on a mutex since the harness is multi-threaded.

use std::sync::Mutex;

use pgm_transport::time;

static LIFECYCLE: Mutex<()> = Mutex::new(());

#[test]
fn init_is_idempotent() {
    let _guard = LIFECYCLE.lock().unwrap();
    time::shutdown();

    assert!(time::init());
    assert!(!time::init(), "second init reports already done");
    assert!(time::shutdown());
}

#[test]
fn shutdown_is_idempotent() {
    let _guard = LIFECYCLE.lock().unwrap();
    time::shutdown();

    assert!(time::init());
    assert!(time::shutdown());
    assert!(!time::shutdown(), "second shutdown reports already done");
    assert!(time::init(), "re-init after shutdown succeeds");
    assert!(time::shutdown());
}

#[test]
fn supported_tracks_lifecycle() {
    let _guard = LIFECYCLE.lock().unwrap();
    time::shutdown();

    assert!(!time::supported());
    time::init();
    assert!(time::supported());
    time::shutdown();
    assert!(!time::supported());
}

#[test]
fn now_never_regresses_across_reinit() {
    let _guard = LIFECYCLE.lock().unwrap();
    time::shutdown();

    time::init();
    time::sleep(1_000);
    let before = time::update_now();
    time::shutdown();
    time::init();
    let after = time::update_now();
    assert!(after >= before, "cached now regressed across re-init");
    time::shutdown();
}
