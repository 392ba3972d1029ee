//! Self-termination runs in its own test binary so the SIGTERM handler it
//! installs cannot affect other tests.
#![cfg(unix)]

use std::time::Duration;

use tether_client::{ProcessTerminator, Terminator};
use tokio::signal::unix::{SignalKind, signal};

#[tokio::test]
async fn test_process_terminator_signals_self() {
    let mut sigterm = signal(SignalKind::terminate()).unwrap();

    ProcessTerminator::new(Duration::from_secs(3600)).terminate(0x42);

    let received = tokio::time::timeout(Duration::from_secs(5), sigterm.recv())
        .await
        .expect("SIGTERM not delivered");
    assert!(received.is_some());
}
