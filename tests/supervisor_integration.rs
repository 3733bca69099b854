//! End-to-end tests driving a real `drinit` process over its control FIFO.
//!
//! Run with: cargo test --test supervisor_integration

mod common;

use std::time::Duration;

use common::TestSupervisor;

#[tokio::test]
async fn down_then_up_cycles_the_child_pid() {
    let sup = TestSupervisor::start("echo $$ > __PIDFILE__; sleep 30").await;
    let pid1 = sup.child_pid().await.expect("child should report its pid");
    assert!(TestSupervisor::child_alive(pid1));

    let _ = std::fs::remove_file(&sup.pid_file);

    sup.send("down", &[]).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        !TestSupervisor::child_alive(pid1),
        "child should be terminated after down"
    );

    sup.send("up", &[]).await;
    let pid2 = sup
        .child_pid()
        .await
        .expect("child should restart and report a new pid");
    assert_ne!(pid1, pid2);
    assert!(TestSupervisor::child_alive(pid2));
}

#[tokio::test]
async fn cycle_replaces_the_running_child() {
    let sup = TestSupervisor::start("echo $$ > __PIDFILE__; sleep 30").await;
    let pid1 = sup.child_pid().await.expect("child should report its pid");

    let _ = std::fs::remove_file(&sup.pid_file);
    sup.send("cycle", &[]).await;

    let pid2 = sup
        .child_pid()
        .await
        .expect("cycled child should report a new pid");
    assert_ne!(pid1, pid2);
    assert!(TestSupervisor::child_alive(pid2));
    assert!(!TestSupervisor::child_alive(pid1));
}

#[tokio::test]
async fn unknown_command_does_not_disturb_the_running_child() {
    let sup = TestSupervisor::start("echo $$ > __PIDFILE__; sleep 30").await;
    let pid1 = sup.child_pid().await.expect("child should report its pid");

    sup.send("bogus", &[]).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(
        TestSupervisor::child_alive(pid1),
        "unknown command must not disturb the running child"
    );
}

#[tokio::test]
async fn signal_command_reaches_the_child_without_killing_it() {
    // USR1 is neither trapped nor terminal for the default shell loop, so
    // the child should still be alive afterward.
    let sup = TestSupervisor::start(
        "trap 'echo got >> __PIDFILE__.trap' USR1; echo $$ > __PIDFILE__; sleep 30",
    )
    .await;
    let pid1 = sup.child_pid().await.expect("child should report its pid");

    sup.send("signal", &["SIGUSR1"]).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(
        TestSupervisor::child_alive(pid1),
        "SIGUSR1 should not terminate the child"
    );
}
