use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;

use crate::error::ClusterError;
use crate::fixtures;
use crate::supervisor::*;

fn sleeper(dir: &Path) -> Supervisor {
    Supervisor::new("sleeper", "sleep", dir, Duration::ZERO, Some(Duration::from_secs(10)))
}

#[tokio::test]
async fn clean_start_wipes_working_dir_and_captures_output() -> Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let dir = tmpdir.path().join("worker");
    std::fs::create_dir_all(&dir)?;
    std::fs::write(dir.join("stale.db"), b"old state")?;

    let mut sup = Supervisor::new("echoer", "sh", &dir, Duration::ZERO, Some(Duration::from_secs(10)));
    sup.start(&["-c".into(), "echo hello; exec sleep 30".into()], true).await?;

    assert!(!dir.join("stale.db").exists(), "expected clean start to remove pre-existing state");
    assert!(sup.is_running(), "expected process to be running after start");
    let stdout = fixtures::wait_for_file_contents(&dir.join(STDOUT_FILE), "hello").await?;
    assert!(stdout.contains("hello"), "expected captured stdout to contain output, got {:?}", stdout);

    sup.stop(StopSignal::Interrupt).await?;
    assert!(!sup.is_running(), "expected process to be stopped");
    Ok(())
}

#[tokio::test]
async fn warm_start_preserves_state_and_appends_output() -> Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let dir = tmpdir.path().join("worker");
    let mut sup = Supervisor::new("echoer", "sh", &dir, Duration::ZERO, Some(Duration::from_secs(10)));

    sup.start(&["-c".into(), "echo first; exec sleep 30".into()], true).await?;
    fixtures::wait_for_file_contents(&dir.join(STDOUT_FILE), "first").await?;
    sup.stop(StopSignal::Terminate).await?;
    std::fs::write(dir.join("state.db"), b"keep me")?;

    sup.start(&["-c".into(), "echo second; exec sleep 30".into()], false).await?;
    let stdout = fixtures::wait_for_file_contents(&dir.join(STDOUT_FILE), "second").await?;
    sup.stop(StopSignal::Terminate).await?;

    assert!(dir.join("state.db").exists(), "expected warm start to keep existing state");
    assert!(stdout.contains("first") && stdout.contains("second"), "expected appended output, got {:?}", stdout);
    Ok(())
}

#[tokio::test]
async fn stop_is_a_no_op_on_a_stopped_process() -> Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let mut sup = sleeper(tmpdir.path());

    sup.stop(StopSignal::Interrupt).await?;

    sup.start(&["30".into()], true).await?;
    assert!(sup.pid().is_some(), "expected a pid for a running process");
    sup.stop(StopSignal::Interrupt).await?;
    sup.stop(StopSignal::Interrupt).await?;
    assert!(sup.pid().is_none(), "expected no pid after stop");
    Ok(())
}

#[tokio::test]
async fn start_refuses_to_spawn_a_duplicate_process() -> Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let mut sup = sleeper(tmpdir.path());
    sup.start(&["30".into()], true).await?;

    let res = sup.start(&["30".into()], false).await;
    assert!(matches!(res, Err(ClusterError::Launch(_))), "expected launch error for duplicate start, got {:?}", res);

    sup.stop(StopSignal::Kill).await?;
    Ok(())
}

#[tokio::test]
async fn start_of_missing_binary_is_a_launch_error() -> Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let mut sup = Supervisor::new("ghost", tmpdir.path().join("no-such-binary"), tmpdir.path().join("w"), Duration::ZERO, None);

    let res = sup.start(&[], true).await;
    assert!(matches!(res, Err(ClusterError::Launch(_))), "expected launch error, got {:?}", res);
    assert!(!sup.is_running(), "expected nothing to be running");
    Ok(())
}

#[tokio::test]
async fn stop_reports_shutdown_error_when_grace_elapses() -> Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let dir = tmpdir.path().join("stubborn");
    let mut sup = Supervisor::new("stubborn", "sh", &dir, Duration::ZERO, Some(Duration::from_millis(200)));
    sup.start(&["-c".into(), "trap '' INT; echo armed; while true; do sleep 1; done".into()], true).await?;
    fixtures::wait_for_file_contents(&dir.join(STDOUT_FILE), "armed").await?;

    match sup.stop(StopSignal::Interrupt).await {
        Err(err @ ClusterError::Shutdown { .. }) => assert!(!err.is_fatal(), "expected shutdown errors to be non-fatal"),
        other => panic!("expected shutdown error, got {:?}", other),
    }
    assert!(sup.is_running(), "expected the process to remain tracked after a failed stop");

    sup.stop(StopSignal::Kill).await?;
    Ok(())
}

#[test]
fn stop_signal_parses_common_spellings() {
    assert_eq!("SIGINT".parse::<StopSignal>().ok(), Some(StopSignal::Interrupt));
    assert_eq!("term".parse::<StopSignal>().ok(), Some(StopSignal::Terminate));
    assert_eq!("KILL".parse::<StopSignal>().ok(), Some(StopSignal::Kill));
    assert!("HUP".parse::<StopSignal>().is_err(), "expected unsupported signal to fail parsing");
    assert_eq!(StopSignal::Interrupt.to_string(), "SIGINT");
}

#[tokio::test]
async fn process_of_unknown_status_is_dropped_and_can_be_replaced() -> Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let mut sup = sleeper(tmpdir.path());
    let pid = sup.start(&["30".into()], true).await?;

    // Reaping the child behind the supervisor's back makes its status unknowable.
    let pid = Pid::from_raw(pid as i32);
    kill(pid, Signal::SIGKILL)?;
    waitpid(pid, None)?;

    assert!(!sup.is_running(), "expected a process of unknown status to count as stopped");
    assert!(sup.pid().is_none(), "expected the stale child handle to be released, got {:?}", sup.pid());
    let replacement = sup.start(&["30".into()], false).await?;
    assert!(sup.pid() == Some(replacement), "expected the replacement to be tracked, got {:?}", sup.pid());
    sup.stop(StopSignal::Terminate).await?;
    Ok(())
}
