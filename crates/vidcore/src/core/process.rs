//! Process execution utilities with timeout and group termination
//!
//! Downloader processes are started in their own process group so that helpers
//! they spawn (ffmpeg for merging) die together with them.

use std::io;
use std::process::{ExitStatus, Output};
use std::time::Duration;
use tokio::process::{Child, Command};

use crate::core::error::AppError;

/// Run a Command to completion with a timeout.
///
/// The child is killed when the timeout fires.
pub async fn run_with_timeout(cmd: &mut Command, timeout: Duration) -> Result<Output, AppError> {
    cmd.kill_on_drop(true);
    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(AppError::Io(e)),
        Err(_) => Err(AppError::ExtractionFailed(format!(
            "process timed out after {}s",
            timeout.as_secs()
        ))),
    }
}

/// Send `signal` to the whole process group led by `pid`.
///
/// A group that no longer exists is not an error.
#[allow(unsafe_code)]
pub fn signal_group(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(pid).map_err(|_| io::Error::other("pid out of range"))?;
    // SAFETY: kill(2) with a negative pid only signals; no memory is touched.
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

/// Whether a process with this pid still exists (zombies included).
#[allow(unsafe_code)]
pub fn is_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// SIGTERM the child's group, wait up to `grace`, then SIGKILL and reap.
///
/// Always reaps the child so no zombie is left behind.
pub async fn terminate_gracefully(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    let Some(pid) = child.id() else {
        // Already reaped
        return child.wait().await;
    };

    if let Err(e) = signal_group(pid, libc::SIGTERM) {
        log::warn!("SIGTERM to process group {} failed: {}", pid, e);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => {
            // Leader is gone; make sure no helper in its group outlives it.
            let _ = signal_group(pid, libc::SIGKILL);
            status
        }
        Err(_) => {
            log::warn!("Process {} ignored SIGTERM for {:?}, sending SIGKILL", pid, grace);
            if let Err(e) = signal_group(pid, libc::SIGKILL) {
                log::warn!("SIGKILL to process group {} failed: {}", pid, e);
            }
            let _ = child.start_kill();
            child.wait().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn test_run_with_timeout_success() {
        let output = run_with_timeout(&mut sh("echo hello"), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_with_timeout_expires() {
        let err = run_with_timeout(&mut sh("sleep 5"), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ExtractionFailed(_)));
    }

    #[tokio::test]
    async fn test_terminate_gracefully_stops_sigterm_aware_process() {
        let mut child = sh("sleep 30")
            .process_group(0)
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        assert!(is_alive(pid));

        let status = terminate_gracefully(&mut child, Duration::from_secs(2)).await.unwrap();
        assert!(!status.success());
        assert!(!is_alive(pid));
    }

    #[tokio::test]
    async fn test_terminate_gracefully_escalates_to_sigkill() {
        let mut child = sh("trap '' TERM; sleep 30 & wait")
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        terminate_gracefully(&mut child, Duration::from_millis(300)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!is_alive(pid));
    }

    #[test]
    fn test_signal_missing_group_is_ok() {
        // Far above any realistic pid_max
        assert!(signal_group(2_000_000_000, libc::SIGTERM).is_ok());
    }
}
