//! Supervised external processes.
//!
//! The capture tool and the classifier are launched detached from our
//! standard streams and, on unix, as leaders of their own process group.
//! Terminating a child kills the whole group, so helpers they fork (tshark
//! runs dumpcap, interpreters run workers) go down with them.

use std::ffi::OsStr;
use std::io::ErrorKind;
use std::process::{ExitStatus, Stdio};

use tokio::process::{Child, Command};
use tracing::{debug, trace};

/// A child process that is killed with its process group on `terminate` or drop.
#[derive(Debug)]
pub struct ManagedChild {
    name: String,
    child: Child,
    pid: Option<u32>,
}

impl ManagedChild {
    /// Launches `program` with `args`, all standard streams redirected to null.
    pub fn spawn<I, S>(name: &str, program: &str, args: I) -> std::io::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn()?;
        let pid = child.id();
        debug!("Started {} ({}), pid {:?}", name, program, pid);

        Ok(Self {
            name: name.to_string(),
            child,
            pid,
        })
    }

    /// Waits for the child to exit on its own.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Returns the exit status if the child has already exited.
    pub fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Kills the child and its process group, then reaps it.
    pub async fn terminate(&mut self) -> std::io::Result<()> {
        if let Some(pid) = self.pid {
            kill_process_group(pid);
        }

        match self.child.kill().await {
            Ok(()) => {}
            // Already exited and reaped.
            Err(e) if e.kind() == ErrorKind::InvalidInput => {}
            Err(e) => return Err(e),
        }
        debug!("Terminated {} (pid {:?})", self.name, self.pid);
        Ok(())
    }
}

/// Sends SIGKILL to the process group led by `pid`.
#[cfg(unix)]
pub fn kill_process_group(pid: u32) {
    // SAFETY: killpg only sends a signal; the group id is the pid of a child
    // we spawned as group leader.
    let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
    if rc != 0 {
        trace!("killpg({}): {}", pid, std::io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
pub fn kill_process_group(_pid: u32) {}

/// Returns true if `program` resolves to an executable, either as an explicit
/// path or through `PATH`.
pub fn find_executable(program: &str) -> Option<std::path::PathBuf> {
    let candidate = std::path::Path::new(program);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }

    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|full| is_executable(full))
}

#[cfg(unix)]
fn is_executable(path: &std::path::Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &std::path::Path) -> bool {
    path.is_file() || path.with_extension("exe").is_file()
}

/// Returns true when the process runs with root privileges.
#[cfg(unix)]
pub fn is_privileged() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
pub fn is_privileged() -> bool {
    true
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_terminate_kills_long_running_child() {
        let mut child = ManagedChild::spawn("sleeper", "sleep", ["30"]).unwrap();
        assert!(child.try_wait().unwrap().is_none());

        tokio::time::timeout(Duration::from_secs(5), child.terminate())
            .await
            .unwrap()
            .unwrap();

        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_terminate_after_exit_is_ok() {
        let mut child = ManagedChild::spawn("true", "true", Vec::<String>::new()).unwrap();
        child.wait().await.unwrap();
        child.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_terminate_kills_grandchildren() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let script = format!("(sleep 1; touch {}) & wait", marker.display());

        let mut child = ManagedChild::spawn("shell", "sh", ["-c", script.as_str()]).unwrap();
        child.terminate().await.unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[test]
    fn test_find_executable() {
        assert!(find_executable("sh").is_some());
        assert!(find_executable("definitely-not-a-real-tool-name").is_none());
        assert!(find_executable("/nonexistent/dir/tool").is_none());
    }
}
