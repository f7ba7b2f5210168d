//! Application process - spawning, output capture and termination

use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::CommandSpec;
use crate::error::E2eResult;

/// Per-stream cap on captured output
const MAX_CAPTURE_BYTES: usize = 64 * 1024;

/// How long to wait for output readers once the process is gone. Grandchildren
/// that inherited the pipes can keep them open indefinitely.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Output captured from the application
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Exit code and output of a process that has terminated
#[derive(Debug)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub output: CapturedOutput,
}

/// Handle to a running application process
#[derive(Debug)]
pub struct AppProcess {
    child: Child,
    pid: Option<u32>,
    stdout: Arc<Mutex<Vec<u8>>>,
    stderr: Arc<Mutex<Vec<u8>>>,
    readers: Vec<JoinHandle<()>>,
    started_at: DateTime<Utc>,
}

impl AppProcess {
    /// Spawn `command` with `dir` as its working directory.
    ///
    /// On unix the process leads its own process group so that shell
    /// wrappers and their children are terminated together.
    pub fn spawn(command: &CommandSpec, dir: &Path) -> E2eResult<Self> {
        let mut std_cmd = command.to_command()?;
        std_cmd
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_cmd.process_group(0);
        }

        let mut cmd = Command::from(std_cmd);
        cmd.kill_on_drop(true);
        let mut child = cmd.spawn()?;
        let pid = child.id();

        let stdout = Arc::new(Mutex::new(Vec::new()));
        let stderr = Arc::new(Mutex::new(Vec::new()));
        let mut readers = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            readers.push(spawn_reader(out, Arc::clone(&stdout)));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(spawn_reader(err, Arc::clone(&stderr)));
        }

        info!(pid = ?pid, command = %command, dir = %dir.display(), "application process spawned");

        Ok(Self {
            child,
            pid,
            stdout,
            stderr,
            readers,
            started_at: Utc::now(),
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Non-blocking exit check. An OS error while checking counts as exited.
    pub fn has_exited(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid = ?self.pid, %status, "application process has exited");
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(pid = ?self.pid, error = %e, "failed to query application process");
                true
            }
        }
    }

    /// Snapshot of everything captured so far. Invalid UTF-8 is replaced.
    pub fn output(&self) -> CapturedOutput {
        CapturedOutput {
            stdout: String::from_utf8_lossy(&self.stdout.lock()).into_owned(),
            stderr: String::from_utf8_lossy(&self.stderr.lock()).into_owned(),
        }
    }

    /// Reap an exited process and collect its exit code and output
    pub async fn collect_exit(mut self) -> ExitReport {
        let code = match self.child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(pid = ?self.pid, error = %e, "failed to reap application process");
                None
            }
        };
        self.drain_readers().await;

        ExitReport {
            code,
            output: self.output(),
        }
    }

    /// Ask the process to exit and wait for it.
    ///
    /// Sends SIGTERM first; if the process is still alive after `grace` it is
    /// killed. Returns the exit code when there is one.
    pub async fn terminate(&mut self, grace: Duration) -> E2eResult<Option<i32>> {
        if let Some(status) = self.child.try_wait()? {
            self.drain_readers().await;
            return Ok(status.code());
        }

        info!(pid = ?self.pid, "terminating application process");
        self.signal_terminate();

        let status = match timeout(grace, self.child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(pid = ?self.pid, ?grace, "application did not exit after SIGTERM, killing");
                self.force_kill();
                self.child.wait().await?
            }
        };
        self.drain_readers().await;

        Ok(status.code())
    }

    #[cfg(unix)]
    fn signal_terminate(&mut self) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = self.pid {
            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!(pid, error = %e, "SIGTERM to process group failed");
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_terminate(&mut self) {
        let _ = self.child.start_kill();
    }

    fn force_kill(&mut self) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = self.pid {
                let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
        }

        let _ = self.child.start_kill();
    }

    async fn drain_readers(&mut self) {
        for reader in self.readers.drain(..) {
            if timeout(READER_DRAIN_TIMEOUT, reader).await.is_err() {
                debug!(pid = ?self.pid, "output pipe still held open, not waiting for it");
            }
        }
    }
}

fn spawn_reader<R>(stream: R, sink: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        // Keep draining after the cap so the application never blocks on a full pipe
        loop {
            let chunk = match reader.fill_buf().await {
                Ok([]) => break,
                Ok(chunk) => chunk,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(error = %e, "stopped reading application output");
                    break;
                }
            };
            let len = chunk.len();
            append_capped(&mut sink.lock(), chunk);
            reader.consume(len);
        }
    })
}

/// Append as much of `chunk` as fits under [`MAX_CAPTURE_BYTES`]
fn append_capped(buf: &mut Vec<u8>, chunk: &[u8]) {
    let room = MAX_CAPTURE_BYTES.saturating_sub(buf.len());
    buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(line: &str) -> CommandSpec {
        CommandSpec::Shell(line.to_string())
    }

    #[tokio::test]
    async fn test_collects_exit_code_and_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut process =
            AppProcess::spawn(&shell("echo ready; echo broken >&2; exit 3"), dir.path()).unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(process.has_exited());

        let report = process.collect_exit().await;
        assert_eq!(report.code, Some(3));
        assert_eq!(report.output.stdout, "ready\n");
        assert_eq!(report.output.stderr, "broken\n");
    }

    #[tokio::test]
    async fn test_runs_in_given_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here").unwrap();

        let process = AppProcess::spawn(&shell("cat marker.txt"), dir.path()).unwrap();
        let report = process.collect_exit().await;
        assert_eq!(report.code, Some(0));
        assert_eq!(report.output.stdout, "here\n");
    }

    #[tokio::test]
    async fn test_terminate_long_running_process() {
        let dir = tempfile::tempdir().unwrap();
        let mut process = AppProcess::spawn(&shell("sleep 30"), dir.path()).unwrap();
        assert!(!process.has_exited());

        process.terminate(Duration::from_secs(5)).await.unwrap();
        assert!(process.has_exited());
    }

    #[tokio::test]
    async fn test_kill_when_sigterm_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut process =
            AppProcess::spawn(&shell("trap '' TERM; while true; do sleep 1; done"), dir.path())
                .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let code = process
            .terminate(Duration::from_millis(300))
            .await
            .unwrap();
        // Killed by SIGKILL, so no exit code
        assert_eq!(code, None);
    }

    #[tokio::test]
    async fn test_spawn_missing_program_fails() {
        let dir = tempfile::tempdir().unwrap();
        let command = CommandSpec::Argv(vec!["/definitely/not/a/program".to_string()]);
        assert!(AppProcess::spawn(&command, dir.path()).is_err());
    }

    #[test]
    fn test_append_capped_truncates_at_limit() {
        let mut buf = vec![b'a'; MAX_CAPTURE_BYTES - 3];
        append_capped(&mut buf, b"hello");
        assert_eq!(buf.len(), MAX_CAPTURE_BYTES);
        assert!(buf.ends_with(b"ahel"));

        append_capped(&mut buf, b"more");
        assert_eq!(buf.len(), MAX_CAPTURE_BYTES);
    }

    #[tokio::test]
    async fn test_invalid_utf8_output_keeps_app_alive() {
        let dir = tempfile::tempdir().unwrap();
        let mut process = AppProcess::spawn(
            &shell("printf 'bad \\377 byte\\n'; sleep 0.3; while true; do echo tick; sleep 0.1; done"),
            dir.path(),
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert!(!process.has_exited());

        let output = process.output();
        assert!(output.stdout.starts_with("bad \u{FFFD} byte\n"));
        assert!(output.stdout.contains("tick\n"));

        process.terminate(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_unterminated_output_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let process = AppProcess::spawn(
            &shell("head -c 100000 /dev/zero | tr '\\0' 'a'"),
            dir.path(),
        )
        .unwrap();

        let report = process.collect_exit().await;
        assert_eq!(report.code, Some(0));
        assert_eq!(report.output.stdout.len(), MAX_CAPTURE_BYTES);
        assert!(report.output.stdout.bytes().all(|b| b == b'a'));
    }

    #[tokio::test]
    async fn test_pipe_drained_after_cap() {
        let dir = tempfile::tempdir().unwrap();
        // Far more than the cap plus a pipe buffer; blocks unless the reader keeps draining
        let mut process = AppProcess::spawn(
            &shell("head -c 1000000 /dev/zero; echo after-cap >&2; exec sleep 30"),
            dir.path(),
        )
        .unwrap();

        let mut output = process.output();
        for _ in 0..50 {
            if output.stderr.contains("after-cap") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            output = process.output();
        }

        assert_eq!(output.stderr, "after-cap\n");
        assert_eq!(output.stdout.len(), MAX_CAPTURE_BYTES);
        assert!(!process.has_exited());

        process.terminate(Duration::from_secs(5)).await.unwrap();
    }
}
