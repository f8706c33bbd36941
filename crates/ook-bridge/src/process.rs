//! Agent process controller.
//!
//! Owns zero or one child process and its three stdio streams. Stdout is
//! decoded line by line into [`ProcessEvent::Message`]s, stderr is logged as
//! diagnostics only, and stdin accepts newline-terminated frames through
//! [`ProcessController::send`]. Every observable change is reported as a
//! `(ProcessId, ProcessEvent)` on the channel handed to [`ProcessController::new`].

use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ook_core::{ensure_newline, ProcessId};
use secrecy::{ExposeSecret, SecretString};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ProcessSpec;
use crate::error::ProcessError;

/// How long to wait for buffered stdout after the child exits.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
const STDERR_CHUNK_BYTES: usize = 4096;

/// How the child exited.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Debug)]
pub enum ProcessEvent {
    /// One trimmed, non-empty stdout line.
    Message(String),
    Error(ProcessError),
    /// Emitted exactly once per spawned child.
    Exit(ExitInfo),
}

pub type ProcessEventSender = mpsc::UnboundedSender<(ProcessId, ProcessEvent)>;
pub type ProcessEventReceiver = mpsc::UnboundedReceiver<(ProcessId, ProcessEvent)>;

/// Copy the named variables, and only those, out of the parent environment.
pub fn allowlisted_env(names: &[String]) -> Vec<(String, SecretString)> {
    allowlisted_env_from(names, |name| std::env::var(name).ok())
}

fn allowlisted_env_from(
    names: &[String],
    lookup: impl Fn(&str) -> Option<String>,
) -> Vec<(String, SecretString)> {
    names
        .iter()
        .filter_map(|name| lookup(name).map(|value| (name.clone(), SecretString::from(value))))
        .collect()
}

struct ProcessHandle {
    pid: Option<u32>,
    stdin: mpsc::UnboundedSender<String>,
    terminate: Option<oneshot::Sender<()>>,
}

pub struct ProcessController {
    id: ProcessId,
    spec: ProcessSpec,
    events: ProcessEventSender,
    running: Arc<AtomicBool>,
    handle: Option<ProcessHandle>,
}

impl ProcessController {
    pub fn new(spec: ProcessSpec, events: ProcessEventSender) -> Self {
        Self {
            id: ProcessId::new(),
            spec,
            events,
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    pub fn id(&self) -> &ProcessId {
        &self.id
    }

    /// False once the child's exit has been observed.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn pid(&self) -> Option<u32> {
        if self.is_running() {
            self.handle.as_ref().and_then(|h| h.pid)
        } else {
            None
        }
    }

    /// Start the child. Failures are reported as [`ProcessEvent::Error`].
    pub fn spawn(&mut self) {
        if self.is_running() {
            warn!(process_id = %self.id, pid = ?self.pid(), "agent process already running, ignoring spawn");
            return;
        }

        let mut cmd = Command::new(&self.spec.command);
        cmd.args(&self.spec.args)
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (name, value) in allowlisted_env(&self.spec.env_allowlist) {
            cmd.env(name, value.expose_secret());
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                self.emit(ProcessEvent::Error(ProcessError::Spawn {
                    command: self.spec.command.clone(),
                    source,
                }));
                return;
            }
        };

        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            (stdin, stdout, _) => {
                let missing = if stdin.is_none() {
                    "stdin"
                } else if stdout.is_none() {
                    "stdout"
                } else {
                    "stderr"
                };
                let _ = child.start_kill();
                self.emit(ProcessEvent::Error(ProcessError::MissingPipe(missing)));
                return;
            }
        };

        let pid = child.id();
        let running = Arc::new(AtomicBool::new(true));
        self.running = Arc::clone(&running);

        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let (terminate_tx, terminate_rx) = oneshot::channel();

        let supervised = Supervised {
            id: self.id.clone(),
            events: self.events.clone(),
            running,
            grace: self.spec.terminate_grace(),
            writer: tokio::spawn(write_stdin(stdin, stdin_rx, pid)),
            reader: tokio::spawn(read_stdout(stdout, self.id.clone(), self.events.clone())),
            diagnostics: tokio::spawn(read_stderr(stderr, pid)),
        };
        tokio::spawn(supervised.run(child, terminate_rx));

        self.handle = Some(ProcessHandle {
            pid,
            stdin: stdin_tx,
            terminate: Some(terminate_tx),
        });
        info!(process_id = %self.id, pid, command = %self.spec.command, "agent process spawned");
    }

    /// Queue one frame for the child's stdin, newline-terminated.
    ///
    /// Returns `false` without writing when no child is running.
    pub fn send(&self, message: &str) -> bool {
        if !self.is_running() {
            return false;
        }
        match &self.handle {
            Some(handle) => handle.stdin.send(ensure_newline(message).into_owned()).is_ok(),
            None => false,
        }
    }

    /// SIGTERM now, SIGKILL after the grace period. Does not wait.
    pub fn terminate(&mut self) {
        let Some(handle) = self.handle.as_mut() else {
            return;
        };
        if let Some(terminate) = handle.terminate.take() {
            if self.running.load(Ordering::SeqCst) {
                info!(process_id = %self.id, pid = ?handle.pid, "terminating agent process");
            }
            let _ = terminate.send(());
        }
    }

    fn emit(&self, event: ProcessEvent) {
        if let ProcessEvent::Error(err) = &event {
            warn!(process_id = %self.id, error = %err, "agent process error");
        }
        let _ = self.events.send((self.id.clone(), event));
    }
}

/// The tasks attached to one running child.
struct Supervised {
    id: ProcessId,
    events: ProcessEventSender,
    running: Arc<AtomicBool>,
    grace: Duration,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
    diagnostics: JoinHandle<()>,
}

impl Supervised {
    async fn run(mut self, mut child: Child, mut terminate: oneshot::Receiver<()>) {
        // A dropped controller also counts as a terminate request.
        let status = tokio::select! {
            status = child.wait() => status,
            _ = &mut terminate => stop_gracefully(&mut child, self.grace).await,
        };

        let exit = match status {
            Ok(status) => ExitInfo::from_status(status),
            Err(e) => {
                warn!(process_id = %self.id, error = %e, "failed to collect agent exit status");
                ExitInfo::default()
            }
        };

        self.running.store(false, Ordering::SeqCst);
        self.writer.abort();
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut self.reader).await.is_err() {
            debug!(process_id = %self.id, "stdout still open after exit, dropping reader");
            self.reader.abort();
        }
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut self.diagnostics).await.is_err() {
            self.diagnostics.abort();
        }

        info!(process_id = %self.id, code = ?exit.code, signal = ?exit.signal, "agent process exited");
        let _ = self.events.send((self.id, ProcessEvent::Exit(exit)));
    }
}

async fn stop_gracefully(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    send_sigterm(child);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(pid = ?child.id(), grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX), "agent ignored SIGTERM, sending SIGKILL");
            child.kill().await?;
            child.wait().await
        }
    }
}

#[cfg(unix)]
fn send_sigterm(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!(pid, error = %e, "SIGTERM failed");
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(child: &mut Child) {
    let _ = child.start_kill();
}

async fn write_stdin(mut stdin: ChildStdin, mut frames: mpsc::UnboundedReceiver<String>, pid: Option<u32>) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = stdin.write_all(frame.as_bytes()).await {
            warn!(pid, error = %e, "failed to write to agent stdin");
            break;
        }
        if let Err(e) = stdin.flush().await {
            warn!(pid, error = %e, "failed to flush agent stdin");
            break;
        }
    }
}

async fn read_stdout(stdout: ChildStdout, id: ProcessId, events: ProcessEventSender) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if events.send((id.clone(), ProcessEvent::Message(line.to_owned()))).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(process_id = %id, error = %e, "failed to decode agent stdout");
                break;
            }
        }
    }
}

async fn read_stderr(mut stderr: ChildStderr, pid: Option<u32>) {
    let mut buf = vec![0u8; STDERR_CHUNK_BYTES];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let text = String::from_utf8_lossy(&buf[..n]);
                let text = text.trim();
                if !text.is_empty() {
                    warn!(pid, stderr = %text, "agent stderr");
                }
            }
            Err(e) => {
                debug!(pid, error = %e, "agent stderr closed");
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn controller(command: &str, args: &[&str]) -> (ProcessController, ProcessEventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut spec = ProcessSpec::new(command, args.iter().map(|s| s.to_string()).collect());
        spec.terminate_grace_ms = 200;
        (ProcessController::new(spec, tx), rx)
    }

    fn sh(script: &str) -> (ProcessController, ProcessEventReceiver) {
        controller("/bin/sh", &["-c", script])
    }

    async fn next_event(rx: &mut ProcessEventReceiver) -> ProcessEvent {
        let (_, event) = tokio::time::timeout(TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for process event")
            .expect("event channel closed");
        event
    }

    async fn next_message(rx: &mut ProcessEventReceiver) -> String {
        match next_event(rx).await {
            ProcessEvent::Message(line) => line,
            other => panic!("expected message, got {other:?}"),
        }
    }

    async fn next_exit(rx: &mut ProcessEventReceiver) -> ExitInfo {
        loop {
            if let ProcessEvent::Exit(exit) = next_event(rx).await {
                return exit;
            }
        }
    }

    #[tokio::test]
    async fn echoes_lines_through_cat() {
        let (mut proc, mut rx) = controller("cat", &[]);
        proc.spawn();
        assert!(proc.is_running());
        assert!(proc.pid().is_some());

        assert!(proc.send(r#"{"id":1,"method":"initialize"}"#));
        assert_eq!(next_message(&mut rx).await, r#"{"id":1,"method":"initialize"}"#);
        proc.terminate();
        next_exit(&mut rx).await;
    }

    #[tokio::test]
    async fn send_never_doubles_newline() {
        let (mut proc, mut rx) = sh(r#"while IFS= read -r l; do echo "[$l]"; done"#);
        proc.spawn();
        assert!(proc.send("a\n"));
        assert!(proc.send("b"));
        assert_eq!(next_message(&mut rx).await, "[a]");
        assert_eq!(next_message(&mut rx).await, "[b]");
        proc.terminate();
        next_exit(&mut rx).await;
    }

    #[tokio::test]
    async fn trims_and_drops_blank_lines() {
        let (mut proc, mut rx) = sh(r#"printf '  hello  \n\n   \nworld\n'"#);
        proc.spawn();
        assert_eq!(next_message(&mut rx).await, "hello");
        assert_eq!(next_message(&mut rx).await, "world");
        let exit = next_exit(&mut rx).await;
        assert!(exit.success());
        assert!(!proc.is_running());
    }

    #[tokio::test]
    async fn stderr_is_not_forwarded() {
        let (mut proc, mut rx) = sh("echo oops >&2; echo out");
        proc.spawn();
        assert_eq!(next_message(&mut rx).await, "out");
        match next_event(&mut rx).await {
            ProcessEvent::Exit(exit) => assert!(exit.success()),
            other => panic!("expected exit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reports_exit_code() {
        let (mut proc, mut rx) = sh("exit 3");
        proc.spawn();
        let exit = next_exit(&mut rx).await;
        assert_eq!(exit.code, Some(3));
        assert_eq!(exit.signal, None);
        assert!(!exit.success());
    }

    #[tokio::test]
    async fn spawn_failure_is_an_event() {
        let (mut proc, mut rx) = controller("/nonexistent/ook-test-agent", &[]);
        proc.spawn();
        match next_event(&mut rx).await {
            ProcessEvent::Error(ProcessError::Spawn { command, .. }) => {
                assert_eq!(command, "/nonexistent/ook-test-agent");
            }
            other => panic!("expected spawn error, got {other:?}"),
        }
        assert!(!proc.is_running());
        assert!(!proc.send("{}"));
    }

    #[tokio::test]
    async fn spawn_while_running_is_ignored() {
        let (mut proc, mut rx) = controller("cat", &[]);
        proc.spawn();
        let pid = proc.pid();
        proc.spawn();
        assert_eq!(proc.pid(), pid);
        proc.terminate();
        next_exit(&mut rx).await;
        assert!(rx.try_recv().is_err(), "only one child should have been started");
    }

    #[tokio::test]
    async fn send_without_process_returns_false() {
        let (proc, _rx) = controller("cat", &[]);
        assert!(!proc.is_running());
        assert!(!proc.send("hello"));
    }

    #[tokio::test]
    async fn send_after_exit_returns_false() {
        let (mut proc, mut rx) = sh("exit 0");
        proc.spawn();
        next_exit(&mut rx).await;
        assert!(!proc.send("late"));
    }

    #[tokio::test]
    async fn terminate_sends_sigterm() {
        let (mut proc, mut rx) = controller("cat", &[]);
        proc.spawn();
        proc.terminate();
        let exit = next_exit(&mut rx).await;
        assert_eq!(exit.signal, Some(15));
        assert!(!proc.is_running());
        assert_eq!(proc.pid(), None);
    }

    #[tokio::test]
    async fn terminate_escalates_to_sigkill() {
        let (mut proc, mut rx) = sh(r#"trap '' TERM; echo ready; while IFS= read -r l; do :; done"#);
        proc.spawn();
        assert_eq!(next_message(&mut rx).await, "ready");
        proc.terminate();
        let exit = next_exit(&mut rx).await;
        assert_eq!(exit.signal, Some(9));
    }

    #[tokio::test]
    async fn terminate_twice_is_harmless() {
        let (mut proc, mut rx) = controller("cat", &[]);
        proc.spawn();
        proc.terminate();
        proc.terminate();
        next_exit(&mut rx).await;
        proc.terminate();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err(), "exit must be reported once");
    }

    #[tokio::test]
    async fn respawn_after_exit() {
        let (mut proc, mut rx) = sh("echo hi");
        proc.spawn();
        assert_eq!(next_message(&mut rx).await, "hi");
        next_exit(&mut rx).await;

        proc.spawn();
        assert_eq!(next_message(&mut rx).await, "hi");
        next_exit(&mut rx).await;
    }

    #[tokio::test]
    async fn child_sees_only_allowlisted_env() {
        std::env::set_var("OOK_TEST_ALLOWED_SECRET", "s3cret");
        std::env::set_var("OOK_TEST_FORBIDDEN", "nope");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut spec = ProcessSpec::new("/usr/bin/env", vec![]);
        spec.env_allowlist = vec!["OOK_TEST_ALLOWED_SECRET".into(), "OOK_TEST_UNSET_VAR".into()];
        let mut proc = ProcessController::new(spec, tx);
        proc.spawn();

        let mut lines = Vec::new();
        loop {
            match next_event(&mut rx).await {
                ProcessEvent::Message(line) => lines.push(line),
                ProcessEvent::Exit(_) => break,
                ProcessEvent::Error(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(lines, vec!["OOK_TEST_ALLOWED_SECRET=s3cret".to_string()]);
    }

    #[test]
    fn allowlist_copies_named_keys_only() {
        let names = vec!["A".to_string(), "B".to_string()];
        let env = allowlisted_env_from(&names, |name| match name {
            "A" => Some("1".into()),
            "C" => Some("3".into()),
            _ => None,
        });
        assert_eq!(env.len(), 1);
        assert_eq!(env[0].0, "A");
        assert_eq!(env[0].1.expose_secret(), "1");
    }

    #[test]
    fn empty_allowlist_copies_nothing() {
        let env = allowlisted_env_from(&[], |_| Some("x".into()));
        assert!(env.is_empty());
    }
}
