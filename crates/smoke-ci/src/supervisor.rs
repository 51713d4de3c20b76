//! Backend process supervision.
//!
//! The supervisor only takes ownership of a backend it had to start itself.
//! A backend that already answers its health probe is used as-is and is never
//! signalled on shutdown.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, SmokeError};

/// Something that can tell whether the backend is ready.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `true` when the health endpoint answered with a success status.
    async fn is_healthy(&self) -> bool;
}

/// Lifecycle of the supervised backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    NotStarted,
    Starting,
    Healthy,
    TimedOut,
}

/// How the backend is launched when it is not already running.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendCommand {
    /// Executable to run.
    pub program: String,

    /// Arguments passed to the executable.
    pub args: Vec<String>,

    /// Working directory; the current directory when unset.
    pub cwd: Option<PathBuf>,
}

impl Default for BackendCommand {
    fn default() -> Self {
        Self {
            program: "node".to_string(),
            args: vec!["backend/server.js".to_string()],
            cwd: None,
        }
    }
}

impl BackendCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            cwd: None,
        }
    }

    pub fn with_cwd(mut self, cwd: PathBuf) -> Self {
        self.cwd = Some(cwd);
        self
    }
}

/// Polling and shutdown budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    pub poll_interval: Duration,
    pub max_attempts: u32,

    /// Upper bound on a single probe; an unanswered probe counts as unhealthy.
    pub probe_timeout: Duration,

    pub shutdown_grace: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_attempts: 60,
            probe_timeout: Duration::from_secs(2),
            shutdown_grace: Duration::from_millis(1500),
        }
    }
}

/// Append-only output buffer shared with the pump tasks.
///
/// Raw bytes are kept so a character split across two reads survives intact.
#[derive(Debug, Clone, Default)]
pub struct LogBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl LogBuffer {
    pub fn append(&self, bytes: &[u8]) {
        if let Ok(mut buf) = self.inner.lock() {
            buf.extend_from_slice(bytes);
        }
    }

    pub fn snapshot(&self) -> String {
        self.inner
            .lock()
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default()
    }
}

fn pump<R>(mut reader: R, logs: LogBuffer) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => logs.append(&chunk[..n]),
            }
        }
    })
}

/// Starts, health-polls and stops the backend service.
pub struct BackendSupervisor {
    probe: Arc<dyn HealthProbe>,
    command: BackendCommand,
    port: u16,
    policy: HealthPolicy,
    state: SupervisorState,
    child: Option<Child>,
    pumps: Vec<JoinHandle<()>>,
    logs: LogBuffer,
}

impl BackendSupervisor {
    pub fn new(
        probe: Arc<dyn HealthProbe>,
        command: BackendCommand,
        port: u16,
        policy: HealthPolicy,
    ) -> Self {
        Self {
            probe,
            command,
            port,
            policy,
            state: SupervisorState::NotStarted,
            child: None,
            pumps: Vec::new(),
            logs: LogBuffer::default(),
        }
    }

    /// Current lifecycle state. A failed spawn leaves the supervisor in
    /// `NotStarted`, since nothing is running.
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Whether this supervisor started (and therefore owns) the backend.
    pub fn owns_process(&self) -> bool {
        self.child.is_some()
    }

    /// Combined stdout/stderr of the owned backend, trimmed.
    ///
    /// `None` for a pre-existing backend or when nothing was captured.
    pub fn captured_logs(&self) -> Option<String> {
        if !self.owns_process() {
            return None;
        }
        let logs = self.logs.snapshot();
        let trimmed = logs.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }

    /// Make sure the backend answers its health probe.
    ///
    /// Returns immediately, without spawning, if the backend is already up.
    /// Otherwise starts it and polls at the configured interval until the
    /// first successful probe or until the attempt budget is spent.
    pub async fn ensure_healthy(&mut self) -> Result<()> {
        if self.state == SupervisorState::Healthy {
            return Ok(());
        }

        if self.probe_once().await {
            self.state = SupervisorState::Healthy;
            info!(port = self.port, "Backend already healthy");
            return Ok(());
        }

        self.state = SupervisorState::Starting;
        if let Err(e) = self.spawn() {
            self.state = SupervisorState::NotStarted;
            return Err(e);
        }

        for attempt in 1..=self.policy.max_attempts {
            if self.probe_once().await {
                self.state = SupervisorState::Healthy;
                info!(port = self.port, attempt, "Backend became healthy");
                return Ok(());
            }
            debug!(port = self.port, attempt, "Backend not ready yet");
            tokio::time::sleep(self.policy.poll_interval).await;
        }

        self.state = SupervisorState::TimedOut;
        warn!(port = self.port, attempts = self.policy.max_attempts, "Backend health check timed out");
        Err(SmokeError::HealthCheckTimeout {
            port: self.port,
            attempts: self.policy.max_attempts,
        })
    }

    /// One probe, bounded by `probe_timeout`.
    async fn probe_once(&self) -> bool {
        match tokio::time::timeout(self.policy.probe_timeout, self.probe.is_healthy()).await {
            Ok(healthy) => healthy,
            Err(_) => {
                debug!(port = self.port, "Health probe timed out");
                false
            }
        }
    }

    fn spawn(&mut self) -> Result<()> {
        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .env("PORT", self.port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &self.command.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|source| SmokeError::Spawn {
            program: self.command.program.clone(),
            source,
        })?;

        if let Some(stdout) = child.stdout.take() {
            self.pumps.push(pump(stdout, self.logs.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            self.pumps.push(pump(stderr, self.logs.clone()));
        }

        info!(program = %self.command.program, pid = ?child.id(), port = self.port, "Started backend");
        self.child = Some(child);
        Ok(())
    }

    /// Stop the owned backend, if any.
    ///
    /// Sends a termination signal and waits up to the shutdown grace period.
    /// Never escalates and never fails; safe to call more than once.
    pub async fn shutdown(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        terminate(&mut child);
        match tokio::time::timeout(self.policy.shutdown_grace, child.wait()).await {
            Ok(Ok(status)) => info!(%status, "Backend exited"),
            Ok(Err(e)) => debug!(error = %e, "Waiting for backend failed"),
            Err(_) => warn!(
                grace_ms = self.policy.shutdown_grace.as_millis() as u64,
                "Backend still running after grace period"
            ),
        }

        for handle in self.pumps.drain(..) {
            handle.abort();
        }
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: plain signal delivery to a pid we spawned and still hold.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            debug!(pid, "SIGTERM delivery failed");
        }
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Terminating backend failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    /// Answers from a script, then repeats the last answer.
    struct ScriptedProbe {
        answers: Mutex<VecDeque<bool>>,
        fallback: bool,
        calls: AtomicUsize,
    }

    impl ScriptedProbe {
        fn new(answers: &[bool], fallback: bool) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.iter().copied().collect()),
                fallback,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn is_healthy(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answers
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(self.fallback)
        }
    }

    fn missing_binary() -> BackendCommand {
        BackendCommand::new("smoke-ci-no-such-backend-binary", vec![])
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_healthy_skips_spawn() {
        let probe = ScriptedProbe::new(&[], true);
        let mut supervisor =
            BackendSupervisor::new(probe.clone(), missing_binary(), 18080, HealthPolicy::default());

        let started = Instant::now();
        supervisor.ensure_healthy().await.expect("healthy backend");

        assert!(started.elapsed() < HealthPolicy::default().poll_interval);
        assert_eq!(supervisor.state(), SupervisorState::Healthy);
        assert!(!supervisor.owns_process());
        assert!(supervisor.captured_logs().is_none());
        assert_eq!(probe.calls(), 1);

        supervisor.shutdown().await;
        assert_eq!(supervisor.state(), SupervisorState::Healthy);
    }

    #[cfg(unix)]
    #[tokio::test(start_paused = true)]
    async fn test_never_healthy_times_out_after_full_budget() {
        let policy = HealthPolicy {
            poll_interval: Duration::from_millis(500),
            max_attempts: 6,
            probe_timeout: Duration::from_millis(200),
            shutdown_grace: Duration::from_millis(100),
        };
        let probe = ScriptedProbe::new(&[], false);
        let mut supervisor = BackendSupervisor::new(
            probe.clone(),
            BackendCommand::new("true", vec![]),
            18099,
            policy,
        );

        let started = Instant::now();
        let err = supervisor.ensure_healthy().await.unwrap_err();

        assert!(started.elapsed() >= policy.poll_interval * policy.max_attempts);
        assert!(matches!(err, SmokeError::HealthCheckTimeout { port: 18099, attempts: 6 }));
        assert_eq!(supervisor.state(), SupervisorState::TimedOut);
        assert!(supervisor.owns_process());
        // One initial probe plus one per attempt.
        assert_eq!(probe.calls(), 7);

        supervisor.shutdown().await;
        assert!(!supervisor.owns_process());
    }

    #[cfg(unix)]
    #[tokio::test(start_paused = true)]
    async fn test_first_success_ends_polling() {
        let probe = ScriptedProbe::new(&[false, false, false, true], false);
        let mut supervisor = BackendSupervisor::new(
            probe.clone(),
            BackendCommand::new("sleep", vec!["5".to_string()]),
            18098,
            HealthPolicy::default(),
        );

        let started = Instant::now();
        supervisor.ensure_healthy().await.expect("becomes healthy");

        // Initial probe, then attempts 1 and 2 fail, attempt 3 succeeds.
        assert_eq!(probe.calls(), 4);
        let interval = HealthPolicy::default().poll_interval;
        assert!(started.elapsed() >= interval * 2);
        assert!(started.elapsed() < interval * 3);
        assert_eq!(supervisor.state(), SupervisorState::Healthy);
        assert!(supervisor.owns_process());

        supervisor.shutdown().await;
        assert!(!supervisor.owns_process());
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let probe = ScriptedProbe::new(&[], false);
        let mut supervisor =
            BackendSupervisor::new(probe, missing_binary(), 18097, HealthPolicy::default());

        let err = supervisor.ensure_healthy().await.unwrap_err();
        assert!(matches!(err, SmokeError::Spawn { .. }));
        assert_eq!(supervisor.state(), SupervisorState::NotStarted);
        assert!(!supervisor.owns_process());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_captures_backend_output() {
        let probe = ScriptedProbe::new(&[false, true], false);
        let policy = HealthPolicy {
            poll_interval: Duration::from_millis(200),
            ..HealthPolicy::default()
        };
        let mut supervisor = BackendSupervisor::new(
            probe,
            BackendCommand::new(
                "sh",
                vec!["-c".to_string(), "echo listening; echo warn >&2; sleep 5".to_string()],
            ),
            18096,
            policy,
        );

        supervisor.ensure_healthy().await.expect("healthy");
        let mut logs = None;
        for _ in 0..50 {
            logs = supervisor.captured_logs();
            if logs.as_deref().is_some_and(|l| l.contains("listening") && l.contains("warn")) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let logs = logs.expect("logs captured");
        assert!(logs.contains("listening"));
        assert!(logs.contains("warn"));

        supervisor.shutdown().await;
    }

    #[test]
    fn test_log_buffer_appends() {
        let logs = LogBuffer::default();
        logs.append(b"a");
        logs.clone().append(b"b");
        assert_eq!(logs.snapshot(), "ab");
    }

    #[test]
    fn test_log_buffer_keeps_split_characters() {
        let logs = LogBuffer::default();
        let text = "온도 ok".as_bytes();
        logs.append(&text[..1]);
        logs.append(&text[1..4]);
        logs.append(&text[4..]);
        assert_eq!(logs.snapshot(), "온도 ok");
    }

    /// Never answers.
    struct HangingProbe;

    #[async_trait]
    impl HealthProbe for HangingProbe {
        async fn is_healthy(&self) -> bool {
            std::future::pending::<()>().await;
            true
        }
    }

    #[cfg(unix)]
    #[tokio::test(start_paused = true)]
    async fn test_unanswered_probe_still_times_out() {
        let policy = HealthPolicy {
            poll_interval: Duration::from_millis(50),
            max_attempts: 3,
            probe_timeout: Duration::from_millis(100),
            shutdown_grace: Duration::from_millis(100),
        };
        let mut supervisor = BackendSupervisor::new(
            Arc::new(HangingProbe),
            BackendCommand::new("true", vec![]),
            18095,
            policy,
        );

        let started = Instant::now();
        let err = supervisor.ensure_healthy().await.unwrap_err();

        assert!(matches!(err, SmokeError::HealthCheckTimeout { attempts: 3, .. }));
        // Initial probe plus three bounded probes and three sleeps.
        let budget = policy.probe_timeout * 4 + policy.poll_interval * 3;
        assert!(started.elapsed() >= budget);
        assert!(started.elapsed() < budget + policy.poll_interval);
        assert_eq!(supervisor.state(), SupervisorState::TimedOut);

        supervisor.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_returns_after_grace_when_term_ignored() {
        let policy = HealthPolicy {
            poll_interval: Duration::from_millis(20),
            shutdown_grace: Duration::from_millis(300),
            ..HealthPolicy::default()
        };
        let mut supervisor = BackendSupervisor::new(
            ScriptedProbe::new(&[false, true], false),
            BackendCommand::new(
                "sh",
                vec!["-c".to_string(), "trap '' TERM; echo ready; sleep 5".to_string()],
            ),
            18094,
            policy,
        );
        supervisor.ensure_healthy().await.expect("healthy");

        // The trap must be installed before the signal is sent.
        for _ in 0..100 {
            if supervisor.captured_logs().is_some_and(|l| l.contains("ready")) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let started = std::time::Instant::now();
        supervisor.shutdown().await;
        let elapsed = started.elapsed();

        assert!(elapsed >= policy.shutdown_grace, "returned early: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "shutdown hung: {elapsed:?}");
        assert!(!supervisor.owns_process());
    }

    #[test]
    fn test_default_command_runs_node_server() {
        let cmd = BackendCommand::default();
        assert_eq!(cmd.program, "node");
        assert_eq!(cmd.args, vec!["backend/server.js".to_string()]);
    }
}
