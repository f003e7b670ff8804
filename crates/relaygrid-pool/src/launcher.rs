//! Worker launching — how a pool turns a worker id into an OS process.
//!
//! The pool only sees the [`Launcher`] and [`WorkerProcess`] traits, so the
//! scheduling logic can be exercised without spawning real processes.

use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use relaygrid_core::config::PoolConfig;
use relaygrid_core::{AgentId, WorkerId};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::{PoolError, PoolResult};

/// Everything a worker needs to know about itself at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub agent_id: AgentId,
    pub worker_id: WorkerId,
    pub private_ip: String,
    pub public_ip: String,
}

impl LaunchSpec {
    /// Arguments appended to the configured command line.
    pub fn to_args(&self) -> Vec<String> {
        vec![
            "--agent-id".to_string(),
            self.agent_id.clone(),
            "--worker-id".to_string(),
            self.worker_id.clone(),
            "--private-ip".to_string(),
            self.private_ip.clone(),
            "--public-ip".to_string(),
            self.public_ip.clone(),
        ]
    }
}

/// Starts worker processes.
pub trait Launcher: Send + Sync + 'static {
    fn launch(&self, spec: &LaunchSpec) -> PoolResult<Box<dyn WorkerProcess>>;
}

/// A running worker as seen by its supervisor.
#[async_trait]
pub trait WorkerProcess: Send + 'static {
    /// OS process id, if there is one.
    fn pid(&self) -> Option<u32>;

    /// Wait for the process to exit. Returns its exit code, `None` when it
    /// was terminated by a signal.
    async fn wait(&mut self) -> io::Result<Option<i32>>;

    /// Forcefully terminate the process.
    async fn kill(&mut self) -> io::Result<()>;
}

// ── OS processes ───────────────────────────────────────────────────

/// Launches workers as detached child processes.
///
/// Each worker gets its own process group so signals aimed at the agent do
/// not reach it; the agent tears workers down explicitly.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: String,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(config.program.clone(), config.args.clone())
    }

    fn command(&self, spec: &LaunchSpec) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .args(spec.to_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        command
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, spec: &LaunchSpec) -> PoolResult<Box<dyn WorkerProcess>> {
        let mut child = self
            .command(spec)
            .spawn()
            .map_err(|e| PoolError::Launch(format!("{}: {e}", self.program)))?;

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, spec.worker_id.clone(), OutputStream::Stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, spec.worker_id.clone(), OutputStream::Stderr);
        }

        debug!(worker_id = %spec.worker_id, pid = ?child.id(), program = %self.program, "worker process spawned");
        Ok(Box::new(ChildProcess { child }))
    }
}

#[derive(Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

/// Forward a worker's output into the log, one event per line.
fn forward_output<R>(stream: R, worker_id: WorkerId, kind: OutputStream)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match kind {
                    OutputStream::Stdout => info!(target: "relaygrid::worker", %worker_id, "{line}"),
                    OutputStream::Stderr => warn!(target: "relaygrid::worker", %worker_id, "{line}"),
                },
                Ok(None) => break,
                Err(e) => {
                    debug!(%worker_id, error = %e, "stopped reading worker output");
                    break;
                }
            }
        }
    });
}

struct ChildProcess {
    child: Child,
}

#[async_trait]
impl WorkerProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.child.wait().await?.code())
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> LaunchSpec {
        LaunchSpec {
            agent_id: "agent-1".to_string(),
            worker_id: "w-1".to_string(),
            private_ip: "10.0.0.5".to_string(),
            public_ip: "203.0.113.5".to_string(),
        }
    }

    #[test]
    fn spec_args_follow_configured_order() {
        assert_eq!(
            spec().to_args(),
            vec![
                "--agent-id",
                "agent-1",
                "--worker-id",
                "w-1",
                "--private-ip",
                "10.0.0.5",
                "--public-ip",
                "203.0.113.5",
            ]
        );
    }

    #[tokio::test]
    async fn missing_program_is_a_launch_error() {
        let launcher = ProcessLauncher::new("/nonexistent/relay-worker", Vec::new());
        let result = launcher.launch(&spec());
        assert!(matches!(result, Err(PoolError::Launch(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_code_is_reported() {
        // `sh -c` treats the appended worker arguments as positional parameters.
        let launcher = ProcessLauncher::new("sh", vec!["-c".to_string(), "exit 3".to_string()]);
        let mut process = launcher.launch(&spec()).unwrap();
        assert!(process.pid().is_some());
        assert_eq!(process.wait().await.unwrap(), Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_terminates_with_a_signal() {
        let launcher = ProcessLauncher::new("sh", vec!["-c".to_string(), "sleep 30".to_string()]);
        let mut process = launcher.launch(&spec()).unwrap();

        process.kill().await.unwrap();
        assert_eq!(process.wait().await.unwrap(), None);
    }
}
