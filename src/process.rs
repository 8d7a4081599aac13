//! Subprocess driver -- spawn the project under test, enforce timeouts,
//! optionally sample its CPU and memory while it runs.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

/// How long to keep draining pipes after the child is gone.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("command not found: {program}")]
    NotFound { program: String },

    #[error("permission denied: {program}")]
    PermissionDenied { program: String },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl ProcessError {
    fn from_spawn(program: &str, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::NotFound => ProcessError::NotFound {
                program: program.to_string(),
            },
            std::io::ErrorKind::PermissionDenied => ProcessError::PermissionDenied {
                program: program.to_string(),
            },
            _ => ProcessError::Spawn {
                program: program.to_string(),
                source,
            },
        }
    }
}

/// A single command to run.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub clear_env: bool,
    pub stdin: Option<String>,
    pub timeout: Duration,
    /// Sampling interval when resource sampling is requested.
    pub sample_interval: Option<Duration>,
}

impl Invocation {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            clear_env: false,
            stdin: None,
            timeout,
            sample_interval: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Start from an empty environment; only explicit `env` entries are passed.
    pub fn clear_env(mut self) -> Self {
        self.clear_env = true;
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn sampled(mut self, interval: Duration) -> Self {
        self.sample_interval = Some(interval);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Shell-like rendering for logs and artifacts.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(|part| {
                if part.contains(char::is_whitespace) {
                    format!("'{}'", part)
                } else {
                    part.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Resource usage observed while a process was running.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub peak_memory_kb: u64,
    pub avg_cpu_percent: f32,
    pub samples: usize,
}

impl ResourceUsage {
    pub fn peak_memory_mb(&self) -> f64 {
        self.peak_memory_kb as f64 / 1024.0
    }

    fn from_samples(samples: &[(u64, f32)]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let peak_memory_kb = samples.iter().map(|(m, _)| *m).max().unwrap_or(0);
        let cpu_sum: f32 = samples.iter().map(|(_, c)| *c).sum();
        Some(Self {
            peak_memory_kb,
            avg_cpu_percent: cpu_sum / samples.len() as f32,
            samples: samples.len(),
        })
    }
}

/// Captured result of a finished (or killed) process.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutput {
    /// `None` when the process was killed or terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
    pub timed_out: bool,
    pub resources: Option<ResourceUsage>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Runs commands on behalf of the stages.
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, ProcessError>;
}

/// Runs commands as real child processes.
///
/// Children are spawned with `kill_on_drop`, so abandoning a run (for example
/// when the scheduler aborts a stage on timeout) also terminates the process.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait::async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, inv: &Invocation) -> Result<CommandOutput, ProcessError> {
        debug!(command = %inv.command_line(), timeout_ms = inv.timeout.as_millis() as u64, "spawning");

        let mut cmd = tokio::process::Command::new(&inv.program);
        cmd.args(&inv.args)
            .stdin(if inv.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &inv.cwd {
            cmd.current_dir(dir);
        }
        if inv.clear_env {
            cmd.env_clear();
        }
        cmd.envs(inv.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        let start = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| ProcessError::from_spawn(&inv.program, e))?;

        if let (Some(input), Some(mut pipe)) = (inv.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                // A child that exits early closes the pipe; that's not our failure.
                let _ = pipe.write_all(input.as_bytes()).await;
            });
        }

        let stdout_task = child.stdout.take().map(|s| tokio::spawn(drain(s)));
        let stderr_task = child.stderr.take().map(|s| tokio::spawn(drain(s)));

        // Background sampler, stopped once the child is gone.
        let (tx, mut rx) = tokio::sync::mpsc::channel::<(u64, f32)>(1024);
        let sampler = match (inv.sample_interval, child.id()) {
            (Some(interval), Some(pid)) => Some(tokio::spawn(sample_process(pid, interval, tx))),
            _ => None,
        };

        let (exit_code, timed_out) = match tokio::time::timeout(inv.timeout, child.wait()).await {
            Ok(Ok(status)) => (status.code(), false),
            Ok(Err(source)) => {
                return Err(ProcessError::Wait {
                    program: inv.program.clone(),
                    source,
                })
            }
            Err(_) => {
                warn!(command = %inv.command_line(), "process exceeded timeout, killing");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "failed to kill timed out process");
                }
                (None, true)
            }
        };
        let elapsed = start.elapsed();

        if let Some(handle) = sampler {
            handle.abort();
        }
        let mut samples = Vec::new();
        while let Ok(sample) = rx.try_recv() {
            samples.push(sample);
        }

        let stdout = collect(stdout_task).await;
        let stderr = collect(stderr_task).await;

        Ok(CommandOutput {
            exit_code,
            stdout,
            stderr,
            elapsed,
            timed_out,
            resources: ResourceUsage::from_samples(&samples),
        })
    }
}

async fn drain<R: AsyncRead + Unpin>(mut reader: R) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Err(e) = reader.read_to_end(&mut buf).await {
        debug!(error = %e, captured = buf.len(), "output pipe read failed, output truncated");
    }
    buf
}

async fn collect(task: Option<tokio::task::JoinHandle<Vec<u8>>>) -> String {
    let Some(mut task) = task else {
        return String::new();
    };
    match tokio::time::timeout(PIPE_DRAIN_GRACE, &mut task).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(_)) => String::new(),
        Err(_) => {
            // A grandchild may still hold the pipe open.
            task.abort();
            String::new()
        }
    }
}

/// Poll memory and CPU of `pid` until the process disappears or the receiver is dropped.
async fn sample_process(pid: u32, interval: Duration, tx: tokio::sync::mpsc::Sender<(u64, f32)>) {
    use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    let refresh = ProcessRefreshKind::new().with_memory().with_cpu();

    loop {
        if tx.is_closed() {
            break;
        }
        sys.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), true, refresh);
        match sys.process(pid) {
            Some(process) => {
                let sample = (process.memory() / 1024, process.cpu_usage());
                if tx.send(sample).await.is_err() {
                    break;
                }
            }
            None => break,
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted runner for stage tests.

    use super::*;
    use std::sync::Mutex;

    pub(crate) struct ScriptedRunner {
        rules: Vec<(String, Result<CommandOutput, String>)>,
        fallback: CommandOutput,
        pub(crate) seen: Mutex<Vec<String>>,
    }

    pub(crate) fn output(code: i32, stdout: &str, stderr: &str) -> CommandOutput {
        CommandOutput {
            exit_code: Some(code),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            elapsed: Duration::from_millis(5),
            timed_out: false,
            resources: None,
        }
    }

    impl ScriptedRunner {
        /// Every command succeeds with `usage: app` on stdout unless a rule matches.
        pub(crate) fn new() -> Self {
            Self {
                rules: Vec::new(),
                fallback: output(0, "usage: app [options]", ""),
                seen: Mutex::new(Vec::new()),
            }
        }

        /// First rule whose needle appears in the command line wins.
        pub(crate) fn on(mut self, needle: &str, out: CommandOutput) -> Self {
            self.rules.push((needle.to_string(), Ok(out)));
            self
        }

        pub(crate) fn missing(mut self, needle: &str) -> Self {
            self.rules.push((needle.to_string(), Err(needle.to_string())));
            self
        }

        pub(crate) fn commands(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, inv: &Invocation) -> Result<CommandOutput, ProcessError> {
            let line = inv.command_line();
            self.seen.lock().unwrap().push(line.clone());
            for (needle, reply) in &self.rules {
                if line.contains(needle.as_str()) {
                    return match reply {
                        Ok(out) => Ok(out.clone()),
                        Err(program) => Err(ProcessError::NotFound {
                            program: program.clone(),
                        }),
                    };
                }
            }
            Ok(self.fallback.clone())
        }
    }
}
