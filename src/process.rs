use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::{PipelineError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
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

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success() -> Self {
        Self {
            code: Some(0),
            success: true,
            ..Self::default()
        }
    }

    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            success: false,
            stderr: stderr.into(),
            ..Self::default()
        }
    }

    pub fn diagnostics_tail(&self, lines: usize) -> String {
        let all: Vec<&str> = self.stderr.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }

    pub fn describe_status(&self) -> String {
        match self.code {
            Some(code) => format!("exit status {code}"),
            None => "termination by signal".to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to launch '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("command timed out")]
    TimedOut,
    #[error("command cancelled")]
    Cancelled,
    #[error("i/o error while running command: {0}")]
    Io(#[from] std::io::Error),
}

impl CommandError {
    pub fn into_pipeline_error(self, timeout: Option<Duration>) -> PipelineError {
        match self {
            CommandError::Spawn { program, source } => PipelineError::environment(format!(
                "'{program}' is not available on this host: {source}"
            )),
            CommandError::TimedOut => PipelineError::TimedOut(timeout.unwrap_or_default()),
            CommandError::Cancelled => PipelineError::Cancelled,
            CommandError::Io(io) => PipelineError::Io(io),
        }
    }
}

/// Cancellation and time limit a child process runs under.
#[derive(Debug, Clone, Default)]
pub struct Budget {
    pub cancel: CancellationToken,
    pub timeout: Option<Duration>,
    pub deadline: Option<Instant>,
}

impl Budget {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(PipelineError::TimedOut(self.timeout.unwrap_or_default()));
        }
        Ok(())
    }

    /// A non-zero exit is returned as output; callers decide what it means.
    pub fn run(&self, runner: &dyn CommandRunner, spec: &CommandSpec) -> Result<CommandOutput> {
        self.checkpoint()?;
        runner
            .run(spec, &self.cancel, self.deadline)
            .map_err(|err| err.into_pipeline_error(self.timeout))
    }
}

pub trait CommandRunner: Send + Sync {
    /// Run `spec` to completion, killing it if `cancel` fires or `deadline`
    /// passes first.
    fn run(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> std::result::Result<CommandOutput, CommandError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> std::result::Result<CommandOutput, CommandError> {
        if cancel.is_cancelled() {
            return Err(CommandError::Cancelled);
        }

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &spec.current_dir {
            command.current_dir(dir);
        }

        debug!(command = %spec, "Spawning");
        let mut child = command.spawn().map_err(|source| CommandError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let program = spec.program.clone();
        let stdout_reader = thread::spawn(move || {
            let mut buffer = String::new();
            if let Some(mut pipe) = stdout {
                let _ = pipe.read_to_string(&mut buffer);
            }
            buffer
        });
        let stderr_reader = thread::spawn(move || {
            let mut buffer = String::new();
            if let Some(pipe) = stderr {
                for line in BufReader::new(pipe).lines().map_while(|l| l.ok()) {
                    trace!(program = program.as_str(), "{line}");
                    buffer.push_str(&line);
                    buffer.push('\n');
                }
            }
            buffer
        });

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            let expired = deadline.is_some_and(|d| Instant::now() >= d);
            if cancel.is_cancelled() || expired {
                let _ = child.kill();
                let _ = child.wait();
                let _ = stdout_reader.join();
                let _ = stderr_reader.join();
                return Err(if expired {
                    CommandError::TimedOut
                } else {
                    CommandError::Cancelled
                });
            }
            thread::sleep(POLL_INTERVAL);
        };

        let stdout = stdout_reader.join().unwrap_or_default();
        let stderr = stderr_reader.join().unwrap_or_default();
        Ok(CommandOutput {
            code: status.code(),
            success: status.success(),
            stdout,
            stderr,
        })
    }
}
