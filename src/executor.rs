//! Command Execution
//!
//! Every sysfs write, device query and privileged operation goes through the
//! [`Executor`] seam so connector logic stays testable with scripted output.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::Arc;
use tracing::debug;

// =============================================================================
// Request / Output
// =============================================================================

/// A single command invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    /// Program name, or the full command line when `shell` is set
    pub program: String,
    /// Arguments (unused for shell commands)
    pub args: Vec<String>,
    /// Run through `sh -c` (needed for glob expansion)
    pub shell: bool,
    /// Data written to stdin
    pub input: Option<String>,
    /// Escalate privileges through the root helper
    pub run_as_root: bool,
    /// Command prefix used for escalation (e.g. `sudo`)
    pub root_helper: Option<String>,
    /// Exit codes treated as success
    pub accepted_exit_codes: Vec<i32>,
}

impl ExecRequest {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            shell: false,
            input: None,
            run_as_root: false,
            root_helper: None,
            accepted_exit_codes: vec![0],
        }
    }

    /// A command line interpreted by the shell
    pub fn shell(command_line: impl Into<String>) -> Self {
        Self {
            shell: true,
            ..Self::new(command_line)
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

    pub fn input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn as_root(mut self, root_helper: &str) -> Self {
        self.run_as_root = true;
        self.root_helper = Some(root_helper.to_string());
        self
    }

    pub fn accept_exit_codes(mut self, codes: &[i32]) -> Self {
        self.accepted_exit_codes = codes.to_vec();
        self
    }

    /// Full argv including the root helper prefix
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::new();
        if self.run_as_root {
            if let Some(helper) = &self.root_helper {
                argv.extend(helper.split_whitespace().map(str::to_string));
            }
        }
        if self.shell {
            argv.push("sh".to_string());
            argv.push("-c".to_string());
            argv.push(self.program.clone());
        } else {
            argv.push(self.program.clone());
            argv.extend(self.args.iter().cloned());
        }
        argv
    }

    /// The command as the caller wrote it, without the root helper
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

impl std::fmt::Display for ExecRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.command_line())
    }
}

/// Captured output of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn stdout(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Default::default()
        }
    }
}

// =============================================================================
// Executor Port
// =============================================================================

/// Port for running external commands
pub trait Executor: Send + Sync {
    /// Run a command; fails with [`Error::ProcessExecution`] on an exit code
    /// outside `accepted_exit_codes`
    fn execute(&self, request: &ExecRequest) -> Result<CommandOutput>;
}

pub type ExecutorRef = Arc<dyn Executor>;

// =============================================================================
// Process Executor
// =============================================================================

/// Runs commands as local child processes
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor;

impl ProcessExecutor {
    pub fn new() -> Self {
        Self
    }

    pub fn shared() -> ExecutorRef {
        Arc::new(Self)
    }
}

impl Executor for ProcessExecutor {
    fn execute(&self, request: &ExecRequest) -> Result<CommandOutput> {
        let argv = request.argv();
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::Internal("empty command".into()))?;

        debug!("Executing: {}", argv.join(" "));

        let mut command = Command::new(program);
        command.args(args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        if request.input.is_some() {
            command.stdin(Stdio::piped());
        } else {
            command.stdin(Stdio::null());
        }

        let mut child = command.spawn()?;
        if let Some(payload) = &request.input {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(payload.as_bytes())?;
                stdin.flush().ok();
            }
        }

        let output = child.wait_with_output()?;
        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        };

        if output.status.code().is_some()
            && request.accepted_exit_codes.contains(&result.exit_code)
        {
            return Ok(result);
        }

        Err(Error::ProcessExecution {
            command: request.command_line(),
            exit_code: output.status.code(),
            stdout: result.stdout,
            stderr: result.stderr.trim().to_string(),
        })
    }
}

// =============================================================================
// Recording Executor
// =============================================================================

type Responder = Box<dyn Fn(&ExecRequest) -> Result<CommandOutput> + Send + Sync>;

/// Records every request instead of running it.
///
/// Replies come from a scripted queue first, then from the responder, and
/// default to empty successful output. Backs the binary's `--dry-run` mode.
pub struct RecordingExecutor {
    requests: Mutex<Vec<ExecRequest>>,
    script: Mutex<VecDeque<Result<CommandOutput>>>,
    responder: Option<Responder>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            responder: None,
        }
    }

    /// Reply with the given results in order
    pub fn with_script<I>(replies: I) -> Self
    where
        I: IntoIterator<Item = Result<CommandOutput>>,
    {
        let executor = Self::new();
        executor.script.lock().extend(replies);
        executor
    }

    /// Reply by calling `responder` for each request
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&ExecRequest) -> Result<CommandOutput> + Send + Sync + 'static,
    {
        Self {
            responder: Some(Box::new(responder)),
            ..Self::new()
        }
    }

    /// Everything executed so far
    pub fn requests(&self) -> Vec<ExecRequest> {
        self.requests.lock().clone()
    }

    /// Command lines executed so far
    pub fn command_lines(&self) -> Vec<String> {
        self.requests.lock().iter().map(ExecRequest::command_line).collect()
    }

    pub fn clear(&self) {
        self.requests.lock().clear();
    }
}

impl Default for RecordingExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RecordingExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingExecutor")
            .field("requests", &self.requests.lock().len())
            .finish()
    }
}

impl Executor for RecordingExecutor {
    fn execute(&self, request: &ExecRequest) -> Result<CommandOutput> {
        self.requests.lock().push(request.clone());

        if let Some(reply) = self.script.lock().pop_front() {
            return reply;
        }
        match &self.responder {
            Some(responder) => responder(request),
            None => Ok(CommandOutput::default()),
        }
    }
}
