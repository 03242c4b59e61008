use crate::close_on_drop::CloseOnDrop;
use crate::error::{SendError, SpawnError};
use crate::pump::{LineParsingOptions, spawn_pump};
use crate::reader::{AwaitRequest, Awaited, MatchMode, OutputReader, Pattern};
use crate::signal;
use crate::transcript::Transcript;
use regex::Regex;
use std::borrow::Cow;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::LazyLock;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Lifecycle of an [InteractiveProcess].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Spawned,
    Running,
    ShuttingDown,
    Terminated,
}

/// Represents the running state of a process.
#[derive(Debug)]
pub enum RunningState {
    /// Process is still running.
    Running,

    /// Process has terminated with the given exit status.
    Terminated(ExitStatus),

    /// Failed to determine process state.
    Uncertain(io::Error),
}

impl RunningState {
    pub fn as_bool(&self) -> bool {
        match self {
            RunningState::Running => true,
            RunningState::Terminated(_) | RunningState::Uncertain(_) => false,
        }
    }
}

impl From<RunningState> for bool {
    fn from(is_running: RunningState) -> Self {
        is_running.as_bool()
    }
}

/// The stage of the shutdown escalation at which the process was gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStage {
    /// The process had already exited before shutdown began.
    AlreadyExited,

    /// The process exited after receiving the exit command.
    ExitCommand,

    /// The process exited after receiving the termination signal.
    Terminate,

    /// The process had to be killed.
    Kill,
}

/// Outcome of shutting down a process. Shutting down never fails, this only reports how it went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shutdown {
    pub stage: ShutdownStage,

    /// `None` if the process could not be reaped, even after being killed.
    pub status: Option<ExitStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownOptions {
    /// Line sent to ask the process to exit on its own. `None` skips this stage.
    ///
    /// default: `Some("exit")`
    pub exit_command: Option<Cow<'static, str>>,

    /// How long to wait for the process to act on the exit command.
    ///
    /// default: 2 s
    pub exit_timeout: Duration,

    /// How long to wait for the process to act on the termination signal.
    ///
    /// default: 2 s
    pub terminate_timeout: Duration,

    /// How long to wait for the process to be reaped after killing it.
    ///
    /// default: 2 s
    pub kill_timeout: Duration,
}

impl Default for ShutdownOptions {
    fn default() -> Self {
        Self {
            exit_command: Some(Cow::Borrowed("exit")),
            exit_timeout: Duration::from_secs(2),
            terminate_timeout: Duration::from_secs(2),
            kill_timeout: Duration::from_secs(2),
        }
    }
}

/// Configures how an [InteractiveProcess] is spawned.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    prompt: Pattern,
    line_parsing: LineParsingOptions,
    shutdown: ShutdownOptions,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            prompt: default_prompt(),
            line_parsing: LineParsingOptions::default(),
            shutdown: ShutdownOptions::default(),
        }
    }
}

impl SpawnOptions {
    /// Sets the pattern marking a line as the prompt of the process.
    ///
    /// Default is `>>\s`.
    pub fn prompt(mut self, prompt: Pattern) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn line_parsing(mut self, line_parsing: LineParsingOptions) -> Self {
        self.line_parsing = line_parsing;
        self
    }

    pub fn shutdown(mut self, shutdown: ShutdownOptions) -> Self {
        self.shutdown = shutdown;
        self
    }
}

/// Completes once `child` exited. Never completes if its state can not be determined.
async fn exited(child: &mut Child) {
    if let Err(err) = child.wait().await {
        tracing::warn!(?err, "Could not wait for process exit while awaiting output");
        std::future::pending::<()>().await;
    }
}

static DEFAULT_PROMPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r">>\s").expect("valid prompt regex"));

pub(crate) fn default_prompt() -> Pattern {
    Pattern::Regex(DEFAULT_PROMPT.clone())
}

/// A spawned process we talk to line by line.
///
/// The output of the process (stdout and stderr, merged) is pumped into an internal conduit
/// right after spawning. All await operations consume from that conduit, while a
/// [Transcript] keeps everything ever received for diagnostics.
#[derive(Debug)]
pub struct InteractiveProcess {
    pub(crate) name: Cow<'static, str>,
    child: Child,
    stdin: Option<ChildStdin>,
    reader: OutputReader,
    transcript: Transcript,
    pumps: Vec<JoinHandle<()>>,
    state: ControllerState,
    prompt: Pattern,
    shutdown_options: ShutdownOptions,
    shutdown: Option<Shutdown>,
    failed_sends: usize,
    last_send_error: Option<String>,
}

impl Drop for InteractiveProcess {
    fn drop(&mut self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

impl InteractiveProcess {
    /// Spawns `cmd` with default options.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(name: impl Into<Cow<'static, str>>, cmd: Command) -> Result<Self, SpawnError> {
        Self::spawn_with(name, cmd, SpawnOptions::default())
    }

    pub fn spawn_with(
        name: impl Into<Cow<'static, str>>,
        mut cmd: Command,
        options: SpawnOptions,
    ) -> Result<Self, SpawnError> {
        let name = name.into();
        let spawn_failed = |source: io::Error| SpawnError::SpawnFailed {
            process_name: name.clone(),
            source,
        };

        // The child is killed should we be dropped without a proper shutdown.
        cmd.stdin(Stdio::piped()).kill_on_drop(true);
        let output = output::attach(&mut cmd).map_err(spawn_failed)?;
        let mut child = cmd.spawn().map_err(spawn_failed)?;
        // Releases our copies of the output pipe, so that EOF is seen once the child exits.
        drop(cmd);

        let mut state = ControllerState::Spawned;
        tracing::debug!(process = %name, pid = ?child.id(), ?state, "Spawned process");

        let stdin = child.stdin.take().ok_or_else(|| SpawnError::MissingPipe {
            process_name: name.clone(),
            pipe: "stdin",
        })?;

        let (sender, conduit) = mpsc::unbounded_channel();
        let transcript = Transcript::default();
        let pumps = output::streams(output, &mut child, &name)?
            .into_iter()
            .map(|stream| {
                spawn_pump(
                    name.clone(),
                    stream,
                    sender.clone(),
                    transcript.clone(),
                    options.line_parsing,
                )
            })
            .collect();
        // Only the pumps hold senders now. The conduit closes once all of them reached EOF.
        drop(sender);

        state = ControllerState::Running;
        Ok(Self {
            reader: OutputReader::new(name.clone(), conduit),
            name,
            child,
            stdin: Some(stdin),
            transcript,
            pumps,
            state,
            prompt: options.prompt,
            shutdown_options: options.shutdown,
            shutdown: None,
            failed_sends: 0,
            last_send_error: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Everything the process wrote so far, independent of what was awaited.
    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    //noinspection RsSelfConvention
    pub fn is_running(&mut self) -> RunningState {
        match self.child.try_wait() {
            Ok(None) => RunningState::Running,
            Ok(Some(exit_status)) => RunningState::Terminated(exit_status),
            Err(err) => RunningState::Uncertain(err),
        }
    }

    /// Number of lines that could not be delivered to the process.
    pub fn failed_sends(&self) -> usize {
        self.failed_sends
    }

    pub fn last_send_error(&self) -> Option<&str> {
        self.last_send_error.as_deref()
    }

    /// Writes `line` followed by a newline to the process input and flushes it.
    ///
    /// Only possible while the process is running. A failure is recorded and returned, but leaves
    /// the controller usable: callers interested in the process state should check
    /// [InteractiveProcess::is_running] or simply await the expected output.
    pub async fn send_line(&mut self, line: &str) -> Result<(), SendError> {
        let result = match self.state {
            ControllerState::Running => self.write_line(line).await,
            state => Err(SendError::NotRunning {
                process_name: self.name.clone(),
                state,
            }),
        };
        if let Err(err) = &result {
            tracing::warn!(process = %self.name, error = %err, "Could not send line to process");
            self.failed_sends += 1;
            self.last_send_error = Some(err.to_string());
        }
        result
    }

    async fn write_line(&mut self, line: &str) -> Result<(), SendError> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(SendError::NotRunning {
                process_name: self.name.clone(),
                state: self.state,
            });
        };
        let mut payload = String::with_capacity(line.len() + 1);
        payload.push_str(line);
        payload.push('\n');

        let io_failed = |source: io::Error| SendError::Io {
            process_name: self.name.clone(),
            source,
        };
        stdin
            .write_all(payload.as_bytes())
            .await
            .map_err(io_failed)?;
        stdin.flush().await.map_err(io_failed)
    }

    /// Waits until a line matches the prompt pattern of this process.
    pub async fn await_prompt(&mut self, timeout: Duration) -> Awaited {
        let request = AwaitRequest::new(&self.prompt, timeout, MatchMode::EachLine);
        self.reader
            .run_until_exit(request, exited(&mut self.child))
            .await
    }

    /// Waits until `pattern` matches the output accumulated during this call.
    pub async fn await_pattern(&mut self, pattern: &Pattern, timeout: Duration) -> Awaited {
        self.await_request(AwaitRequest::new(pattern, timeout, MatchMode::Accumulated))
            .await
    }

    /// Waits until `pattern` matches one newly arrived line.
    pub async fn await_line_pattern(&mut self, pattern: &Pattern, timeout: Duration) -> Awaited {
        self.await_request(AwaitRequest::new(pattern, timeout, MatchMode::EachLine))
            .await
    }

    /// Waits for the next line, whatever it is.
    pub async fn await_any_line(&mut self, timeout: Duration) -> Awaited {
        self.await_line_pattern(&Pattern::AnyLine, timeout).await
    }

    /// Runs `request` against the output of this process.
    ///
    /// Returns with [crate::AwaitStatus::EndOfOutput] once the process exited and its pending
    /// output was consumed, even if a descendant still holds the output pipe open.
    pub async fn await_request(&mut self, request: AwaitRequest<'_>) -> Awaited {
        self.reader
            .run_until_exit(request, exited(&mut self.child))
            .await
    }

    /// Direct access to the output consumer, e.g. to drain pending lines.
    pub fn reader(&mut self) -> &mut OutputReader {
        &mut self.reader
    }

    /// Shuts the process down, escalating until it is gone:
    ///
    /// 1. Send the exit command (if configured) and wait for the process to exit.
    /// 2. Send a termination signal and wait again.
    /// 3. Kill the process.
    ///
    /// Never fails. Calling this again after the process was shut down sends nothing and returns
    /// the outcome of the first shutdown.
    pub async fn close(&mut self) -> Shutdown {
        if let Some(shutdown) = self.already_shut_down() {
            return shutdown;
        }
        self.state = ControllerState::ShuttingDown;

        let shutdown = match self.exit_status() {
            Some(status) => Shutdown {
                stage: ShutdownStage::AlreadyExited,
                status: Some(status),
            },
            None => match self.request_exit().await {
                Some(status) => Shutdown {
                    stage: ShutdownStage::ExitCommand,
                    status: Some(status),
                },
                None => {
                    let options = self.shutdown_options.clone();
                    self.escalate(options.terminate_timeout, options.kill_timeout)
                        .await
                }
            },
        };
        self.finish_shutdown(shutdown)
    }

    /// Shuts the process down using signals only: terminate, wait up to `terminate_timeout`,
    /// then kill and wait up to `kill_timeout` for it to be reaped.
    ///
    /// Like [InteractiveProcess::close], this never fails and only acts once.
    pub async fn terminate(
        &mut self,
        terminate_timeout: Duration,
        kill_timeout: Duration,
    ) -> Shutdown {
        if let Some(shutdown) = self.already_shut_down() {
            return shutdown;
        }
        self.state = ControllerState::ShuttingDown;

        let shutdown = match self.exit_status() {
            Some(status) => Shutdown {
                stage: ShutdownStage::AlreadyExited,
                status: Some(status),
            },
            None => self.escalate(terminate_timeout, kill_timeout).await,
        };
        self.finish_shutdown(shutdown)
    }

    /// Kills the process right away and waits up to `kill_timeout` for it to be reaped.
    pub async fn kill(&mut self, kill_timeout: Duration) -> Shutdown {
        if let Some(shutdown) = self.already_shut_down() {
            return shutdown;
        }
        self.state = ControllerState::ShuttingDown;

        let shutdown = match self.exit_status() {
            Some(status) => Shutdown {
                stage: ShutdownStage::AlreadyExited,
                status: Some(status),
            },
            None => self.force_kill(kill_timeout).await,
        };
        self.finish_shutdown(shutdown)
    }

    /// Wraps this process, so that it is closed when the wrapper is dropped.
    ///
    /// Requires a multithreaded tokio runtime. See [CloseOnDrop].
    pub fn close_on_drop(self) -> CloseOnDrop {
        CloseOnDrop {
            process: Some(self),
        }
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shutdown.is_some()
    }

    fn already_shut_down(&self) -> Option<Shutdown> {
        let shutdown = self.shutdown?;
        tracing::debug!(process = %self.name, ?shutdown, "Process was already shut down");
        Some(shutdown)
    }

    fn finish_shutdown(&mut self, shutdown: Shutdown) -> Shutdown {
        self.stdin = None;
        self.state = ControllerState::Terminated;
        self.shutdown = Some(shutdown);
        tracing::debug!(process = %self.name, ?shutdown, "Process shut down");
        shutdown
    }

    fn exit_status(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    async fn request_exit(&mut self) -> Option<ExitStatus> {
        let exit_command = self.shutdown_options.exit_command.clone()?;
        if let Err(err) = self.write_line(&exit_command).await {
            tracing::debug!(
                process = %self.name,
                error = %err,
                "Could not send exit command"
            );
        }
        self.wait_for_exit(self.shutdown_options.exit_timeout).await
    }

    async fn escalate(&mut self, terminate_timeout: Duration, kill_timeout: Duration) -> Shutdown {
        match signal::send_terminate(&self.child) {
            Ok(()) => {
                if let Some(status) = self.wait_for_exit(terminate_timeout).await {
                    return Shutdown {
                        stage: ShutdownStage::Terminate,
                        status: Some(status),
                    };
                }
                tracing::warn!(
                    process = %self.name,
                    ?terminate_timeout,
                    "Process did not terminate in time, killing it"
                );
            }
            Err(err) => {
                tracing::warn!(
                    process = %self.name,
                    error = %err,
                    "Could not send termination signal, killing process"
                );
            }
        }
        self.force_kill(kill_timeout).await
    }

    async fn force_kill(&mut self, kill_timeout: Duration) -> Shutdown {
        if let Err(err) = self.child.start_kill() {
            tracing::warn!(process = %self.name, error = %err, "Could not kill process");
        }
        let status = self.wait_for_exit(kill_timeout).await;
        if status.is_none() {
            tracing::error!(
                process = %self.name,
                ?kill_timeout,
                "Process could not be reaped after killing it"
            );
        }
        Shutdown {
            stage: ShutdownStage::Kill,
            status,
        }
    }

    async fn wait_for_exit(&mut self, timeout: Duration) -> Option<ExitStatus> {
        // The stdin handle was taken out of `child`, so waiting does not close it.
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(exit_status)) => Some(exit_status),
            Ok(Err(err)) => {
                tracing::debug!(process = %self.name, error = %err, "Could not wait for process");
                None
            }
            Err(_elapsed) => None,
        }
    }
}

/// Merges stdout and stderr of the child into a single pipe, preserving their relative order.
#[cfg(unix)]
mod output {
    use crate::error::SpawnError;
    use std::io;
    use std::os::fd::OwnedFd;
    use tokio::net::unix::pipe;
    use tokio::process::{Child, Command};

    pub(super) type Attached = io::PipeReader;

    pub(super) fn attach(cmd: &mut Command) -> io::Result<Attached> {
        let (reader, writer) = io::pipe()?;
        cmd.stdout(writer.try_clone()?);
        cmd.stderr(writer);
        Ok(reader)
    }

    pub(super) fn streams(
        reader: Attached,
        _child: &mut Child,
        process_name: &str,
    ) -> Result<Vec<pipe::Receiver>, SpawnError> {
        let receiver = pipe::Receiver::from_owned_fd(OwnedFd::from(reader)).map_err(|source| {
            SpawnError::SpawnFailed {
                process_name: process_name.to_owned().into(),
                source,
            }
        })?;
        Ok(vec![receiver])
    }
}

/// Pipes stdout and stderr separately. Both are pumped into the same conduit, so only the order
/// within each stream is preserved.
#[cfg(not(unix))]
mod output {
    use crate::error::SpawnError;
    use std::io;
    use std::pin::Pin;
    use std::process::Stdio;
    use tokio::io::AsyncRead;
    use tokio::process::{Child, Command};

    pub(super) type Attached = ();

    pub(super) fn attach(cmd: &mut Command) -> io::Result<Attached> {
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        Ok(())
    }

    pub(super) fn streams(
        _attached: Attached,
        child: &mut Child,
        process_name: &str,
    ) -> Result<Vec<Pin<Box<dyn AsyncRead + Send>>>, SpawnError> {
        let missing = |pipe: &'static str| SpawnError::MissingPipe {
            process_name: process_name.to_owned().into(),
            pipe,
        };
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;
        Ok(vec![Box::pin(stdout), Box::pin(stderr)])
    }
}
