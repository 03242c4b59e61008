use crate::transcript::Line;
use regex::{Regex, RegexBuilder};
use std::borrow::Cow;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::Instant;

/// How long to keep collecting output after the process exited, once no more lines arrive.
/// Longer than the default partial line flush, so a final prompt is still seen.
pub(crate) const EXIT_SETTLE_PERIOD: Duration = Duration::from_millis(150);

/// What an await operation is looking for.
#[derive(Debug, Clone)]
pub enum Pattern {
    /// Satisfied by any newly arrived line.
    AnyLine,

    /// Satisfied when the regex finds a match.
    Regex(Regex),
}

impl Pattern {
    pub fn new(regex: &str) -> Result<Self, regex::Error> {
        Regex::new(regex).map(Self::Regex)
    }

    /// Compiles `regex` case-insensitively and in multi-line mode, so that `^` and `$` match at
    /// line boundaries of the accumulated output.
    pub fn case_insensitive(regex: &str) -> Result<Self, regex::Error> {
        RegexBuilder::new(regex)
            .case_insensitive(true)
            .multi_line(true)
            .build()
            .map(Self::Regex)
    }

    pub fn any_line() -> Self {
        Self::AnyLine
    }

    pub fn is_match(&self, haystack: &str) -> bool {
        match self {
            Pattern::AnyLine => true,
            Pattern::Regex(regex) => regex.is_match(haystack),
        }
    }
}

impl From<Regex> for Pattern {
    fn from(regex: Regex) -> Self {
        Self::Regex(regex)
    }
}

impl Display for Pattern {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Pattern::AnyLine => f.write_str("<any line>"),
            Pattern::Regex(regex) => f.write_str(regex.as_str()),
        }
    }
}

/// Where the pattern of an [AwaitRequest] is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Test the pattern against everything accumulated during this await.
    Accumulated,

    /// Test the pattern against each newly arrived line on its own.
    EachLine,
}

/// A single wait operation.
#[derive(Debug, Clone, Copy)]
pub struct AwaitRequest<'p> {
    pub pattern: &'p Pattern,
    pub deadline: Instant,
    pub mode: MatchMode,
}

impl<'p> AwaitRequest<'p> {
    pub fn new(pattern: &'p Pattern, timeout: Duration, mode: MatchMode) -> Self {
        Self {
            pattern,
            deadline: Instant::now() + timeout,
            mode,
        }
    }
}

/// How a wait operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitStatus {
    /// The pattern matched.
    Matched,

    /// The deadline elapsed first.
    TimedOut,

    /// The process exited (or its output ended) and every pending line was consumed.
    EndOfOutput,
}

/// The result of a wait operation: all output accumulated while waiting and how the wait ended.
///
/// A timeout is not an error. Callers always get the partial output back and decide themselves
/// whether what they expected is in there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Awaited {
    output: String,
    status: AwaitStatus,
}

impl Awaited {
    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn into_output(self) -> String {
        self.output
    }

    pub fn status(&self) -> AwaitStatus {
        self.status
    }

    pub fn is_match(&self) -> bool {
        self.status == AwaitStatus::Matched
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.output.contains(needle)
    }
}

impl AsRef<str> for Awaited {
    fn as_ref(&self) -> &str {
        &self.output
    }
}

impl Display for Awaited {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.output)
    }
}

/// Consumes the lines pumped from one process and waits for patterns in them.
///
/// Every line is handed out exactly once, in the order the process wrote it, no matter how many
/// waits are issued. Requiring `&mut self` for waiting ensures a single awaiter at a time.
#[derive(Debug)]
pub struct OutputReader {
    process_name: Cow<'static, str>,
    conduit: UnboundedReceiver<Line>,
    ended: bool,
}

impl OutputReader {
    pub(crate) fn new(process_name: Cow<'static, str>, conduit: UnboundedReceiver<Line>) -> Self {
        Self {
            process_name,
            conduit,
            ended: false,
        }
    }

    /// Waits until `pattern` matches the output accumulated during this call.
    pub async fn await_pattern(&mut self, pattern: &Pattern, timeout: Duration) -> Awaited {
        self.run(AwaitRequest::new(pattern, timeout, MatchMode::Accumulated))
            .await
    }

    /// Waits until `pattern` matches one newly arrived line.
    pub async fn await_line_pattern(&mut self, pattern: &Pattern, timeout: Duration) -> Awaited {
        self.run(AwaitRequest::new(pattern, timeout, MatchMode::EachLine))
            .await
    }

    /// Waits for the next line, whatever it is.
    pub async fn await_any_line(&mut self, timeout: Duration) -> Awaited {
        self.await_line_pattern(&Pattern::AnyLine, timeout).await
    }

    pub async fn run(&mut self, request: AwaitRequest<'_>) -> Awaited {
        self.run_until_exit(request, std::future::pending()).await
    }

    /// Like [OutputReader::run], but also returns early once `exited` completes.
    ///
    /// A grandchild can inherit the output pipe and keep it open long after the process itself
    /// is gone. Once `exited` fired, lines still in flight are collected until the conduit stays
    /// quiet for [EXIT_SETTLE_PERIOD].
    pub(crate) async fn run_until_exit(
        &mut self,
        request: AwaitRequest<'_>,
        exited: impl Future<Output = ()>,
    ) -> Awaited {
        let mut output = String::new();
        let deadline = tokio::time::sleep_until(request.deadline);
        tokio::pin!(deadline);
        tokio::pin!(exited);
        let mut process_exited = false;

        loop {
            // A process flooding its output keeps `recv` ready at all times.
            // Check explicitly so that such a process can not extend the wait.
            if Instant::now() >= request.deadline {
                return self.timed_out(request, output);
            }

            tokio::select! {
                biased;

                maybe_line = self.conduit.recv() => match maybe_line {
                    Some(line) => {
                        line.append_to(&mut output);
                        let matched = match request.mode {
                            MatchMode::Accumulated => request.pattern.is_match(&output),
                            MatchMode::EachLine => request.pattern.is_match(line.text()),
                        };
                        if matched {
                            return Awaited {
                                output,
                                status: AwaitStatus::Matched,
                            };
                        }
                    }
                    None => {
                        if !self.ended {
                            tracing::debug!(process = %self.process_name, "Output ended");
                            self.ended = true;
                        }
                        return Awaited {
                            output,
                            status: AwaitStatus::EndOfOutput,
                        };
                    }
                },
                _ = &mut exited, if !process_exited => {
                    tracing::debug!(process = %self.process_name, "Process exited while awaiting output");
                    process_exited = true;
                }
                _ = tokio::time::sleep(EXIT_SETTLE_PERIOD), if process_exited => {
                    return Awaited {
                        output,
                        status: AwaitStatus::EndOfOutput,
                    };
                }
                _ = &mut deadline => return self.timed_out(request, output),
            }
        }
    }

    fn timed_out(&self, request: AwaitRequest<'_>, output: String) -> Awaited {
        tracing::debug!(
            process = %self.process_name,
            pattern = %request.pattern,
            received_bytes = output.len(),
            "Timed out waiting for output pattern"
        );
        Awaited {
            output,
            status: AwaitStatus::TimedOut,
        }
    }

    /// Takes all lines that already arrived, without waiting.
    pub fn drain(&mut self) -> Vec<Line> {
        let mut lines = Vec::new();
        loop {
            match self.conduit.try_recv() {
                Ok(line) => lines.push(line),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.ended = true;
                    break;
                }
            }
        }
        lines
    }

    /// Whether the end of output was observed. Lines may still have been pending before that.
    pub fn is_ended(&self) -> bool {
        self.ended
    }
}
