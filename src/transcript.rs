use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, PoisonError};

/// A single line of process output.
///
/// Most lines were terminated by a newline character, which is not part of `text` (a trailing
/// carriage return is removed as well). Lines flushed before their newline arrived, or split up
/// because they exceeded the configured maximum length, are marked as not terminated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Line {
    text: String,
    terminated: bool,
}

impl Line {
    pub(crate) fn new(text: impl Into<String>, terminated: bool) -> Self {
        Self {
            text: text.into(),
            terminated,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Whether this line ended in a newline in the original output.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Appends this line to `out`, restoring its newline if it had one.
    pub(crate) fn append_to(&self, out: &mut String) {
        out.push_str(&self.text);
        if self.terminated {
            out.push('\n');
        }
    }
}

impl AsRef<str> for Line {
    fn as_ref(&self) -> &str {
        &self.text
    }
}

impl Display for Line {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

/// Append-only record of every line read from a process.
///
/// The transcript is filled by the output pump independently of anyone consuming lines, so it
/// always holds the complete output seen so far. Clones share the same underlying storage.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    lines: Arc<Mutex<Vec<Line>>>,
}

impl Transcript {
    pub(crate) fn push(&self, line: Line) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line);
    }

    /// A snapshot of all lines captured so far.
    pub fn lines(&self) -> Vec<Line> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Renders all captured output as one string, for diagnostics.
    pub fn dump(&self) -> String {
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out = String::new();
        for line in lines.iter() {
            line.append_to(&mut out);
        }
        out
    }
}
