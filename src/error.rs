//! Error types for harness operations.
//!
//! Only setup-time failures are fatal. Steady-state trouble (a timed out await, a process that
//! went away, a failed shutdown stage) degrades to "no more data" and is never represented here.

use crate::controller::ControllerState;
use std::borrow::Cow;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur when spawning a process.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// Failed to spawn the process.
    #[error("Failed to spawn process '{process_name}': {source}")]
    SpawnFailed {
        /// The name or description of the process being spawned.
        process_name: Cow<'static, str>,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The spawned process did not expose one of the pipes we asked for.
    #[error("Process '{process_name}' was spawned without a piped {pipe}")]
    MissingPipe {
        /// The name of the process.
        process_name: Cow<'static, str>,
        /// Which pipe is missing.
        pipe: &'static str,
    },
}

/// Errors that can occur when sending a line to a process.
///
/// These are never fatal for the controller. A process that stopped reading its input is an
/// expected end state of an interactive session.
#[derive(Debug, Error)]
pub enum SendError {
    /// The controller no longer accepts input.
    #[error("Cannot send to process '{process_name}' while it is {state:?}")]
    NotRunning {
        /// The name of the process.
        process_name: Cow<'static, str>,
        /// The state the controller was in.
        state: ControllerState,
    },

    /// Writing or flushing the process input failed.
    #[error("Failed to write to stdin of process '{process_name}': {source}")]
    Io {
        /// The name of the process.
        process_name: Cow<'static, str>,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// Fatal errors raised while setting up a session or one of its clients.
///
/// Variants describing a process that never became ready carry the full transcript captured from
/// that process, so that the failure can be diagnosed from the error message alone.
#[derive(Debug, Error)]
pub enum SetupError {
    /// The binary could not be found in any of the searched locations.
    #[error(
        "Could not find '{name}' under '{}'. Override with {env_var}=/abs/path",
        build_dir.display()
    )]
    BinaryNotFound {
        /// The binary name that was searched for.
        name: String,
        /// The build directory that was searched.
        build_dir: PathBuf,
        /// The environment variable that can be used to point at the binary.
        env_var: String,
    },

    /// A binary was found (or configured) but is not an executable file.
    #[error("'{name}' is not executable at '{}'", path.display())]
    NotExecutable {
        /// The binary name.
        name: String,
        /// The offending path.
        path: PathBuf,
    },

    /// Spawning a process failed.
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    /// The server announced an endpoint, but nothing accepted connections on it.
    #[error("Parsed endpoint '{endpoint}' but port did not open within {timeout:?}.\n{transcript}")]
    EndpointNotOpen {
        /// The endpoint the server announced.
        endpoint: String,
        /// How long we probed.
        timeout: Duration,
        /// Everything the server wrote.
        transcript: String,
    },

    /// The server never announced an endpoint and the fallback port never opened.
    #[error(
        "Server failed to report its address and fallback endpoint {host}:{port} did not open.\n{transcript}"
    )]
    ServerNotReady {
        /// The fallback host that was probed.
        host: String,
        /// The fallback port that was probed.
        port: u16,
        /// Everything the server wrote.
        transcript: String,
    },

    /// A client did not print its startup banner in time.
    #[error("Client '{process_name}' did not print '{banner}' within {timeout:?}.\n{transcript}")]
    ClientBannerMissing {
        /// The name of the client process.
        process_name: Cow<'static, str>,
        /// The banner we waited for.
        banner: Cow<'static, str>,
        /// How long we waited.
        timeout: Duration,
        /// Everything the client wrote.
        transcript: String,
    },
}
