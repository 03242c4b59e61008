mod async_drop;
mod close_on_drop;
mod controller;
mod error;
mod locate;
mod probe;
mod pump;
mod reader;
mod session;
mod signal;
mod transcript;

pub use close_on_drop::CloseOnDrop;
pub use controller::{
    ControllerState, InteractiveProcess, RunningState, Shutdown, ShutdownOptions, ShutdownStage,
    SpawnOptions,
};
pub use error::{SendError, SetupError, SpawnError};
pub use locate::{BinaryLocator, env_var_name};
pub use probe::{ProbeOptions, probe, probe_with};
pub use pump::{LineOverflowBehavior, LineParsingOptions, NumBytes, NumBytesExt};
pub use reader::{AwaitRequest, AwaitStatus, Awaited, MatchMode, OutputReader, Pattern};
pub use session::{
    ClientSpec, DEFAULT_ANNOUNCEMENT, DEFAULT_FALLBACK_PORT, Session, SessionConfig,
};
pub use transcript::{Line, Transcript};
