use crate::async_drop;
use crate::controller::InteractiveProcess;
use std::ops::{Deref, DerefMut};

/// A wrapper that automatically closes a process when dropped.
///
/// # Safety Requirements
///
/// **WARNING**: Closing on drop requires a multithreaded tokio runtime!
///
/// Dropped anywhere else (outside a runtime or on a current-thread runtime), the process is not
/// closed gracefully. It is still killed, as every [InteractiveProcess] is spawned with
/// `kill_on_drop` set, but no exit command or termination signal is sent first.
///
/// # Recommended Alternatives
///
/// Prefer an explicit [InteractiveProcess::close] whenever there is a natural point for it.
#[derive(Debug)]
pub struct CloseOnDrop {
    pub(crate) process: Option<InteractiveProcess>,
}

impl CloseOnDrop {
    /// Takes the process back out, disabling the close on drop.
    pub fn into_inner(mut self) -> InteractiveProcess {
        // Only `None` after drop, which can not have happened while we own `self`.
        match self.process.take() {
            Some(process) => process,
            None => unreachable!("CloseOnDrop always holds its process until dropped"),
        }
    }

    fn process(&self) -> &InteractiveProcess {
        match &self.process {
            Some(process) => process,
            None => unreachable!("CloseOnDrop always holds its process until dropped"),
        }
    }

    fn process_mut(&mut self) -> &mut InteractiveProcess {
        match &mut self.process {
            Some(process) => process,
            None => unreachable!("CloseOnDrop always holds its process until dropped"),
        }
    }
}

impl Deref for CloseOnDrop {
    type Target = InteractiveProcess;

    fn deref(&self) -> &Self::Target {
        self.process()
    }
}

impl DerefMut for CloseOnDrop {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.process_mut()
    }
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        let Some(mut process) = self.process.take() else {
            return;
        };
        if process.is_shut_down() {
            return;
        }

        let name = process.name.clone();
        let closed = async_drop::run_future(async move {
            tracing::debug!(process = %process.name, "Closing process on drop");
            let shutdown = process.close().await;
            tracing::debug!(process = %process.name, ?shutdown, "Closed process on drop");
        });
        if !closed {
            tracing::warn!(
                process = %name,
                "No multithreaded tokio runtime available to close process on drop, killing it"
            );
        }
    }
}
