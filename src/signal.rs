/// Ask the `child` to terminate.
/// This signal is typically sent to a process when the operating system requests a termination.
///
/// - on `cfg(unix)`: Sends a `SIGTERM` to the process.
/// - on `cfg(windows)`: Sends a `CTRL_BREAK_EVENT` to the process.
/// - fails with [std::io::ErrorKind::Unsupported] on any other platform.
///
/// Does nothing if the child was already reaped.
pub(crate) fn send_terminate(child: &tokio::process::Child) -> std::io::Result<()> {
    let Some(pid) = child.id() else {
        // Returns `None` if child was already "polled to completion".
        return Ok(());
    };

    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(std::io::Error::from)
    }

    #[cfg(windows)]
    {
        use windows_sys::Win32::Foundation::CTRL_BREAK_EVENT;
        use windows_sys::Win32::System::Console::GenerateConsoleCtrlEvent;

        let success = unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid) };
        if success == 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(all(not(windows), not(unix)))]
    {
        let _ = pid;
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "Cannot send termination signal to process. Platform is unsupported.",
        ))
    }
}
