//! Terminal detection.

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Whether both stdin and stdout are attached to a terminal.
pub fn is_interactive_terminal() -> bool {
    let stdin_is_tty = unsafe { libc::isatty(libc::STDIN_FILENO) == 1 };
    let stdout_is_tty = unsafe { libc::isatty(libc::STDOUT_FILENO) == 1 };
    stdin_is_tty && stdout_is_tty
}

/// Whether output may carry ANSI escapes: an interactive terminal that is not `TERM=dumb` and
/// no `NO_COLOR` override.
pub fn is_ansi_interactive_terminal() -> bool {
    if std::env::var_os("NO_COLOR").is_some() {
        return false;
    }

    let dumb = std::env::var("TERM").is_ok_and(|term| term == "dumb");
    if dumb {
        tracing::debug!("TERM=dumb, disabling colors");
    }
    is_interactive_terminal() && !dumb
}
