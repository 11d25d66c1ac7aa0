//! Signal mnemonics

use nix::sys::signal::Signal;

/// Mnemonic to signal, without the `SIG` prefix
const TABLE: &[(&str, Signal)] = &[
    ("ABRT", Signal::SIGABRT),
    ("ALRM", Signal::SIGALRM),
    ("FPE", Signal::SIGFPE),
    ("HUP", Signal::SIGHUP),
    ("ILL", Signal::SIGILL),
    ("INT", Signal::SIGINT),
    ("KILL", Signal::SIGKILL),
    ("PIPE", Signal::SIGPIPE),
    ("QUIT", Signal::SIGQUIT),
    ("SEGV", Signal::SIGSEGV),
    ("TERM", Signal::SIGTERM),
    ("USR1", Signal::SIGUSR1),
    ("USR2", Signal::SIGUSR2),
    ("CHLD", Signal::SIGCHLD),
    ("CONT", Signal::SIGCONT),
    ("STOP", Signal::SIGSTOP),
    ("TSTP", Signal::SIGTSTP),
    ("TTIN", Signal::SIGTTIN),
    ("TTOU", Signal::SIGTTOU),
    ("WINCH", Signal::SIGWINCH),
];

/// Resolve `TERM`, `SIGTERM`, `term` or `15`
pub fn lookup(name: &str) -> Option<Signal> {
    let name = name.trim();
    if let Ok(num) = name.parse::<i32>() {
        return Signal::try_from(num).ok();
    }

    let upper = name.to_ascii_uppercase();
    let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
    TABLE
        .iter()
        .find(|(mnemonic, _)| *mnemonic == bare)
        .map(|(_, signal)| *signal)
}

/// Shell-style exit code for a child killed by `signal`
pub fn exit_code(signal: Signal) -> u32 {
    128 + signal as u32
}
