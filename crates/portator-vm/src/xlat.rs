//! Host <-> guest signal numbering. Guests use the Linux x86-64 numbers.

use libc::c_int;

pub const GUEST_SIGKILL: i32 = 9;

const SIGNALS: &[(c_int, i32)] = &[
    (libc::SIGHUP, 1),
    (libc::SIGINT, 2),
    (libc::SIGQUIT, 3),
    (libc::SIGILL, 4),
    (libc::SIGTRAP, 5),
    (libc::SIGABRT, 6),
    (libc::SIGBUS, 7),
    (libc::SIGFPE, 8),
    (libc::SIGKILL, 9),
    (libc::SIGUSR1, 10),
    (libc::SIGSEGV, 11),
    (libc::SIGUSR2, 12),
    (libc::SIGPIPE, 13),
    (libc::SIGALRM, 14),
    (libc::SIGTERM, 15),
    (libc::SIGCHLD, 17),
    (libc::SIGCONT, 18),
    (libc::SIGSTOP, 19),
    (libc::SIGTSTP, 20),
    (libc::SIGTTIN, 21),
    (libc::SIGTTOU, 22),
    (libc::SIGURG, 23),
    (libc::SIGXCPU, 24),
    (libc::SIGXFSZ, 25),
    (libc::SIGVTALRM, 26),
    (libc::SIGPROF, 27),
    (libc::SIGWINCH, 28),
    (libc::SIGIO, 29),
    (libc::SIGSYS, 31),
];

pub fn host_to_guest(sig: c_int) -> Option<i32> {
    SIGNALS
        .iter()
        .find(|(host, _)| *host == sig)
        .map(|(_, guest)| *guest)
}

pub fn guest_to_host(sig: i32) -> Option<c_int> {
    SIGNALS
        .iter()
        .find(|(_, guest)| *guest == sig)
        .map(|(host, _)| *host)
}

/// Host signal to re-raise for a guest signal; untranslatable ones become `SIGKILL`.
pub fn guest_to_host_or_kill(sig: i32) -> c_int {
    guest_to_host(sig).unwrap_or(libc::SIGKILL)
}
