//! Process signals, reduced to flags the event loop drains once per pass.
//!
//! Handlers only ever set a bit in an atomic, so nothing in the scheduler
//! state is touched from signal context. Handlers are installed without
//! `SA_RESTART` so a blocking `poll` returns `EINTR` and the loop gets to
//! look at the flags straight away.

use std::{
    ffi::c_int,
    io,
    sync::atomic::{AtomicU8, Ordering},
};

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal as OsSignal, sigaction};

static PENDING: AtomicU8 = AtomicU8::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Leave now, abandoning in-flight work (`SIGTERM`, `SIGINT`)
    Shutdown,
    /// Freeze, tell every worker to finish, exit once they are gone (`SIGQUIT`)
    SlowShutdown,
    /// Re-read the configuration file (`SIGUSR1`)
    Reload,
    /// Dump the queue state to the log (`SIGUSR2`)
    DumpQueue,
}

impl Signal {
    const ALL: [Self; 4] = [
        Self::Shutdown,
        Self::SlowShutdown,
        Self::Reload,
        Self::DumpQueue,
    ];

    const fn bit(self) -> u8 {
        match self {
            Self::Shutdown => 1,
            Self::SlowShutdown => 1 << 1,
            Self::Reload => 1 << 2,
            Self::DumpQueue => 1 << 3,
        }
    }

    const fn from_os(signal: OsSignal) -> Option<Self> {
        match signal {
            OsSignal::SIGTERM | OsSignal::SIGINT => Some(Self::Shutdown),
            OsSignal::SIGQUIT => Some(Self::SlowShutdown),
            OsSignal::SIGUSR1 => Some(Self::Reload),
            OsSignal::SIGUSR2 => Some(Self::DumpQueue),
            _ => None,
        }
    }
}

extern "C" fn record(signo: c_int) {
    if let Some(signal) = OsSignal::try_from(signo).ok().and_then(Signal::from_os) {
        PENDING.fetch_or(signal.bit(), Ordering::SeqCst);
    }
}

/// Install handlers for every signal the scheduler reacts to.
///
/// # Errors
///
/// Returns the OS error if `sigaction` refuses one of the handlers.
pub fn install() -> io::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(record),
        SaFlags::empty(),
        SigSet::empty(),
    );

    for signal in [
        OsSignal::SIGTERM,
        OsSignal::SIGINT,
        OsSignal::SIGQUIT,
        OsSignal::SIGUSR1,
        OsSignal::SIGUSR2,
    ] {
        // SAFETY: the handler only performs an atomic store
        unsafe { sigaction(signal, &action) }.map_err(io::Error::from)?;
    }

    Ok(())
}

/// Queue a signal as if it had been delivered by the OS
pub fn raise(signal: Signal) {
    PENDING.fetch_or(signal.bit(), Ordering::SeqCst);
}

/// Take every signal seen since the previous call
pub fn take_pending() -> Vec<Signal> {
    let bits = PENDING.swap(0, Ordering::SeqCst);

    Signal::ALL
        .into_iter()
        .filter(|signal| bits & signal.bit() != 0)
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn raw_signal_mapping() {
        assert_eq!(Signal::from_os(OsSignal::SIGTERM), Some(Signal::Shutdown));
        assert_eq!(Signal::from_os(OsSignal::SIGINT), Some(Signal::Shutdown));
        assert_eq!(Signal::from_os(OsSignal::SIGQUIT), Some(Signal::SlowShutdown));
        assert_eq!(Signal::from_os(OsSignal::SIGUSR1), Some(Signal::Reload));
        assert_eq!(Signal::from_os(OsSignal::SIGUSR2), Some(Signal::DumpQueue));
        assert_eq!(Signal::from_os(OsSignal::SIGHUP), None);
    }

    #[test]
    fn pending_signals_are_drained_once() {
        raise(Signal::Reload);
        raise(Signal::DumpQueue);
        raise(Signal::Reload);

        assert_eq!(take_pending(), vec![Signal::Reload, Signal::DumpQueue]);
        assert!(take_pending().is_empty());
    }
}
