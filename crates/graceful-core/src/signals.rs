//! OS interrupt subscription owned by a switch.
//!
//! Each [`Subscription`] registers its own `signal-hook` delivery, so several
//! switches in one process (tests, mostly) never steal each other's signals.

use std::ffi::c_int;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use signal_hook::SigId;
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM, SIGUSR1, SIGUSR2};
use signal_hook::iterator::{Handle, Signals};

/// Interrupts a switch reacts to when none are configured.
pub const DEFAULT_SIGNALS: [c_int; 2] = [SIGTERM, SIGINT];

/// Exit status used when a repeated interrupt forces termination.
pub const FORCED_EXIT_STATUS: c_int = 130;

const KNOWN_SIGNALS: [(&str, c_int); 6] = [
    ("SIGHUP", SIGHUP),
    ("SIGINT", SIGINT),
    ("SIGQUIT", SIGQUIT),
    ("SIGTERM", SIGTERM),
    ("SIGUSR1", SIGUSR1),
    ("SIGUSR2", SIGUSR2),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalError {
    /// Name not in the supported set.
    Unknown(String),
}

impl std::fmt::Display for SignalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown(name) => write!(f, "unsupported signal: {name}"),
        }
    }
}

impl std::error::Error for SignalError {}

/// Resolve a signal name such as `SIGTERM`, `term` or `Int`.
pub fn parse_signal(name: &str) -> Result<c_int, SignalError> {
    let upper = name.trim().to_ascii_uppercase();
    let canonical = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    KNOWN_SIGNALS
        .iter()
        .find(|(known, _)| *known == canonical)
        .map(|(_, sig)| *sig)
        .ok_or_else(|| SignalError::Unknown(name.to_string()))
}

/// Canonical name for logging; `None` for signals outside the supported set.
pub fn signal_name(sig: c_int) -> Option<&'static str> {
    KNOWN_SIGNALS
        .iter()
        .find(|(_, known)| *known == sig)
        .map(|(name, _)| *name)
}

/// Live subscription to a set of OS interrupts.
///
/// A background thread blocks on the delivery and calls back for every
/// interrupt until [`close`](Self::close) is called or the subscription is
/// dropped.
pub struct Subscription {
    handle: Handle,
    repeat_exit: Vec<SigId>,
}

impl Subscription {
    /// Subscribe to `signals` and spawn the listener thread.
    pub fn listen(
        signals: &[c_int],
        mut on_signal: impl FnMut(c_int) + Send + 'static,
    ) -> std::io::Result<Self> {
        let mut delivery = Signals::new(signals)?;
        let handle = delivery.handle();

        std::thread::Builder::new()
            .name("graceful-signals".into())
            .spawn(move || {
                for sig in delivery.forever() {
                    on_signal(sig);
                }
                log::debug!("Signal listener stopped");
            })?;

        Ok(Self {
            handle,
            repeat_exit: Vec::new(),
        })
    }

    /// Terminate the process with [`FORCED_EXIT_STATUS`] when one of
    /// `signals` arrives while `armed` is set.
    ///
    /// Registered at the handler level, so it keeps working after
    /// [`close`](Self::close).
    pub fn exit_on_repeat(
        &mut self,
        signals: &[c_int],
        armed: Arc<AtomicBool>,
    ) -> std::io::Result<()> {
        for &sig in signals {
            let id = signal_hook::flag::register_conditional_shutdown(
                sig,
                FORCED_EXIT_STATUS,
                Arc::clone(&armed),
            )?;
            self.repeat_exit.push(id);
        }
        Ok(())
    }

    /// Stop delivering interrupts and end the listener thread.
    pub fn close(&self) {
        self.handle.close();
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.close();
        for id in self.repeat_exit.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}
