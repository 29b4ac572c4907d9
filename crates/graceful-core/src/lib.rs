//! Graceful Core - shutdown coordination for long-running processes
//!
//! A [`Switch`] subscribes to termination signals, collects named cleanup
//! tasks and runs them concurrently under one deadline when the process is
//! asked to stop, reporting which tasks failed to finish in time.

pub mod completion;
pub mod logging;
pub mod outcome;
pub mod registry;
pub mod signals;
pub mod switch;
pub mod tracker;

// Re-exports for convenience
pub use logging::{IndicatifLogger, init_logging};
pub use outcome::{Outcome, TimeoutError};
pub use signals::{DEFAULT_SIGNALS, SignalError, parse_signal, signal_name};
pub use switch::{State, Switch, SwitchBuilder, WeakSwitch};
