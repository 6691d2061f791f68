//! Action logging.
//!
//! Every action a pipeline applies is offered to an [`ActionLogger`] before
//! the state transition lands. Logging is observe-only and fire-and-forget:
//! a logger that panics is caught at the call site and the action still
//! applies, so instrumentation can never stall or break a pipeline.
//!
//! The default [`TracingLogger`] forwards records to [`tracing`] at debug
//! level. Swap in your own implementation through
//! [`SwitchboardBuilder::with_logger`] to ship records elsewhere.
//!
//! [`SwitchboardBuilder::with_logger`]: crate::SwitchboardBuilder::with_logger

use std::fmt;

use crate::core::Payload;

/// One applied action, borrowed for the duration of the logging call.
///
/// Records borrow from the pipeline's apply path; loggers that keep history
/// must copy what they need before returning.
#[derive(Clone, Copy, Debug)]
pub enum LogRecord<'a> {
    /// A reducer ran and produced `state`.
    Reduced {
        /// The triggered action name.
        action: &'a str,
        /// The payload the reducer received.
        payload: &'a Payload,
        /// The state value about to be stored.
        state: &'a dyn fmt::Debug,
    },
    /// An effect emitted a follow-up action.
    Dispatched {
        /// The effect action that emitted the dispatch.
        origin: &'a str,
        /// Model the dispatch is routed to.
        target: &'a str,
        /// The action the dispatch will trigger.
        action: &'a str,
        /// The payload the dispatch carries.
        payload: &'a Payload,
    },
    /// A free action was triggered; it applies no state.
    Free {
        /// The triggered action name.
        action: &'a str,
        /// The payload it carried.
        payload: &'a Payload,
    },
}

impl LogRecord<'_> {
    /// The action name this record is about.
    pub fn action(&self) -> &str {
        match self {
            LogRecord::Reduced { action, .. } => action,
            LogRecord::Dispatched { action, .. } => action,
            LogRecord::Free { action, .. } => action,
        }
    }
}

/// Observer for every action a pipeline applies.
///
/// Implementations must not assume they run on any particular thread and
/// must not block: records are delivered inline from the apply path.
pub trait ActionLogger: Send + Sync + 'static {
    /// Called once per applied action, before the state transition lands.
    fn record(&self, model: &'static str, record: LogRecord<'_>);

    /// Called when an effect stream yields an error.
    ///
    /// The branch that failed takes no further part in the pipeline; the
    /// remaining branches keep running.
    fn effect_failed(&self, model: &'static str, action: &'static str, error: &anyhow::Error) {
        tracing::error!(
            model,
            action,
            error = %error,
            "effect stream failed; branch is now inert"
        );
    }
}

/// Default logger: forwards records to [`tracing`] at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl ActionLogger for TracingLogger {
    fn record(&self, model: &'static str, record: LogRecord<'_>) {
        match record {
            LogRecord::Reduced {
                action,
                payload,
                state,
            } => {
                tracing::debug!(model, action, payload = ?payload, state = ?state, "action reduced");
            }
            LogRecord::Dispatched {
                origin,
                target,
                action,
                payload,
            } => {
                tracing::debug!(
                    model,
                    origin,
                    target,
                    action,
                    payload = ?payload,
                    "action dispatched"
                );
            }
            LogRecord::Free { action, payload } => {
                tracing::debug!(model, action, payload = ?payload, "free action");
            }
        }
    }
}
