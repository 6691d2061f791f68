//! Structured error types for pipeline construction and triggering.
//!
//! `PipelineError` provides pattern-matchable errors instead of generic
//! `anyhow::Error`. Effects still use `anyhow` internally for their own
//! failures; those never surface as a `PipelineError`. A failed effect stream
//! is logged and its branch goes inert, while the rest of the pipeline keeps
//! running.
//!
//! # Example
//!
//! ```ignore
//! use switchboard::PipelineError;
//!
//! match pipeline.trigger("add_item", payload) {
//!     Ok(()) => {}
//!     Err(PipelineError::UnknownAction { model, action }) => {
//!         eprintln!("{model} has no action named {action}");
//!     }
//!     Err(other) => eprintln!("trigger failed: {other}"),
//! }
//! ```

use thiserror::Error;

/// Structured error type for pipeline operations.
///
/// Each variant names the model involved, so errors stay meaningful when
/// several pipelines share one process.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A model wired two handlers under the same action name.
    #[error("model {model} wired action '{action}' more than once")]
    DuplicateAction {
        /// Short name of the offending model type.
        model: &'static str,
        /// The action name that was registered twice.
        action: &'static str,
    },

    /// An effect handler returned an error while producing its stream.
    ///
    /// Construction failures are fail-loud: the whole pipeline build is
    /// rejected, unlike runtime stream errors which only retire one branch.
    #[error("effect '{action}' on model {model} failed to initialize: {cause}")]
    EffectInit {
        /// Short name of the model being bound.
        model: &'static str,
        /// The effect action whose handler failed.
        action: &'static str,
        /// The error returned by the handler.
        cause: anyhow::Error,
    },

    /// A trigger named an action the model never wired.
    #[error("model {model} has no action named '{action}'")]
    UnknownAction {
        /// Short name of the model type.
        model: &'static str,
        /// The unrecognized action name.
        action: String,
    },

    /// A trigger carried a payload of the wrong type for the action.
    #[error("action '{action}' expected payload type {expected}, got {got}")]
    PayloadType {
        /// The action that rejected the payload.
        action: &'static str,
        /// Payload type the handler was registered with.
        expected: &'static str,
        /// Payload type actually received.
        got: &'static str,
    },

    /// The pipeline has been shut down; triggers are rejected.
    #[error("pipeline for model {model} is shut down")]
    Closed {
        /// Short name of the model type.
        model: &'static str,
    },

    /// The binding table returned an engine of an unexpected state type.
    ///
    /// Bindings are keyed by instance identity, so this indicates internal
    /// corruption rather than a caller mistake.
    #[error("binding table returned a mismatched engine for model {model}")]
    TypeMismatch {
        /// Short name of the model type.
        model: &'static str,
    },
}

impl PipelineError {
    /// Returns true if the error is [`PipelineError::Closed`].
    pub fn is_closed(&self) -> bool {
        matches!(self, PipelineError::Closed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_action_display() {
        let err = PipelineError::DuplicateAction {
            model: "CartModel",
            action: "add_item",
        };
        assert!(err.to_string().contains("more than once"));
        assert!(err.to_string().contains("CartModel"));
        assert!(err.to_string().contains("add_item"));
    }

    #[test]
    fn test_effect_init_display_includes_cause() {
        let err = PipelineError::EffectInit {
            model: "CartModel",
            action: "sync",
            cause: anyhow::anyhow!("connection refused"),
        };
        assert!(err.to_string().contains("failed to initialize"));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_unknown_action_display() {
        let err = PipelineError::UnknownAction {
            model: "CartModel",
            action: "frobnicate".to_string(),
        };
        assert!(err.to_string().contains("no action named"));
        assert!(err.to_string().contains("frobnicate"));
    }

    #[test]
    fn test_payload_type_display() {
        let err = PipelineError::PayloadType {
            action: "add_item",
            expected: "u32",
            got: "alloc::string::String",
        };
        assert!(err.to_string().contains("expected payload type u32"));
        assert!(err.to_string().contains("String"));
    }

    #[test]
    fn test_is_closed() {
        let closed = PipelineError::Closed { model: "CartModel" };
        let open = PipelineError::UnknownAction {
            model: "CartModel",
            action: "x".to_string(),
        };
        assert!(closed.is_closed());
        assert!(!open.is_closed());
    }

    #[test]
    fn test_error_is_pattern_matchable() {
        let err = PipelineError::PayloadType {
            action: "add_item",
            expected: "u32",
            got: "bool",
        };

        match &err {
            PipelineError::PayloadType { action, .. } => assert_eq!(*action, "add_item"),
            _ => panic!("expected PayloadType"),
        }
    }
}
