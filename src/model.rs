//! Model definitions and action wiring.
//!
//! A [`Model`] describes one unit of application state: the state type, its
//! initial value, and the actions that operate on it. Models declare their
//! actions inside [`Model::wire`] using a [`Wiring`], which supports three
//! handler kinds:
//!
//! - [`Wiring::reducer`] - pure function from `(state, payload)` to the next
//!   state, applied synchronously at the trigger call site
//! - [`Wiring::mutator`] - reducer written in mutation style against a
//!   copy-on-write draft of the current state
//! - [`Wiring::effect`] - stream transformer that consumes triggered payloads
//!   and emits follow-up [`Dispatch`] values asynchronously
//!
//! A model can also pre-declare **free actions** with
//! [`Wiring::free_action`]: triggering one is logged and delivered to the
//! returned stream, with no state application. Triggering a name nothing
//! claimed is an error.
//!
//! # Example
//!
//! ```ignore
//! use futures::StreamExt;
//! use switchboard::{Dispatch, Model, Payload, Wiring};
//!
//! #[derive(Clone, PartialEq, Debug, Default)]
//! struct CartState {
//!     items: Vec<String>,
//! }
//!
//! struct CartModel;
//!
//! impl Model for CartModel {
//!     type State = CartState;
//!
//!     fn default_state(&self) -> CartState {
//!         CartState::default()
//!     }
//!
//!     fn wire(&self, w: &mut Wiring<Self>) {
//!         w.mutator("add_item", |draft: &mut CartState, sku: &String| {
//!             draft.items.push(sku.clone());
//!         });
//!         w.reducer("clear", |_, _: &()| CartState::default());
//!         w.effect("checkout", |input, _state| {
//!             Ok(input.map(|_| Ok(Dispatch::own("clear", Payload::unit()))))
//!         });
//!     }
//! }
//! ```

use std::any::{self, Any};
use std::collections::HashSet;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::core::{short_type_name, Dispatch, Payload};
use crate::error::PipelineError;
use crate::state::StateWatch;

/// One unit of application state and the actions that operate on it.
///
/// Implementations are plain structs. A model may hold [`ModelRef`]s to
/// other instances so its effects can dispatch across models; it should not
/// hold a `Switchboard` or `ModelHandle`, since the registry keeps the
/// instance alive and that would form a reference cycle.
///
/// [`ModelRef`]: crate::ModelRef
pub trait Model: Sized + Send + Sync + 'static {
    /// The state value this model owns.
    ///
    /// `PartialEq` drives write deduplication; `Debug` makes state values
    /// loggable alongside the actions that produced them.
    type State: Clone + PartialEq + fmt::Debug + Send + Sync + 'static;

    /// Initial state for a freshly bound pipeline.
    fn default_state(&self) -> Self::State;

    /// Declare the model's actions.
    ///
    /// Called exactly once per binding, before any trigger is accepted.
    fn wire(&self, wiring: &mut Wiring<Self>);

    /// Name used in log records and error messages.
    ///
    /// Defaults to the short type name.
    fn model_name() -> &'static str {
        short_type_name::<Self>()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ActionStream - payloads flowing into an effect
// ─────────────────────────────────────────────────────────────────────────────

/// Stream of payloads for one action, in trigger order.
///
/// Effects receive one of these for their own action; models can obtain one
/// for a free action via [`Wiring::free_action`]. The stream ends when the
/// pipeline shuts down.
pub struct ActionStream {
    inner: UnboundedReceiverStream<Payload>,
}

impl ActionStream {
    pub(crate) fn new(rx: UnboundedReceiver<Payload>) -> Self {
        Self {
            inner: UnboundedReceiverStream::new(rx),
        }
    }
}

impl Stream for ActionStream {
    type Item = Payload;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

impl fmt::Debug for ActionStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ActionStream")
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handler storage
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) type ReducerFn<S> = Arc<dyn Fn(S, &Payload) -> Result<S, PipelineError> + Send + Sync>;

pub(crate) type EffectStream = BoxStream<'static, anyhow::Result<Dispatch>>;

pub(crate) type EffectInitFn<S> =
    Box<dyn FnOnce(ActionStream, StateWatch<S>) -> anyhow::Result<EffectStream> + Send>;

/// An effect handler waiting to be initialized, plus the input channel its
/// trigger will feed.
pub(crate) struct EffectSlot<S> {
    pub(crate) init: EffectInitFn<S>,
    pub(crate) input_tx: UnboundedSender<Payload>,
    pub(crate) input_rx: UnboundedReceiver<Payload>,
}

/// Everything a pipeline needs from a wired model, with dedup validated.
pub(crate) struct WiringParts<S> {
    pub(crate) reducers: Vec<(&'static str, ReducerFn<S>)>,
    pub(crate) effects: Vec<(&'static str, EffectSlot<S>)>,
    pub(crate) frees: Vec<(&'static str, UnboundedSender<Payload>)>,
    pub(crate) free_mirror_tx: UnboundedSender<(&'static str, Payload)>,
    pub(crate) free_mirror_rx: UnboundedReceiver<(&'static str, Payload)>,
}

impl<S> fmt::Debug for WiringParts<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WiringParts")
    }
}

fn expect_payload<'a, P: Any>(
    action: &'static str,
    payload: &'a Payload,
) -> Result<&'a P, PipelineError> {
    payload
        .downcast_ref::<P>()
        .ok_or_else(|| PipelineError::PayloadType {
            action,
            expected: any::type_name::<P>(),
            got: payload.type_name(),
        })
}

// ─────────────────────────────────────────────────────────────────────────────
// Wiring - action registration
// ─────────────────────────────────────────────────────────────────────────────

/// Collects a model's action handlers during [`Model::wire`].
///
/// Action names must be unique across all three handler kinds. A duplicate
/// name is remembered and reported when the pipeline is built; registration
/// itself never panics.
pub struct Wiring<M: Model> {
    reducers: Vec<(&'static str, ReducerFn<M::State>)>,
    effects: Vec<(&'static str, EffectSlot<M::State>)>,
    frees: Vec<(&'static str, UnboundedSender<Payload>)>,
    free_mirror_tx: UnboundedSender<(&'static str, Payload)>,
    free_mirror_rx: UnboundedReceiver<(&'static str, Payload)>,
    names: HashSet<&'static str>,
    duplicate: Option<&'static str>,
}

impl<M: Model> Wiring<M> {
    pub(crate) fn new() -> Self {
        let (free_mirror_tx, free_mirror_rx) = mpsc::unbounded_channel();
        Self {
            reducers: Vec::new(),
            effects: Vec::new(),
            frees: Vec::new(),
            free_mirror_tx,
            free_mirror_rx,
            names: HashSet::new(),
            duplicate: None,
        }
    }

    /// Register a pure reducer for `name`.
    ///
    /// The reducer runs synchronously inside the trigger call: by the time
    /// `trigger` returns, the new state is stored and observers have run.
    /// Reducers must not perform IO or trigger further actions.
    pub fn reducer<P, F>(&mut self, name: &'static str, reduce: F) -> &mut Self
    where
        P: Any,
        F: Fn(M::State, &P) -> M::State + Send + Sync + 'static,
    {
        if !self.claim(name) {
            return self;
        }
        let erased: ReducerFn<M::State> = Arc::new(move |state, payload| {
            let params = expect_payload::<P>(name, payload)?;
            Ok(reduce(state, params))
        });
        self.reducers.push((name, erased));
        self
    }

    /// Register a mutation-style reducer for `name`.
    ///
    /// The handler receives a mutable draft of the current state and edits it
    /// in place. The draft is a private copy; the previous state value is
    /// never modified. Timing is identical to [`Wiring::reducer`].
    pub fn mutator<P, F>(&mut self, name: &'static str, mutate: F) -> &mut Self
    where
        P: Any,
        F: Fn(&mut M::State, &P) + Send + Sync + 'static,
    {
        if !self.claim(name) {
            return self;
        }
        let erased: ReducerFn<M::State> = Arc::new(move |state, payload| {
            let params = expect_payload::<P>(name, payload)?;
            // `state` is already a private clone of the stored value, so it
            // serves as the draft directly.
            let mut draft = state;
            mutate(&mut draft, params);
            Ok(draft)
        });
        self.reducers.push((name, erased));
        self
    }

    /// Register an effect for `name`.
    ///
    /// `init` is called exactly once when the pipeline is built. It receives
    /// the stream of payloads this action will be triggered with and a
    /// read-only [`StateWatch`], and returns the stream of follow-up
    /// dispatches. Triggering an effect action only enqueues the payload;
    /// state changes happen later, when emitted dispatches are applied.
    ///
    /// If the returned stream yields an `Err`, the failure is logged and the
    /// branch goes permanently inert. The rest of the pipeline is unaffected.
    pub fn effect<F, St>(&mut self, name: &'static str, init: F) -> &mut Self
    where
        F: FnOnce(ActionStream, StateWatch<M::State>) -> anyhow::Result<St> + Send + 'static,
        St: Stream<Item = anyhow::Result<Dispatch>> + Send + 'static,
    {
        if !self.claim(name) {
            return self;
        }
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let boxed: EffectInitFn<M::State> =
            Box::new(move |input, state| init(input, state).map(|stream| stream.boxed()));
        self.effects.push((
            name,
            EffectSlot {
                init: boxed,
                input_tx,
                input_rx,
            },
        ));
        self
    }

    /// Claim `name` as a free action and return its payload stream.
    ///
    /// Free actions have no handler: triggering one is logged and delivered
    /// to this stream, nothing else. Effects typically consume the stream to
    /// react to notifications that carry no state transition of their own.
    pub fn free_action(&mut self, name: &'static str) -> ActionStream {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.claim(name) {
            self.frees.push((name, tx));
        }
        ActionStream::new(rx)
    }

    fn claim(&mut self, name: &'static str) -> bool {
        if self.names.insert(name) {
            true
        } else {
            self.duplicate.get_or_insert(name);
            false
        }
    }

    pub(crate) fn into_parts(self) -> Result<WiringParts<M::State>, PipelineError> {
        if let Some(action) = self.duplicate {
            return Err(PipelineError::DuplicateAction {
                model: M::model_name(),
                action,
            });
        }
        Ok(WiringParts {
            reducers: self.reducers,
            effects: self.effects,
            frees: self.frees,
            free_mirror_tx: self.free_mirror_tx,
            free_mirror_rx: self.free_mirror_rx,
        })
    }
}

impl<M: Model> fmt::Debug for Wiring<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wiring")
            .field("model", &M::model_name())
            .field("actions", &self.names.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateCell;

    struct Tally;

    impl Model for Tally {
        type State = i64;

        fn default_state(&self) -> i64 {
            0
        }

        fn wire(&self, _wiring: &mut Wiring<Self>) {}
    }

    #[test]
    fn test_model_name_defaults_to_short_type_name() {
        assert_eq!(Tally::model_name(), "Tally");
    }

    #[test]
    fn test_reducer_erasure_roundtrip() {
        let mut wiring = Wiring::<Tally>::new();
        wiring.reducer("add", |state, amount: &i64| state + amount);

        let parts = wiring.into_parts().unwrap();
        assert_eq!(parts.reducers.len(), 1);

        let (name, reduce) = &parts.reducers[0];
        assert_eq!(*name, "add");
        assert_eq!(reduce(40, &Payload::new(2i64)).unwrap(), 42);
    }

    #[test]
    fn test_reducer_rejects_mismatched_payload() {
        let mut wiring = Wiring::<Tally>::new();
        wiring.reducer("add", |state, amount: &i64| state + amount);

        let parts = wiring.into_parts().unwrap();
        let (_, reduce) = &parts.reducers[0];

        let err = reduce(0, &Payload::new("two")).unwrap_err();
        match err {
            PipelineError::PayloadType { action, .. } => assert_eq!(action, "add"),
            other => panic!("expected PayloadType, got {other}"),
        }
    }

    #[test]
    fn test_mutator_edits_a_draft() {
        let mut wiring = Wiring::<Tally>::new();
        wiring.mutator("double", |draft: &mut i64, _: &()| *draft *= 2);

        let parts = wiring.into_parts().unwrap();
        let (_, reduce) = &parts.reducers[0];

        assert_eq!(reduce(21, &Payload::unit()).unwrap(), 42);
    }

    #[test]
    fn test_duplicate_name_reported_at_into_parts() {
        let mut wiring = Wiring::<Tally>::new();
        wiring
            .reducer("add", |state, amount: &i64| state + amount)
            .mutator("add", |_: &mut i64, _: &()| {});

        let err = wiring.into_parts().unwrap_err();
        match err {
            PipelineError::DuplicateAction { model, action } => {
                assert_eq!(model, "Tally");
                assert_eq!(action, "add");
            }
            other => panic!("expected DuplicateAction, got {other}"),
        }
    }

    #[test]
    fn test_duplicate_free_action_reported() {
        let mut wiring = Wiring::<Tally>::new();
        wiring.reducer("tick", |state, _: &()| state);
        let _stream = wiring.free_action("tick");

        assert!(wiring.into_parts().is_err());
    }

    #[tokio::test]
    async fn test_free_action_stream_receives_sent_payloads() {
        let mut wiring = Wiring::<Tally>::new();
        let mut stream = wiring.free_action("tick");

        let parts = wiring.into_parts().unwrap();
        let (name, tx) = &parts.frees[0];
        assert_eq!(*name, "tick");

        tx.send(Payload::new(5u32)).unwrap();
        let payload = stream.next().await.unwrap();
        assert_eq!(payload.downcast_ref::<u32>(), Some(&5));
    }

    #[tokio::test]
    async fn test_effect_slot_wires_input_to_returned_stream() {
        let mut wiring = Wiring::<Tally>::new();
        wiring.effect("echo", |input, _state| {
            Ok(input.map(|payload| Ok(Dispatch::own("noted", payload))))
        });

        let mut parts = wiring.into_parts().unwrap();
        let (_, slot) = parts.effects.remove(0);
        let EffectSlot {
            init,
            input_tx,
            input_rx,
        } = slot;

        let cell = StateCell::new(0i64);
        let mut out = init(ActionStream::new(input_rx), cell.watch()).unwrap();

        input_tx.send(Payload::new(7u8)).unwrap();
        let dispatch = out.next().await.unwrap().unwrap();
        assert_eq!(dispatch.action(), "noted");
        assert_eq!(dispatch.payload().downcast_ref::<u8>(), Some(&7));
    }
}
