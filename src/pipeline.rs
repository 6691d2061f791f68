//! The action pipeline: one engine per bound model instance.
//!
//! A [`Pipeline`] owns a model's [`StateCell`] and its trigger table. Every
//! action funnels through [`Pipeline::trigger`], and what happens next
//! depends on the handler kind the model wired:
//!
//! - **Reducer / mutator**: the transition completes synchronously. The new
//!   state is computed, logged, and stored before `trigger` returns.
//! - **Effect**: the payload is enqueued onto the effect's input stream and
//!   `trigger` returns immediately. Dispatches the effect emits are applied
//!   later by the pipeline's consumer task.
//! - **Free**: the payload is logged and forwarded to whoever claimed the
//!   free action's stream.
//!
//! # Ordering
//!
//! Each effect's emissions are applied in emission order, and free actions in
//! trigger order; a single consumer task fair-merges the branches, so no
//! ordering holds *across* sources. Reducer triggers from multiple threads
//! serialize on an apply gate.
//!
//! # Failure
//!
//! An effect stream that yields `Err` is fail-soft: the error is reported to
//! the logger and that branch goes permanently inert, while every other
//! branch keeps running. Handler errors at build time are fail-loud: the
//! whole build is rejected. Logger panics are caught and dropped; they never
//! reach handler code or callers.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use futures::stream::{BoxStream, SelectAll};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::core::{
    lock_unpoisoned, read_unpoisoned, write_unpoisoned, Dispatch, DispatchTarget, Payload,
};
use crate::error::PipelineError;
use crate::logger::{ActionLogger, LogRecord};
use crate::model::{ActionStream, EffectSlot, EffectStream, Model, Wiring};
use crate::registry::BoardInner;
use crate::state::{StateCell, StateWatch, Subscription};

type TriggerFn = Arc<dyn Fn(Payload) -> Result<(), PipelineError> + Send + Sync>;

/// Everything a pipeline can be asked to apply, tagged by origin.
///
/// [`Pipeline::apply`] matches this exhaustively; there is no untagged path
/// into the state cell or the logger.
pub(crate) enum Action<S> {
    /// A reducer ran; `next` is the value to store.
    Reduced {
        action: &'static str,
        payload: Payload,
        next: S,
    },
    /// An effect emitted a follow-up dispatch.
    Dispatched {
        origin: &'static str,
        dispatch: Dispatch,
    },
    /// A free action was triggered.
    Free {
        action: &'static str,
        payload: Payload,
    },
}

/// Items flowing out of the merged effect and free-action branches.
enum Emitted {
    Dispatched {
        origin: &'static str,
        dispatch: Dispatch,
    },
    Free {
        action: &'static str,
        payload: Payload,
    },
    EffectError {
        action: &'static str,
        error: anyhow::Error,
    },
}

/// Wrap a raw effect stream so that after its first `Err` the branch never
/// polls the handler's stream again.
///
/// The handler stream is dropped at the error, which also closes its input
/// channel; payloads triggered at an inert effect go nowhere.
fn guard_branch(name: &'static str, raw: EffectStream) -> BoxStream<'static, Emitted> {
    futures::stream::unfold(Some(raw), move |slot| async move {
        let mut raw = slot?;
        match raw.next().await {
            Some(Ok(dispatch)) => Some((
                Emitted::Dispatched {
                    origin: name,
                    dispatch,
                },
                Some(raw),
            )),
            Some(Err(error)) => Some((Emitted::EffectError { action: name, error }, None)),
            None => None,
        }
    })
    .boxed()
}

/// Action engine for one bound model instance.
///
/// Built by the registry when an instance is first bound; see
/// [`Switchboard::bind`]. Dropping the last handle to a pipeline shuts it
/// down.
///
/// [`Switchboard::bind`]: crate::Switchboard::bind
pub struct Pipeline<S> {
    model_name: &'static str,
    cell: StateCell<S>,
    triggers: RwLock<HashMap<&'static str, TriggerFn>>,
    // Serializes reducer applications. Intentionally not held while routing
    // dispatches, so a dispatch into one's own reducer cannot deadlock.
    gate: Mutex<()>,
    logger: Arc<dyn ActionLogger>,
    board: Weak<BoardInner>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl<S> Pipeline<S>
where
    S: Clone + PartialEq + fmt::Debug + Send + Sync + 'static,
{
    /// Wire `instance` and assemble its engine.
    ///
    /// Runs the model's `wire`, initializes every effect exactly once, and
    /// spawns the consumer task. Must be called inside a Tokio runtime.
    pub(crate) fn build<M>(
        instance: Arc<M>,
        board: Weak<BoardInner>,
        logger: Arc<dyn ActionLogger>,
    ) -> Result<Arc<Self>, PipelineError>
    where
        M: Model<State = S>,
    {
        let model_name = M::model_name();
        let mut wiring = Wiring::<M>::new();
        instance.wire(&mut wiring);
        let parts = wiring.into_parts()?;

        let pipeline = Arc::new(Pipeline {
            model_name,
            cell: StateCell::new(instance.default_state()),
            triggers: RwLock::new(HashMap::new()),
            gate: Mutex::new(()),
            logger,
            board,
            consumer: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let mut triggers: HashMap<&'static str, TriggerFn> = HashMap::new();
        let mut branches: Vec<BoxStream<'static, Emitted>> = Vec::new();

        // Effects: initialize once, with the input stream and a read-only
        // state watch. An init error rejects the whole build.
        for (name, slot) in parts.effects {
            let EffectSlot {
                init,
                input_tx,
                input_rx,
            } = slot;
            let raw = init(ActionStream::new(input_rx), pipeline.cell.watch()).map_err(|cause| {
                PipelineError::EffectInit {
                    model: model_name,
                    action: name,
                    cause,
                }
            })?;
            branches.push(guard_branch(name, raw));
            triggers.insert(
                name,
                Arc::new(move |payload| {
                    // A send failure means the branch already retired; the
                    // payload is dropped, matching the inert-branch contract.
                    let _ = input_tx.send(payload);
                    Ok(())
                }),
            );
        }

        // Reducers: compute, log, and store synchronously under the gate.
        for (name, reduce) in parts.reducers {
            let weak = Arc::downgrade(&pipeline);
            triggers.insert(
                name,
                Arc::new(move |payload| {
                    let Some(pipe) = weak.upgrade() else {
                        return Err(PipelineError::Closed { model: model_name });
                    };
                    let _gate = lock_unpoisoned(&pipe.gate);
                    let next = reduce(pipe.cell.get(), &payload)?;
                    pipe.apply(Action::Reduced {
                        action: name,
                        payload,
                        next,
                    });
                    Ok(())
                }),
            );
        }

        // Free actions: feed the model-facing stream and mirror into the
        // merge so the consumer logs them in trigger order.
        let free_mirror_tx = parts.free_mirror_tx;
        let has_frees = !parts.frees.is_empty();
        for (name, model_tx) in parts.frees {
            let mirror = free_mirror_tx.clone();
            triggers.insert(
                name,
                Arc::new(move |payload| {
                    let _ = model_tx.send(payload.clone());
                    let _ = mirror.send((name, payload));
                    Ok(())
                }),
            );
        }
        drop(free_mirror_tx);
        if has_frees {
            branches.push(
                UnboundedReceiverStream::new(parts.free_mirror_rx)
                    .map(|(action, payload)| Emitted::Free { action, payload })
                    .boxed(),
            );
        }

        *write_unpoisoned(&pipeline.triggers) = triggers;

        // One consumer fair-merges every branch. It holds only a weak
        // reference so an abandoned pipeline can actually drop.
        let mut merged = SelectAll::new();
        for branch in branches {
            merged.push(branch);
        }
        let weak = Arc::downgrade(&pipeline);
        let task = tokio::spawn(async move {
            let mut merged = merged;
            while let Some(item) = merged.next().await {
                let Some(pipe) = weak.upgrade() else { break };
                pipe.absorb(item);
            }
        });
        *lock_unpoisoned(&pipeline.consumer) = Some(task);

        Ok(pipeline)
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> S {
        self.cell.get()
    }

    /// Observe every accepted state change, starting with a replay of the
    /// current value. See [`StateCell::subscribe`] for delivery guarantees.
    pub fn subscribe(&self, observer: impl Fn(&S) + Send + Sync + 'static) -> Subscription {
        self.cell.subscribe(observer)
    }

    /// Async view of the state, suitable for streams and awaiting.
    pub fn watch(&self) -> StateWatch<S> {
        self.cell.watch()
    }

    /// Trigger `action` with a freshly erased payload.
    ///
    /// Sugar for `trigger(action, Payload::new(value))`.
    pub fn send<T: Any + Send + Sync + fmt::Debug>(
        &self,
        action: &str,
        value: T,
    ) -> Result<(), PipelineError> {
        self.trigger(action, Payload::new(value))
    }

    fn absorb(&self, item: Emitted) {
        match item {
            Emitted::Dispatched { origin, dispatch } => {
                self.apply(Action::Dispatched { origin, dispatch })
            }
            Emitted::Free { action, payload } => self.apply(Action::Free { action, payload }),
            Emitted::EffectError { action, error } => {
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    self.logger.effect_failed(self.model_name, action, &error)
                }));
                if outcome.is_err() {
                    tracing::warn!(
                        model = self.model_name,
                        action,
                        "action logger panicked; failure record dropped"
                    );
                }
            }
        }
    }

    /// Apply one action descriptor: log it, then let it take effect.
    fn apply(&self, action: Action<S>) {
        match action {
            Action::Reduced {
                action,
                payload,
                next,
            } => {
                self.log(LogRecord::Reduced {
                    action,
                    payload: &payload,
                    state: &next,
                });
                self.cell.set(next);
            }
            Action::Dispatched { origin, dispatch } => {
                self.log(LogRecord::Dispatched {
                    origin,
                    target: dispatch.target_name(self.model_name),
                    action: dispatch.action(),
                    payload: dispatch.payload(),
                });
                if let Err(error) = self.route(dispatch) {
                    tracing::error!(
                        model = self.model_name,
                        origin,
                        error = %error,
                        "dispatch could not be applied"
                    );
                }
            }
            Action::Free { action, payload } => {
                self.log(LogRecord::Free {
                    action,
                    payload: &payload,
                });
            }
        }
    }

    /// Route a dispatch into its target trigger, binding the target model on
    /// demand for cross-model dispatches.
    fn route(&self, dispatch: Dispatch) -> Result<(), PipelineError> {
        let Dispatch {
            target,
            action,
            payload,
        } = dispatch;
        match target {
            DispatchTarget::Own => self.trigger(action, payload),
            DispatchTarget::Model(target) => {
                let Some(board) = self.board.upgrade() else {
                    return Err(PipelineError::Closed {
                        model: self.model_name,
                    });
                };
                let engine = board.bind_ref(&target)?;
                engine.trigger_erased(action, payload)
            }
        }
    }

    fn log(&self, record: LogRecord<'_>) {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.logger.record(self.model_name, record)
        }));
        if outcome.is_err() {
            tracing::warn!(
                model = self.model_name,
                "action logger panicked; record dropped"
            );
        }
    }
}

impl<S> Pipeline<S> {
    /// Short name of the model this engine runs.
    pub fn model_name(&self) -> &'static str {
        self.model_name
    }

    /// Trigger an action by name.
    ///
    /// Reducer triggers complete the transition before returning; effect and
    /// free triggers only enqueue. Errors are rejections (unknown action,
    /// wrong payload type, closed pipeline); a reducer panic propagates to
    /// the caller and leaves the state unchanged.
    pub fn trigger(&self, action: &str, payload: Payload) -> Result<(), PipelineError> {
        if self.is_closed() {
            return Err(PipelineError::Closed {
                model: self.model_name,
            });
        }
        let handler = read_unpoisoned(&self.triggers).get(action).cloned();
        match handler {
            Some(handler) => handler(payload),
            None => Err(PipelineError::UnknownAction {
                model: self.model_name,
                action: action.to_string(),
            }),
        }
    }

    /// Names of every wired action, sorted.
    pub fn actions(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> =
            read_unpoisoned(&self.triggers).keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Whether [`Pipeline::shutdown`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Tear the engine down.
    ///
    /// Later triggers fail with [`PipelineError::Closed`], effect input
    /// streams end, and the consumer task stops. Idempotent. The binding
    /// table still remembers the instance; use [`Switchboard::release`] to
    /// make a later bind build a fresh engine.
    ///
    /// [`Switchboard::release`]: crate::Switchboard::release
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Dropping the trigger table drops every effect input sender, which
        // ends the effect streams.
        write_unpoisoned(&self.triggers).clear();
        if let Some(task) = lock_unpoisoned(&self.consumer).take() {
            task.abort();
        }
        tracing::debug!(model = self.model_name, "pipeline shut down");
    }
}

impl<S> Drop for Pipeline<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<S> fmt::Debug for Pipeline<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("model", &self.model_name)
            .field("actions", &read_unpoisoned(&self.triggers).len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Type-erased pipeline surface used by the binding table and cross-model
/// dispatch.
pub(crate) trait AnyPipeline: Send + Sync + 'static {
    fn trigger_erased(&self, action: &str, payload: Payload) -> Result<(), PipelineError>;
    fn shutdown_erased(&self);
    fn model_name_erased(&self) -> &'static str;
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<S> AnyPipeline for Pipeline<S>
where
    S: Clone + PartialEq + fmt::Debug + Send + Sync + 'static,
{
    fn trigger_erased(&self, action: &str, payload: Payload) -> Result<(), PipelineError> {
        self.trigger(action, payload)
    }

    fn shutdown_erased(&self) {
        self.shutdown()
    }

    fn model_name_erased(&self) -> &'static str {
        self.model_name
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
