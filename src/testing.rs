//! Testing utilities for switchboard models and pipelines.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! switchboard = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ## Recording transitions with `SpyLogger`
//!
//! ```ignore
//! use switchboard::testing::{SpyKind, SpyLogger};
//! use switchboard::{Scope, Switchboard};
//!
//! let spy = SpyLogger::new();
//! let board = Switchboard::builder().with_logger(spy.clone()).build();
//!
//! let cart = board.get_or_create(Scope::Singleton, || CartModel::default());
//! cart.bind()?.send("add_item", "A-100".to_string())?;
//!
//! spy.assert_logged("add_item");
//! assert_eq!(spy.count_of(SpyKind::Reduced), 1);
//! ```
//!
//! Effect emissions land asynchronously, so tests wait on observed records
//! instead of sleeping:
//!
//! ```ignore
//! pipeline.send("refresh", ())?;
//! spy.wait_for_kind(SpyKind::Dispatched, 1).await;
//! ```
//!
//! ## Driving one model with `TestProbe`
//!
//! ```ignore
//! use switchboard::testing::TestProbe;
//!
//! let probe = TestProbe::new(&board, &cart)?;
//! probe.send("checkout", ())?;
//! let settled = probe.await_state(|s| s.submitted).await;
//! assert_eq!(settled.items.len(), 2);
//! ```

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use crate::core::{lock_unpoisoned, Payload};
use crate::error::PipelineError;
use crate::logger::{ActionLogger, LogRecord};
use crate::model::Model;
use crate::pipeline::Pipeline;
use crate::registry::{ModelHandle, Switchboard};

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

// ─────────────────────────────────────────────────────────────────────────────
// Spy logger
// ─────────────────────────────────────────────────────────────────────────────

/// Which kind of record a [`SpyRecord`] captured.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpyKind {
    /// A reducer or mutator transitioned state.
    Reduced,
    /// An effect emitted a dispatch.
    Dispatched,
    /// A free action passed through.
    Free,
    /// An effect stream yielded an error and went inert.
    EffectFailed,
}

/// One observed record, with borrowed log data rendered to owned strings.
#[derive(Clone, Debug)]
pub struct SpyRecord {
    /// Model the record came from.
    pub model: &'static str,
    pub kind: SpyKind,
    pub action: String,
    /// Originating effect, for dispatch records.
    pub origin: Option<String>,
    /// Dispatch destination, for dispatch records.
    pub target: Option<String>,
    /// Debug rendering of the payload.
    pub payload: String,
    /// Debug rendering of the post-transition state, for reduced records.
    pub state: Option<String>,
    /// Error text, for failed-effect records.
    pub error: Option<String>,
}

/// Logger that records every action for test assertions.
///
/// Clones share the same storage, so a test can keep one clone and hand
/// another to [`SwitchboardBuilder::with_logger`].
///
/// # Example
///
/// ```ignore
/// let spy = SpyLogger::new();
/// let board = Switchboard::builder().with_logger(spy.clone()).build();
///
/// // ... drive some models ...
///
/// spy.assert_logged("add_item");
/// assert_eq!(spy.count_of(SpyKind::EffectFailed), 0);
/// ```
///
/// [`SwitchboardBuilder::with_logger`]: crate::SwitchboardBuilder::with_logger
#[derive(Debug, Clone, Default)]
pub struct SpyLogger {
    inner: Arc<SpyInner>,
}

#[derive(Debug, Default)]
struct SpyInner {
    records: Mutex<Vec<SpyRecord>>,
    notify: Notify,
}

impl SpyLogger {
    /// Create a new empty spy.
    pub fn new() -> Self {
        Self::default()
    }

    /// All records captured so far, in arrival order.
    pub fn records(&self) -> Vec<SpyRecord> {
        lock_unpoisoned(&self.inner.records).clone()
    }

    /// Total number of captured records.
    pub fn record_count(&self) -> usize {
        lock_unpoisoned(&self.inner.records).len()
    }

    /// Action names in arrival order.
    pub fn actions(&self) -> Vec<String> {
        lock_unpoisoned(&self.inner.records)
            .iter()
            .map(|r| r.action.clone())
            .collect()
    }

    /// Number of records of the given kind.
    pub fn count_of(&self, kind: SpyKind) -> usize {
        lock_unpoisoned(&self.inner.records)
            .iter()
            .filter(|r| r.kind == kind)
            .count()
    }

    /// All records of the given kind.
    pub fn records_of(&self, kind: SpyKind) -> Vec<SpyRecord> {
        lock_unpoisoned(&self.inner.records)
            .iter()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect()
    }

    /// Drop all captured records.
    ///
    /// Useful for resetting between test phases.
    pub fn clear(&self) {
        lock_unpoisoned(&self.inner.records).clear();
    }

    /// Assert that an action with the given name was recorded.
    ///
    /// # Panics
    ///
    /// Panics if no record carries the action.
    pub fn assert_logged(&self, action: &str) {
        assert!(
            lock_unpoisoned(&self.inner.records)
                .iter()
                .any(|r| r.action == action),
            "action '{}' was never logged; saw {:?}",
            action,
            self.actions()
        );
    }

    /// Assert that no record carries the given action name.
    ///
    /// # Panics
    ///
    /// Panics if the action was recorded.
    pub fn assert_not_logged(&self, action: &str) {
        let count = lock_unpoisoned(&self.inner.records)
            .iter()
            .filter(|r| r.action == action)
            .count();
        assert!(
            count == 0,
            "action '{}' was logged {} times, expected none",
            action,
            count
        );
    }

    /// Wait until at least `min` records have been captured.
    ///
    /// # Panics
    ///
    /// Panics if five seconds pass first.
    pub async fn wait_for_count(&self, min: usize) {
        self.wait_until(
            |records| records.len() >= min,
            &format!("at least {min} records"),
        )
        .await;
    }

    /// Wait until at least `min` records of `kind` have been captured.
    ///
    /// # Panics
    ///
    /// Panics if five seconds pass first.
    pub async fn wait_for_kind(&self, kind: SpyKind, min: usize) {
        self.wait_until(
            |records| records.iter().filter(|r| r.kind == kind).count() >= min,
            &format!("at least {min} {kind:?} records"),
        )
        .await;
    }

    async fn wait_until<F>(&self, mut met: F, what: &str)
    where
        F: FnMut(&[SpyRecord]) -> bool,
    {
        let wait = async {
            loop {
                // Arm the notification before checking, so a record landing
                // between the check and the await is not missed.
                let notified = self.inner.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if met(&lock_unpoisoned(&self.inner.records)) {
                    return;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(WAIT_TIMEOUT, wait).await.is_err() {
            panic!("timed out waiting for {what}; saw {:?}", self.actions());
        }
    }

    fn push(&self, record: SpyRecord) {
        lock_unpoisoned(&self.inner.records).push(record);
        self.inner.notify.notify_waiters();
    }
}

impl ActionLogger for SpyLogger {
    fn record(&self, model: &'static str, record: LogRecord<'_>) {
        let owned = match record {
            LogRecord::Reduced {
                action,
                payload,
                state,
            } => SpyRecord {
                model,
                kind: SpyKind::Reduced,
                action: action.to_string(),
                origin: None,
                target: None,
                payload: format!("{payload:?}"),
                state: Some(format!("{state:?}")),
                error: None,
            },
            LogRecord::Dispatched {
                origin,
                target,
                action,
                payload,
            } => SpyRecord {
                model,
                kind: SpyKind::Dispatched,
                action: action.to_string(),
                origin: Some(origin.to_string()),
                target: Some(target.to_string()),
                payload: format!("{payload:?}"),
                state: None,
                error: None,
            },
            LogRecord::Free { action, payload } => SpyRecord {
                model,
                kind: SpyKind::Free,
                action: action.to_string(),
                origin: None,
                target: None,
                payload: format!("{payload:?}"),
                state: None,
                error: None,
            },
        };
        self.push(owned);
    }

    fn effect_failed(&self, model: &'static str, action: &'static str, error: &anyhow::Error) {
        self.push(SpyRecord {
            model,
            kind: SpyKind::EffectFailed,
            action: action.to_string(),
            origin: None,
            target: None,
            payload: String::new(),
            state: None,
            error: Some(error.to_string()),
        });
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test probe
// ─────────────────────────────────────────────────────────────────────────────

/// Binds one model and wraps its pipeline in assertion-friendly helpers.
pub struct TestProbe<M: Model> {
    handle: ModelHandle<M>,
    pipeline: Arc<Pipeline<M::State>>,
}

impl<M: Model> TestProbe<M> {
    /// Bind `handle` on `board` and wrap the resulting pipeline.
    pub fn new(board: &Switchboard, handle: &ModelHandle<M>) -> Result<Self, PipelineError> {
        let pipeline = board.bind(handle)?;
        Ok(Self {
            handle: handle.clone(),
            pipeline,
        })
    }

    /// The handle this probe was built from.
    pub fn handle(&self) -> &ModelHandle<M> {
        &self.handle
    }

    /// The bound pipeline.
    pub fn pipeline(&self) -> &Arc<Pipeline<M::State>> {
        &self.pipeline
    }

    /// Current state snapshot.
    pub fn state(&self) -> M::State {
        self.pipeline.state()
    }

    /// Trigger an action with a typed payload. See [`Pipeline::send`].
    pub fn send<T>(&self, action: &str, params: T) -> Result<(), PipelineError>
    where
        T: Any + Send + Sync + fmt::Debug,
    {
        self.pipeline.send(action, params)
    }

    /// Trigger an action with an already-wrapped payload.
    pub fn trigger(&self, action: &str, payload: Payload) -> Result<(), PipelineError> {
        self.pipeline.trigger(action, payload)
    }

    /// Wired action names, sorted.
    pub fn actions(&self) -> Vec<&'static str> {
        self.pipeline.actions()
    }

    /// Wait until the state satisfies `predicate`, returning the matching
    /// state.
    ///
    /// # Panics
    ///
    /// Panics if the pipeline shuts down first or five seconds pass without
    /// a match.
    pub async fn await_state<F>(&self, predicate: F) -> M::State
    where
        F: FnMut(&M::State) -> bool,
    {
        let mut watch = self.pipeline.watch();
        match tokio::time::timeout(WAIT_TIMEOUT, watch.wait_until(predicate)).await {
            Ok(Some(state)) => state,
            Ok(None) => panic!("pipeline closed while awaiting state"),
            Err(_) => panic!(
                "timed out awaiting state predicate (current: {:?})",
                self.pipeline.state()
            ),
        }
    }
}

impl<M: Model> fmt::Debug for TestProbe<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TestProbe({})", M::model_name())
    }
}
