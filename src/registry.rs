//! Scoped model instances and pipeline binding.
//!
//! A [`Switchboard`] does two jobs:
//!
//! 1. **Registry**: memoize model instances per `(model type, scope)` key.
//!    [`Switchboard::get_or_create`] runs the factory at most once per key,
//!    even under concurrent lookups, and nothing is evicted automatically.
//! 2. **Binding**: attach at most one [`Pipeline`] to each live instance,
//!    keyed by instance identity. [`Switchboard::bind`] is idempotent;
//!    cross-model dispatches bind their target on demand through the same
//!    table.
//!
//! Instance identity is the `Arc` allocation address. Binding entries hold
//! the instance weakly, which both lets abandoned instances drop and pins
//! their address against reuse until [`Switchboard::prune`] sweeps the dead
//! entries.
//!
//! # Example
//!
//! ```ignore
//! use switchboard::{Scope, Switchboard};
//!
//! let board = Switchboard::new();
//!
//! let cart = board.get_or_create(Scope::named("cart:41"), || CartModel::default());
//! let pipeline = cart.bind()?;
//!
//! pipeline.send("add_item", "A-100".to_string())?;
//! assert_eq!(pipeline.state().items.len(), 1);
//!
//! // Same key, same instance, same pipeline.
//! let again = board.get_or_create(Scope::named("cart:41"), || CartModel::default());
//! assert!(cart.same_instance(&again));
//! ```

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;

use crate::core::{lock_unpoisoned, Scope};
use crate::error::PipelineError;
use crate::logger::{ActionLogger, TracingLogger};
use crate::model::Model;
use crate::pipeline::{AnyPipeline, Pipeline};

// ─────────────────────────────────────────────────────────────────────────────
// Type-erased model instances
// ─────────────────────────────────────────────────────────────────────────────

/// Object-safe surface of a model instance, used by the registry and by
/// cross-model dispatch.
pub(crate) trait AnyModel: Send + Sync + 'static {
    fn model_name(&self) -> &'static str;
    fn build_engine(
        self: Arc<Self>,
        board: &Arc<BoardInner>,
    ) -> Result<Arc<dyn AnyPipeline>, PipelineError>;
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<M: Model> AnyModel for M {
    fn model_name(&self) -> &'static str {
        M::model_name()
    }

    fn build_engine(
        self: Arc<Self>,
        board: &Arc<BoardInner>,
    ) -> Result<Arc<dyn AnyPipeline>, PipelineError> {
        let engine = Pipeline::build(self, Arc::downgrade(board), board.logger.clone())?;
        Ok(engine as Arc<dyn AnyPipeline>)
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Shareable reference to a model instance, without its concrete type.
///
/// This is what models capture to dispatch into each other: a `ModelRef`
/// inside a [`Dispatch::to`] names the exact instance the dispatch should
/// reach. Holding one keeps the instance alive.
///
/// [`Dispatch::to`]: crate::Dispatch::to
#[derive(Clone)]
pub struct ModelRef {
    pub(crate) instance: Arc<dyn AnyModel>,
}

impl ModelRef {
    /// Short name of the referenced model type.
    pub fn model_name(&self) -> &'static str {
        self.instance.model_name()
    }

    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.instance) as *const () as usize
    }
}

impl fmt::Debug for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModelRef({})", self.model_name())
    }
}

/// Typed handle to a registered (or transient) model instance.
///
/// Handles are cheap to clone and carry the switchboard they came from, so
/// [`ModelHandle::bind`] needs no extra arguments.
pub struct ModelHandle<M: Model> {
    instance: Arc<M>,
    board: Switchboard,
}

impl<M: Model> ModelHandle<M> {
    /// The model instance itself.
    pub fn model(&self) -> &M {
        &self.instance
    }

    /// Type-erased reference for cross-model dispatch.
    pub fn model_ref(&self) -> ModelRef {
        ModelRef {
            instance: self.instance.clone(),
        }
    }

    /// Bind this instance, reusing its memoized pipeline if one exists.
    pub fn bind(&self) -> Result<Arc<Pipeline<M::State>>, PipelineError> {
        self.board.bind(self)
    }

    /// Drop this instance's binding, shutting its pipeline down.
    pub fn release(&self) -> bool {
        self.board.release(self)
    }

    /// Whether two handles point at the same instance.
    pub fn same_instance(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.instance, &other.instance)
    }

    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.instance) as *const () as usize
    }
}

impl<M: Model> Clone for ModelHandle<M> {
    fn clone(&self) -> Self {
        Self {
            instance: self.instance.clone(),
            board: self.board.clone(),
        }
    }
}

impl<M: Model> fmt::Debug for ModelHandle<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModelHandle({})", M::model_name())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry internals
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, PartialEq, Eq, Hash)]
enum ScopeKey {
    Singleton,
    Named(String),
}

fn slot_key(scope: &Scope) -> Option<ScopeKey> {
    match scope {
        Scope::Singleton => Some(ScopeKey::Singleton),
        Scope::Named(name) => Some(ScopeKey::Named(name.clone())),
        Scope::Transient => None,
    }
}

/// One registry cell. The slot lock, not the map shard lock, guards instance
/// construction, so factories may create other models re-entrantly.
#[derive(Default)]
struct RegistrySlot {
    instance: Mutex<Option<Arc<dyn AnyModel>>>,
}

/// One binding-table row: the instance (weak) and its engine (strong).
struct BindingEntry {
    instance: Weak<dyn AnyModel>,
    engine: Mutex<Option<Arc<dyn AnyPipeline>>>,
}

impl BindingEntry {
    fn shutdown(&self) {
        if let Some(engine) = lock_unpoisoned(&self.engine).take() {
            engine.shutdown_erased();
        }
    }
}

pub(crate) struct BoardInner {
    registry: DashMap<(TypeId, ScopeKey), Arc<RegistrySlot>>,
    bindings: DashMap<usize, Arc<BindingEntry>>,
    pub(crate) logger: Arc<dyn ActionLogger>,
}

impl BoardInner {
    /// Memoized engine for `target`, building one on first request.
    pub(crate) fn bind_ref(
        self: Arc<Self>,
        target: &ModelRef,
    ) -> Result<Arc<dyn AnyPipeline>, PipelineError> {
        let entry = self
            .bindings
            .entry(target.key())
            .or_insert_with(|| {
                Arc::new(BindingEntry {
                    instance: Arc::downgrade(&target.instance),
                    engine: Mutex::new(None),
                })
            })
            .clone();

        // Engine construction runs user wiring code, so it happens under the
        // entry's own lock rather than the map shard lock. Binding another
        // instance from inside wiring is fine; recursively binding the same
        // instance is not.
        let mut engine = lock_unpoisoned(&entry.engine);
        if let Some(existing) = engine.as_ref() {
            return Ok(existing.clone());
        }
        let built = target.instance.clone().build_engine(&self)?;
        *engine = Some(built.clone());
        Ok(built)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Switchboard - the public front door
// ─────────────────────────────────────────────────────────────────────────────

/// Owns the instance registry and the binding table.
///
/// Cloning a `Switchboard` is cheap and every clone shares the same state.
/// Dropping the last clone (and every handle into it) tears down all
/// remaining pipelines.
#[derive(Clone)]
pub struct Switchboard {
    inner: Arc<BoardInner>,
}

impl Switchboard {
    /// Switchboard with the default [`TracingLogger`].
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Start configuring a switchboard.
    pub fn builder() -> SwitchboardBuilder {
        SwitchboardBuilder::new()
    }

    /// Fetch the instance for `(M, scope)`, creating it if absent.
    ///
    /// The factory runs at most once per key, under the key's own lock, so
    /// concurrent callers race to one instance. [`Scope::Transient`] skips
    /// the registry entirely and always returns a fresh, unstored instance.
    ///
    /// A factory may create *other* models re-entrantly; requesting its own
    /// key from inside the factory deadlocks.
    pub fn get_or_create<M, F>(&self, scope: Scope, init: F) -> ModelHandle<M>
    where
        M: Model,
        F: FnOnce() -> M,
    {
        let Some(scope_key) = slot_key(&scope) else {
            return ModelHandle {
                instance: Arc::new(init()),
                board: self.clone(),
            };
        };
        let key = (TypeId::of::<M>(), scope_key);
        let slot = self
            .inner
            .registry
            .entry(key)
            .or_insert_with(Default::default)
            .clone();

        let mut instance = lock_unpoisoned(&slot.instance);
        let erased = match instance.as_ref() {
            Some(existing) => existing.clone(),
            None => {
                let created: Arc<dyn AnyModel> = Arc::new(init());
                *instance = Some(created.clone());
                created
            }
        };
        drop(instance);
        self.typed_handle::<M>(erased)
    }

    /// Fetch the instance for `(M, scope)` if it already exists.
    ///
    /// Always `None` for [`Scope::Transient`]; transient instances are never
    /// stored.
    pub fn get<M: Model>(&self, scope: &Scope) -> Option<ModelHandle<M>> {
        let scope_key = slot_key(scope)?;
        let key = (TypeId::of::<M>(), scope_key);
        let slot = self.inner.registry.get(&key)?.clone();
        let existing = lock_unpoisoned(&slot.instance).clone()?;
        Some(self.typed_handle::<M>(existing))
    }

    /// Remove the instance for `(M, scope)` from the registry, shutting down
    /// its pipeline if it was bound.
    ///
    /// Returns whether an entry was removed. Outstanding handles keep the
    /// evicted instance alive, but the next [`Switchboard::get_or_create`]
    /// builds a fresh one.
    pub fn evict<M: Model>(&self, scope: &Scope) -> bool {
        let Some(scope_key) = slot_key(scope) else {
            return false;
        };
        let key = (TypeId::of::<M>(), scope_key);
        let Some((_, slot)) = self.inner.registry.remove(&key) else {
            return false;
        };
        if let Some(instance) = lock_unpoisoned(&slot.instance).take() {
            self.release_key(Arc::as_ptr(&instance) as *const () as usize);
        }
        true
    }

    /// Bind `handle`'s instance, reusing its memoized pipeline if one
    /// exists.
    ///
    /// The first bind wires the model, initializes its effects, and spawns
    /// the consumer task; later binds return the same engine. Must be called
    /// inside a Tokio runtime.
    pub fn bind<M: Model>(
        &self,
        handle: &ModelHandle<M>,
    ) -> Result<Arc<Pipeline<M::State>>, PipelineError> {
        let target = handle.model_ref();
        let engine = self.inner.clone().bind_ref(&target)?;
        engine
            .as_any_arc()
            .downcast::<Pipeline<M::State>>()
            .map_err(|_| PipelineError::TypeMismatch {
                model: M::model_name(),
            })
    }

    /// Drop the binding for `handle`'s instance, shutting its pipeline down.
    ///
    /// Returns whether a binding existed. The instance itself stays
    /// registered; a later bind builds a fresh engine with default state.
    pub fn release<M: Model>(&self, handle: &ModelHandle<M>) -> bool {
        self.release_key(handle.key())
    }

    /// Sweep binding entries whose instance has been dropped.
    ///
    /// Returns how many entries were removed. Each removed entry's pipeline
    /// is shut down.
    pub fn prune(&self) -> usize {
        let dead: Vec<usize> = self
            .inner
            .bindings
            .iter()
            .filter(|entry| entry.value().instance.strong_count() == 0)
            .map(|entry| *entry.key())
            .collect();
        let mut removed = 0;
        for key in dead {
            if let Some((_, entry)) = self.inner.bindings.remove(&key) {
                entry.shutdown();
                removed += 1;
            }
        }
        removed
    }

    /// Tear down every binding and clear the registry.
    pub fn shutdown_all(&self) {
        self.inner.registry.clear();
        let keys: Vec<usize> = self.inner.bindings.iter().map(|entry| *entry.key()).collect();
        for key in keys {
            if let Some((_, entry)) = self.inner.bindings.remove(&key) {
                entry.shutdown();
            }
        }
    }

    /// Number of live binding-table rows, dead entries included until
    /// [`Switchboard::prune`] runs.
    pub fn binding_count(&self) -> usize {
        self.inner.bindings.len()
    }

    /// Number of registry slots.
    pub fn registered_count(&self) -> usize {
        self.inner.registry.len()
    }

    fn release_key(&self, key: usize) -> bool {
        match self.inner.bindings.remove(&key) {
            Some((_, entry)) => {
                entry.shutdown();
                true
            }
            None => false,
        }
    }

    fn typed_handle<M: Model>(&self, erased: Arc<dyn AnyModel>) -> ModelHandle<M> {
        match erased.as_any_arc().downcast::<M>() {
            Ok(instance) => ModelHandle {
                instance,
                board: self.clone(),
            },
            // Keys carry the TypeId, so a mismatch means the registry itself
            // is corrupt.
            Err(_) => panic!(
                "registry slot for {} held an instance of a different type",
                M::model_name()
            ),
        }
    }
}

impl Default for Switchboard {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Switchboard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Switchboard")
            .field("registered", &self.registered_count())
            .field("bound", &self.binding_count())
            .finish()
    }
}

/// Configures a [`Switchboard`] before construction.
pub struct SwitchboardBuilder {
    logger: Arc<dyn ActionLogger>,
}

impl SwitchboardBuilder {
    pub fn new() -> Self {
        Self {
            logger: Arc::new(TracingLogger),
        }
    }

    /// Replace the default [`TracingLogger`].
    pub fn with_logger(mut self, logger: impl ActionLogger) -> Self {
        self.logger = Arc::new(logger);
        self
    }

    pub fn build(self) -> Switchboard {
        Switchboard {
            inner: Arc::new(BoardInner {
                registry: DashMap::new(),
                bindings: DashMap::new(),
                logger: self.logger,
            }),
        }
    }
}

impl Default for SwitchboardBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SwitchboardBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwitchboardBuilder").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Wiring;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Widget;

    impl Model for Widget {
        type State = i32;

        fn default_state(&self) -> i32 {
            0
        }

        fn wire(&self, w: &mut Wiring<Self>) {
            w.reducer("set", |_, v: &i32| *v);
        }
    }

    struct Gadget;

    impl Model for Gadget {
        type State = i32;

        fn default_state(&self) -> i32 {
            0
        }

        fn wire(&self, w: &mut Wiring<Self>) {
            w.reducer("set", |_, v: &i32| *v);
        }
    }

    #[test]
    fn test_singleton_runs_factory_once() {
        let board = Switchboard::new();
        let made = Arc::new(AtomicUsize::new(0));

        let first = {
            let made = made.clone();
            board.get_or_create(Scope::Singleton, move || {
                made.fetch_add(1, Ordering::SeqCst);
                Widget
            })
        };
        let second = {
            let made = made.clone();
            board.get_or_create(Scope::Singleton, move || {
                made.fetch_add(1, Ordering::SeqCst);
                Widget
            })
        };

        assert!(first.same_instance(&second));
        assert_eq!(made.load(Ordering::SeqCst), 1);
        assert_eq!(board.registered_count(), 1);
    }

    #[test]
    fn test_named_scopes_are_distinct() {
        let board = Switchboard::new();

        let a = board.get_or_create(Scope::named("a"), || Widget);
        let b = board.get_or_create(Scope::named("b"), || Widget);
        let a_again = board.get_or_create(Scope::named("a"), || Widget);

        assert!(!a.same_instance(&b));
        assert!(a.same_instance(&a_again));
        assert_eq!(board.registered_count(), 2);
    }

    #[test]
    fn test_same_named_key_different_types_do_not_collide() {
        let board = Switchboard::new();

        let widget = board.get_or_create(Scope::named("shared"), || Widget);
        let gadget = board.get_or_create(Scope::named("shared"), || Gadget);

        let widget_again: ModelHandle<Widget> = board.get(&Scope::named("shared")).unwrap();
        assert!(widget.same_instance(&widget_again));
        drop(gadget);
        assert_eq!(board.registered_count(), 2);
    }

    #[test]
    fn test_transient_is_always_fresh_and_unstored() {
        let board = Switchboard::new();

        let one = board.get_or_create(Scope::Transient, || Widget);
        let two = board.get_or_create(Scope::Transient, || Widget);

        assert!(!one.same_instance(&two));
        assert_eq!(board.registered_count(), 0);
        assert!(board.get::<Widget>(&Scope::Transient).is_none());
    }

    #[test]
    fn test_get_without_create_returns_none() {
        let board = Switchboard::new();
        assert!(board.get::<Widget>(&Scope::Singleton).is_none());
    }

    #[test]
    fn test_evict_then_recreate_builds_new_instance() {
        let board = Switchboard::new();
        let scope = Scope::named("w");

        let first = board.get_or_create(scope.clone(), || Widget);
        assert!(board.evict::<Widget>(&scope));
        assert!(board.get::<Widget>(&scope).is_none());
        assert!(!board.evict::<Widget>(&scope));

        let second = board.get_or_create(scope, || Widget);
        assert!(!first.same_instance(&second));
    }

    #[tokio::test]
    async fn test_bind_is_idempotent() {
        let board = Switchboard::new();
        let handle = board.get_or_create(Scope::Singleton, || Widget);

        let first = handle.bind().unwrap();
        let second = handle.bind().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(board.binding_count(), 1);
    }

    #[tokio::test]
    async fn test_bound_pipeline_state_survives_rebinding() {
        let board = Switchboard::new();
        let handle = board.get_or_create(Scope::Singleton, || Widget);

        handle.bind().unwrap().send("set", 5i32).unwrap();

        assert_eq!(handle.bind().unwrap().state(), 5);
    }

    #[tokio::test]
    async fn test_release_then_bind_builds_fresh_engine() {
        let board = Switchboard::new();
        let handle = board.get_or_create(Scope::Singleton, || Widget);

        let old = handle.bind().unwrap();
        old.send("set", 5i32).unwrap();

        assert!(handle.release());
        assert!(old.is_closed());
        assert!(!handle.release());

        let fresh = handle.bind().unwrap();
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert_eq!(fresh.state(), 0);
    }

    #[tokio::test]
    async fn test_evict_shuts_down_binding() {
        let board = Switchboard::new();
        let handle = board.get_or_create(Scope::Singleton, || Widget);
        let pipe = handle.bind().unwrap();

        assert!(board.evict::<Widget>(&Scope::Singleton));

        assert!(pipe.is_closed());
        assert_eq!(board.binding_count(), 0);
    }

    #[tokio::test]
    async fn test_prune_sweeps_dead_instances() {
        let board = Switchboard::new();
        let handle = board.get_or_create(Scope::Transient, || Widget);
        let pipe = handle.bind().unwrap();
        assert_eq!(board.binding_count(), 1);

        // The pipeline does not keep the instance alive; dropping the last
        // handle makes the entry prunable.
        drop(handle);
        assert_eq!(board.prune(), 1);

        assert!(pipe.is_closed());
        assert_eq!(board.binding_count(), 0);
        assert_eq!(board.prune(), 0);
    }

    #[tokio::test]
    async fn test_prune_keeps_live_instances() {
        let board = Switchboard::new();
        let handle = board.get_or_create(Scope::Singleton, || Widget);
        let _pipe = handle.bind().unwrap();

        assert_eq!(board.prune(), 0);
        assert_eq!(board.binding_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_all_clears_everything() {
        let board = Switchboard::new();
        let widget = board.get_or_create(Scope::Singleton, || Widget);
        let gadget = board.get_or_create(Scope::Singleton, || Gadget);
        let wpipe = widget.bind().unwrap();
        let gpipe = gadget.bind().unwrap();

        board.shutdown_all();

        assert!(wpipe.is_closed());
        assert!(gpipe.is_closed());
        assert_eq!(board.registered_count(), 0);
        assert_eq!(board.binding_count(), 0);
        assert!(board.get::<Widget>(&Scope::Singleton).is_none());
    }

    #[test]
    fn test_model_ref_reports_name() {
        let board = Switchboard::new();
        let handle = board.get_or_create(Scope::Singleton, || Widget);

        let r = handle.model_ref();
        assert_eq!(r.model_name(), "Widget");
        assert_eq!(format!("{:?}", r), "ModelRef(Widget)");
    }

    #[test]
    fn test_switchboard_debug_counts() {
        let board = Switchboard::new();
        board.get_or_create(Scope::Singleton, || Widget);

        let debug = format!("{:?}", board);
        assert!(debug.contains("registered: 1"));
    }
}
