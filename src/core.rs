//! Core vocabulary types shared across the crate.
//!
//! # Overview
//!
//! Switchboard separates **state transitions** from **side effects**:
//! - [`Payload`] = the type-erased argument an action was triggered with
//! - [`Dispatch`] = a follow-up action produced by an effect stream
//! - [`Scope`] = where a model instance lives in the registry
//!
//! Payloads are erased at the trigger boundary and recovered inside handlers,
//! so models keep plain typed reducer signatures while the pipeline routes
//! everything through one uniform channel.

use std::any::{self, Any};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::registry::ModelRef;

// ─────────────────────────────────────────────────────────────────────────────
// Lock helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// Handler panics are isolated at the trigger boundary; a poisoned apply gate
/// must not wedge every later trigger on the same pipeline.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn read_unpoisoned<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn write_unpoisoned<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Last path segment of a type name. `my_app::cart::CartModel` becomes
/// `CartModel`.
pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

// ─────────────────────────────────────────────────────────────────────────────
// Payload - type-erased action argument
// ─────────────────────────────────────────────────────────────────────────────

type PayloadFmt = fn(&(dyn Any + Send + Sync), &mut fmt::Formatter<'_>) -> fmt::Result;

/// Type-erased argument carried by a triggered action.
///
/// A `Payload` moves the value an action was triggered with through the
/// pipeline without the pipeline knowing its type. Handlers recover the
/// concrete type with [`Payload::downcast_ref`]; the pipeline itself only
/// clones, logs, and routes it.
///
/// Cloning is cheap: the value sits behind an `Arc`, so every handler and log
/// record that sees the payload shares one allocation.
///
/// # Example
///
/// ```
/// use switchboard::Payload;
///
/// let payload = Payload::new(42u32);
/// assert_eq!(payload.downcast_ref::<u32>(), Some(&42));
/// assert!(payload.downcast_ref::<String>().is_none());
/// ```
#[derive(Clone)]
pub struct Payload {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
    fmt_value: PayloadFmt,
}

impl Payload {
    /// Erase a value into a payload.
    ///
    /// The value must be `Debug` so the pipeline can include it in action log
    /// records without knowing its type.
    pub fn new<T: Any + Send + Sync + fmt::Debug>(value: T) -> Self {
        let fmt_value: PayloadFmt = |value, f| match value.downcast_ref::<T>() {
            Some(concrete) => fmt::Debug::fmt(concrete, f),
            None => f.write_str("<payload>"),
        };
        Self {
            value: Arc::new(value),
            type_name: any::type_name::<T>(),
            fmt_value,
        }
    }

    /// Payload for actions triggered without an argument.
    pub fn unit() -> Self {
        Self::new(())
    }

    /// Recover the concrete value, if it has type `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref()
    }

    /// Check whether the erased value has type `T`.
    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }

    /// Type name of the erased value, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (self.fmt_value)(&*self.value, f)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatch - follow-up actions produced by effects
// ─────────────────────────────────────────────────────────────────────────────

/// A follow-up action emitted by an effect stream.
///
/// Effects never touch state directly. They emit `Dispatch` values, and the
/// pipeline consumer routes each one into the named trigger: either back into
/// the emitting model or into another model instance.
#[derive(Clone)]
pub struct Dispatch {
    pub(crate) target: DispatchTarget,
    pub(crate) action: &'static str,
    pub(crate) payload: Payload,
}

impl Dispatch {
    /// Dispatch back into the emitting model.
    pub fn own(action: &'static str, payload: Payload) -> Self {
        Self {
            target: DispatchTarget::Own,
            action,
            payload,
        }
    }

    /// Dispatch into another model instance.
    ///
    /// The target is bound on demand: if no pipeline exists for it yet, one
    /// is built the moment this dispatch is applied.
    pub fn to(target: &ModelRef, action: &'static str, payload: Payload) -> Self {
        Self {
            target: DispatchTarget::Model(target.clone()),
            action,
            payload,
        }
    }

    /// The action name this dispatch will trigger.
    pub fn action(&self) -> &'static str {
        self.action
    }

    /// The payload the triggered action will receive.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Where this dispatch is routed.
    pub fn target(&self) -> &DispatchTarget {
        &self.target
    }

    /// Resolve the target model name, given the name of the emitting model.
    pub(crate) fn target_name(&self, own: &'static str) -> &'static str {
        match &self.target {
            DispatchTarget::Own => own,
            DispatchTarget::Model(target) => target.model_name(),
        }
    }
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatch")
            .field("target", &self.target)
            .field("action", &self.action)
            .field("payload", &self.payload)
            .finish()
    }
}

/// Routing target of a [`Dispatch`].
#[derive(Clone)]
pub enum DispatchTarget {
    /// The model whose effect emitted the dispatch.
    Own,
    /// A specific model instance, bound on demand.
    Model(ModelRef),
}

impl fmt::Debug for DispatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchTarget::Own => f.write_str("Own"),
            DispatchTarget::Model(target) => write!(f, "Model({})", target.model_name()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scope - where a model instance lives
// ─────────────────────────────────────────────────────────────────────────────

/// Lifetime scope of a model instance in the registry.
///
/// The registry memoizes instances per `(model type, scope)` key. Two lookups
/// with the same key observe the same instance; there is no automatic
/// eviction, so a memoized instance lives until it is explicitly evicted or
/// the registry is dropped.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    /// One shared instance per model type.
    Singleton,
    /// One instance per `(model type, key)` pair.
    Named(String),
    /// A fresh instance on every request, never stored.
    Transient,
}

impl Scope {
    /// Convenience constructor for [`Scope::Named`].
    pub fn named(key: impl Into<String>) -> Self {
        Self::Named(key.into())
    }
}
