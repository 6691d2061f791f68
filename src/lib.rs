//! # Switchboard
//!
//! An action orchestration layer where models hold observable state,
//! reducers apply synchronously, and effects chain actions across scoped
//! instances.
//!
//! ## Core Concepts
//!
//! Switchboard separates **transitions** from **work**:
//! - Reducers = Transitions (pure, synchronous, state in / state out)
//! - Effects = Work (async streams that emit follow-up actions)
//!
//! The key principle: **state changes only through the apply gate**. Every
//! trigger runs read, reduce, and store as one serialized step, so observers
//! never see a torn update.
//!
//! ## Architecture
//!
//! ```text
//! trigger("add_item", payload)
//!     │
//!     ▼ apply gate (serialized)
//! reducer ─► StateCell.set() ─► subscribers / StateWatch
//!     │
//!     ▼ enqueue
//! effect branch (owned task)
//!     │
//!     ├─► Dispatch::own(..) ──► this pipeline
//!     └─► Dispatch::to(..)  ──► bind-on-demand ──► peer pipeline
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Reducers complete synchronously** - the new state is stored before
//!    `trigger` returns
//! 2. **Effects only enqueue** - payloads are queued for the branch task and
//!    handled later
//! 3. **Per-source ordering** - payloads reach an effect branch in send order
//! 4. **Failed branches go inert** - one bad stream never poisons its siblings
//! 5. **Exactly-once creation** - a registry key runs its factory once
//! 6. **Idempotent binding** - rebinding an instance returns the same engine
//!
//! ## Example
//!
//! ```ignore
//! use switchboard::{Dispatch, Model, Scope, Switchboard, StreamExt, Wiring};
//!
//! // 1. Define observable state
//! #[derive(Clone, PartialEq, Debug, Default)]
//! struct CartState {
//!     items: Vec<String>,
//!     submitted: bool,
//! }
//!
//! // 2. Define the model and wire its actions
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
//!         w.mutator("add_item", |draft, sku: &String| {
//!             draft.items.push(sku.clone());
//!         });
//!         w.reducer("submit", |state, _: &()| CartState {
//!             submitted: true,
//!             ..state
//!         });
//!         w.effect("checkout", |input, _state| {
//!             Ok(input.map(|payload| Ok(Dispatch::own("submit", payload))))
//!         });
//!     }
//! }
//!
//! // 3. Create a scoped instance and bind it
//! let board = Switchboard::new();
//! let cart = board.get_or_create(Scope::named("cart:42"), || CartModel);
//! let pipeline = cart.bind()?;
//!
//! // 4. Trigger actions and observe state
//! pipeline.send("add_item", "sku-1".to_string())?;
//! assert_eq!(pipeline.state().items, vec!["sku-1"]);
//!
//! // 5. Effects run on the branch task and chain back in
//! pipeline.send("checkout", ())?;
//! ```
//!
//! ## What This Is Not
//!
//! Switchboard is **not**:
//! - Full event sourcing
//! - An actor framework
//! - A persistence layer
//! - A UI binding toolkit
//!
//! Switchboard **is**:
//! > An action orchestration layer where models hold observable state,
//! > reducers apply synchronously, and effects chain actions across scoped
//! > instances.

// Core modules
mod core;
mod draft;
mod error;
mod logger;
mod model;
mod pipeline;
mod registry;
mod state;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Stress tests (test-only)
#[cfg(test)]
mod stress_tests;

// Re-export core types
pub use crate::core::{Dispatch, DispatchTarget, Payload, Scope};

// Re-export draft helpers (copy-on-write transitions)
pub use crate::draft::revise;

// Re-export error types
pub use crate::error::PipelineError;

// Re-export logging types
pub use crate::logger::{ActionLogger, LogRecord, TracingLogger};

// Re-export model types
pub use crate::model::{ActionStream, Model, Wiring};

// Re-export pipeline types (one engine per bound instance)
pub use crate::pipeline::Pipeline;

// Re-export registry types (primary entry point)
pub use crate::registry::{ModelHandle, ModelRef, Switchboard, SwitchboardBuilder};

// Re-export state types
pub use crate::state::{StateCell, StateWatch, Subscription};

// Re-export commonly used external types
pub use futures::{Stream, StreamExt};
