//! MIAM drawer execution layer.
//!
//! Pure logic shared by the server and tests: the [`draw`] engine that turns a
//! participant list into a single gift-giving ring, and the [`Registry`] state
//! machine that owns every rule about registration, deadlines and draws.
//!
//! ## Determinism
//! Nothing here reads the clock or the OS random source. Callers pass `now` and
//! an `Rng`, so tests can drive every path with a seeded `StdRng`.
//!
//! ```rust,ignore
//! use miam_execution::{Registry, mocks::create_new_participant};
//! use rand::{rngs::StdRng, SeedableRng};
//!
//! let now = chrono::Utc::now();
//! let mut registry = Registry::new(now);
//! for index in 0..3 {
//!     registry.register(create_new_participant(index), now)?;
//! }
//! let draw = registry.perform_draw(&mut StdRng::seed_from_u64(7), false, now)?;
//! assert_eq!(draw.assignments.len(), 3);
//! ```

pub mod deadline;
pub mod draw;
pub mod registry;

#[cfg(any(test, feature = "mocks"))]
pub mod mocks;

pub use draw::{
    draw, draw_with_attempts, verify_assignments, AssignmentError, Draw, DrawError,
    MAX_DRAW_ATTEMPTS,
};
pub use registry::{Registry, RegistryError};
