//! labgrid engine — owns the instance lifecycle.
//!
//! A create request passes admission, is persisted as `creating`, and is
//! dispatched to the backend matching the challenge kind. Stop, delete and
//! the expiry reconciler share one teardown path; whichever caller moves
//! the row out of its current status first performs the teardown.
//!
//! # Components
//!
//! - **`admission`** — `AdmissionController` (owner cap, single active instance, cooldowns)
//! - **`manager`** — `InstanceManager`, the state machine and challenge catalogue
//! - **`reconciler`** — `Reconciler`, the periodic expiry sweep

pub mod admission;
pub mod error;
pub mod manager;
pub mod reconciler;

pub use admission::AdmissionController;
pub use error::{AdmissionError, EngineError, EngineResult};
pub use manager::{InstanceManager, ManagerSettings, StopOutcome};
pub use reconciler::{Reconciler, SweepReport};
