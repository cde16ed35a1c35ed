//! Views derived from feed snapshots: setup completeness and tasks due soon.

mod engine;
mod setup;
mod task_window;

pub use engine::{
    derive, spawn_debounced, Clock, DerivedState, DerivedStateEngine, ManualClock, SystemClock,
};
pub use setup::{evaluate as evaluate_setup, is_placeholder_name, SetupItem, SetupStatus};
pub use task_window::{filter as filter_due_soon, DueSoonTask, TimeRemaining};
