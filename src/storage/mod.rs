pub mod state;

pub use state::{Checkpoint, StateError, StateStore};
