//! State document model, loader/indexer, and compiler: components A-through-E
//! of the configuration-management engine, minus the ordered tree and
//! reference set themselves (split out into the `otree` and `refset` crates
//! so the runner can depend on the tree shape without pulling in the
//! compiler).

pub mod compiler;
mod error;
pub mod loader;
pub mod model;

pub use compiler::{Compiler, PumpState};
pub use error::Error;
pub use loader::{Indexer, StateMeta};
pub use model::{ExecutionTree, StateDoc};
