//! Upload storage engine: working-directory layout, per-upload locks,
//! offset-tracked payload storage and admission control

pub mod locks;
pub mod paths;
pub mod queue;
pub mod store;

pub use locks::*;
pub use paths::*;
pub use queue::*;
pub use store::*;
