pub mod defs;
pub mod empty;
pub mod state;

pub use defs::*;
pub use empty::{NoBacklog, NoEstimates};
pub use state::TaskStore;
